pub mod constant_rate;
pub mod exponential_decay;
pub mod oscillator;
