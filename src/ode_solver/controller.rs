use num_traits::{One, Zero};

use crate::{scalar::constant, ExplicitRkConfig, Scalar};

/// Outcome of a step attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepDecision<T> {
    /// Keep the step and continue with `next_step`.
    Accept { next_step: T },
    /// Discard the step and retry from the same state with `next_step`.
    Reject { next_step: T },
}

impl<T: Copy> StepDecision<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StepDecision::Accept { .. })
    }

    pub fn next_step(&self) -> T {
        match self {
            StepDecision::Accept { next_step } | StepDecision::Reject { next_step } => *next_step,
        }
    }
}

/// The proposed step was zero, non-finite or below the configured floor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepSizeUnderflow<T> {
    pub proposed: T,
}

/// Standard elementary step size controller.
///
/// Given the error ratio `r` (the scaled error norm of the attempt, accepted iff `r <= 1`), the next step is
/// `h * clamp(safety * r^(-1 / (order + 1)), min_factor, max_factor)`. A zero error ratio grows the step by the
/// maximum factor.
#[derive(Clone, Debug)]
pub struct StepController<T> {
    safety: T,
    min_factor: T,
    max_factor: T,
    minimum_timestep: T,
}

impl<T: Scalar> StepController<T> {
    pub fn new(config: &ExplicitRkConfig<T>) -> Self {
        Self {
            safety: config.safety_factor,
            min_factor: config.minimum_timestep_shrink,
            max_factor: config.maximum_timestep_growth,
            minimum_timestep: config.minimum_timestep,
        }
    }

    fn factor(&self, error_ratio: T, order: usize) -> T {
        if !error_ratio.is_finite() {
            return self.min_factor;
        }
        if error_ratio == T::zero() {
            return self.max_factor;
        }
        let exponent = -T::one() / constant::<T>(order as f64 + 1.0);
        let factor = self.safety * error_ratio.powf(exponent);
        factor.max(self.min_factor).min(self.max_factor)
    }

    /// Decide whether to keep a step of size `h` with the given error ratio, and propose the next step (with the
    /// sign of `h`).
    pub fn propose_next(
        &self,
        error_ratio: T,
        h: T,
        order: usize,
    ) -> Result<StepDecision<T>, StepSizeUnderflow<T>> {
        let accepted = error_ratio <= T::one();
        let next_step = h * self.factor(error_ratio, order);
        if next_step == T::zero()
            || !next_step.is_finite()
            || next_step.abs() < self.minimum_timestep
        {
            return Err(StepSizeUnderflow {
                proposed: next_step,
            });
        }
        if accepted {
            Ok(StepDecision::Accept { next_step })
        } else {
            Ok(StepDecision::Reject { next_step })
        }
    }
}
