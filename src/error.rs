use thiserror::Error;

/// Custom error type for Nodesol
///
/// This error type is used to wrap all possible errors that can occur when using Nodesol
#[derive(Error, Debug)]
pub enum NodesolError {
    #[error("ODE solver error: {0}")]
    OdeSolverError(#[from] OdeSolverError),
    #[error("Layer error: {0}")]
    LayerError(#[from] LayerError),
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors that can occur when integrating an ODE.
///
/// The fatal integration failures (`ShapeMismatch`, `StepSizeUnderflow`, `MaxStepsExceeded`,
/// `NonFiniteState`) always carry the time and the index of the step attempt at which they
/// occurred. They are never retried internally.
#[derive(Debug, Error)]
pub enum OdeSolverError {
    #[error(
        "Vector field produced length {found} but the state has length {expected} at time = {time} (step {step_index})"
    )]
    ShapeMismatch {
        time: f64,
        step_index: usize,
        expected: usize,
        found: usize,
    },
    #[error("Step size {step_size:e} underflowed at time = {time} (step {step_index})")]
    StepSizeUnderflow {
        time: f64,
        step_index: usize,
        step_size: f64,
        state: Vec<f64>,
    },
    #[error(
        "Exceeded maximum number of steps ({max_steps}) at time = {time} (step {step_index}) before reaching t = {target}"
    )]
    MaxStepsExceeded {
        time: f64,
        step_index: usize,
        max_steps: usize,
        target: f64,
        outputs: Vec<Vec<f64>>,
    },
    #[error("Non-finite value in state at time = {time} (step {step_index})")]
    NonFiniteState {
        time: f64,
        step_index: usize,
        state: Vec<f64>,
    },
    #[error("Stop time = {stop_time} is before current state time = {state_time}")]
    StopTimeBeforeCurrentTime { stop_time: f64, state_time: f64 },
    #[error("Stop time is at the current state time")]
    StopTimeAtCurrentTime,
    #[error("Interpolation vector is not the correct length, expected {expected}, got {found}")]
    InterpolationVectorWrongSize { expected: usize, found: usize },
    #[error("Interpolation time is not within the last accepted step")]
    InterpolationTimeOutsideCurrentStep,
    #[error("Output times must be strictly monotonic and start at the initial time")]
    InvalidTEval,
    #[error("Invalid tolerance: {0}")]
    InvalidTolerance(String),
    #[error("Invalid Tableau: {0}")]
    InvalidTableau(String),
    #[error("Number of gradients ({found}) does not match number of output times ({expected})")]
    GradientCountMismatch { expected: usize, found: usize },
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors from misuse of an [crate::OdeLayer]
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("backward called before forward")]
    BackwardBeforeForward,
    #[error("Integration span is empty: t0 = {t0}, t1 = {t1}")]
    EmptySpan { t0: f64, t1: f64 },
    #[error("Parameter vector has length {found}, expected {expected}")]
    WrongParameterLength { expected: usize, found: usize },
    #[error("Batch has {found} gradients but the last forward pass had {expected} elements")]
    BatchSizeMismatch { expected: usize, found: usize },
}

#[macro_export]
macro_rules! ode_solver_error {
    ($variant:ident) => {
        NodesolError::from(OdeSolverError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        NodesolError::from(OdeSolverError::$variant($($arg)*.to_string()))
    };
}

#[macro_export]
macro_rules! layer_error {
    ($variant:ident) => {
        NodesolError::from(LayerError::$variant)
    };
}

#[macro_export]
macro_rules! other_error {
    ($msg:expr) => {
        NodesolError::Other($msg.to_string())
    };
}
