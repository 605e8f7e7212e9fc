use serde::{Deserialize, Serialize};
use num_traits::Zero;

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error,
    scalar::constant,
    Scalar,
};

/// Tolerances, step controller constants and budgets for [crate::ExplicitRk].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitRkConfig<T> {
    pub rtol: T,
    pub atol: T,
    /// Initial step size magnitude. Selected from the problem when `None`.
    pub h0: Option<T>,
    /// Steps attempted (accepted or rejected) between two consecutive output times before giving up.
    pub max_steps: usize,
    /// Proposed steps below this magnitude are reported as [OdeSolverError::StepSizeUnderflow].
    pub minimum_timestep: T,
    pub maximum_timestep_growth: T,
    pub minimum_timestep_shrink: T,
    pub safety_factor: T,
    /// Number of independent, equally sized systems stacked in the state. The error norm is the worst one.
    pub batch_size: usize,
}

impl<T: Scalar> Default for ExplicitRkConfig<T> {
    fn default() -> Self {
        Self {
            rtol: constant(1e-3),
            atol: constant(1e-4),
            h0: None,
            max_steps: 10_000,
            minimum_timestep: constant(1e-13),
            maximum_timestep_growth: constant(10.0),
            minimum_timestep_shrink: constant(0.2),
            safety_factor: constant(0.9),
            batch_size: 1,
        }
    }
}

impl<T: Scalar> ExplicitRkConfig<T> {
    pub fn with_tolerances(mut self, rtol: T, atol: T) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_h0(mut self, h0: T) -> Self {
        self.h0 = Some(h0);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), NodesolError> {
        let zero = T::zero();
        if !(self.rtol >= zero && self.atol >= zero) || !self.rtol.is_finite() || !self.atol.is_finite()
        {
            return Err(ode_solver_error!(
                InvalidTolerance,
                format!(
                    "tolerances must be finite and non-negative, got rtol = {}, atol = {}",
                    self.rtol, self.atol
                )
            ));
        }
        if self.rtol == zero && self.atol == zero {
            return Err(ode_solver_error!(
                InvalidTolerance,
                "rtol and atol cannot both be zero"
            ));
        }
        if let Some(h0) = self.h0 {
            if h0 == zero || !h0.is_finite() {
                return Err(ode_solver_error!(
                    InvalidTolerance,
                    format!("initial step size must be finite and non-zero, got {h0}")
                ));
            }
        }
        if self.batch_size == 0 {
            return Err(ode_solver_error!(Other, "batch_size must be at least one"));
        }
        Ok(())
    }
}
