use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::DVector;
use num_traits::Zero;
use serde::Serialize;

use crate::Scalar;

pub mod closure;
pub mod linear;

/// A generic operator trait.
///
/// Op defines the number of states (i.e. length of `x`), the number of outputs (i.e. length of `y`) and the number of
/// parameters (i.e. length of `p`) of an operator, and the scalar type it works with.
pub trait Op {
    type T: Scalar;

    /// Return the number of input states of the operator.
    fn nstates(&self) -> usize;

    /// Return the number of outputs of the operator.
    fn nout(&self) -> usize {
        self.nstates()
    }

    /// Return the number of parameters of the operator.
    fn nparams(&self) -> usize {
        0
    }

    /// Return statistics about the operator (e.g. how many times it was called)
    fn statistics(&self) -> OpStatistics {
        OpStatistics::default()
    }
}

/// The right-hand side `f(t, x; p)` of an ODE `dx/dt = f(t, x; p)`.
///
/// Implementations must write exactly `nout()` values and must not change the length of `y`; the integrators
/// report a [crate::error::OdeSolverError::ShapeMismatch] otherwise.
pub trait VectorField: Op {
    /// Compute `y = f(t, x)`.
    fn call_inplace(&self, x: &DVector<Self::T>, t: Self::T, y: &mut DVector<Self::T>);

    fn call(&self, x: &DVector<Self::T>, t: Self::T) -> DVector<Self::T> {
        let mut y = DVector::zeros(self.nout());
        self.call_inplace(x, t, &mut y);
        y
    }
}

/// Vector-Jacobian products of a learned vector field, plus access to its parameters.
///
/// This is all the adjoint method needs: it never forms a full Jacobian.
pub trait VectorFieldAdjoint: VectorField {
    /// Compute `grad_x = seed^T ∂f/∂x` and `grad_p = seed^T ∂f/∂p` at `(t, x)`.
    ///
    /// Both outputs are overwritten, not accumulated into.
    fn vjp_inplace(
        &self,
        x: &DVector<Self::T>,
        t: Self::T,
        seed: &DVector<Self::T>,
        grad_x: &mut DVector<Self::T>,
        grad_p: &mut DVector<Self::T>,
    );

    fn vjp(&self, x: &DVector<Self::T>, t: Self::T, seed: &DVector<Self::T>) -> Vjp<Self::T> {
        let mut grad_x = DVector::zeros(self.nstates());
        let mut grad_params = DVector::zeros(self.nparams());
        self.vjp_inplace(x, t, seed, &mut grad_x, &mut grad_params);
        Vjp {
            grad_x,
            grad_params,
        }
    }

    /// `seed^T ∂f/∂t`. Autonomous fields can rely on the default of zero.
    fn vjp_time(&self, _x: &DVector<Self::T>, _t: Self::T, _seed: &DVector<Self::T>) -> Self::T {
        Self::T::zero()
    }

    fn params(&self) -> &DVector<Self::T>;

    /// Replace the parameter vector. `p.len()` is checked by callers against [Op::nparams].
    fn set_params(&mut self, p: &DVector<Self::T>);
}

/// Result of a vector-Jacobian product.
#[derive(Debug, Clone)]
pub struct Vjp<T: Scalar> {
    pub grad_x: DVector<T>,
    pub grad_params: DVector<T>,
}

#[derive(Default, Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OpStatistics {
    pub number_of_calls: usize,
    pub number_of_vjps: usize,
}

/// Thread-safe call counters backing [OpStatistics].
#[derive(Default, Debug)]
pub struct StatisticsCounter {
    calls: AtomicUsize,
    vjps: AtomicUsize,
}

impl StatisticsCounter {
    pub fn increment_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_vjp(&self) {
        self.vjps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.vjps.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OpStatistics {
        OpStatistics {
            number_of_calls: self.calls.load(Ordering::Relaxed),
            number_of_vjps: self.vjps.load(Ordering::Relaxed),
        }
    }
}

impl Clone for StatisticsCounter {
    fn clone(&self) -> Self {
        let stats = self.snapshot();
        Self {
            calls: AtomicUsize::new(stats.number_of_calls),
            vjps: AtomicUsize::new(stats.number_of_vjps),
        }
    }
}
