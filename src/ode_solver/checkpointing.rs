use nalgebra::DVector;
use num_traits::One;

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error,
    scalar::constant,
    Scalar,
};

/// Hermite interpolator for ODE solution trajectories.
///
/// Stores the solution value and derivative at every accepted step of a forward solve, and evaluates the
/// trajectory anywhere in between with cubic Hermite interpolation. The adjoint solver uses it to recover the
/// forward state during the backward pass instead of integrating the forward system in reverse.
#[derive(Clone, Debug)]
pub struct HermiteInterpolator<T: Scalar> {
    ys: Vec<DVector<T>>,
    ydots: Vec<DVector<T>>,
    ts: Vec<T>,
}

impl<T: Scalar> Default for HermiteInterpolator<T> {
    fn default() -> Self {
        HermiteInterpolator {
            ys: Vec::new(),
            ydots: Vec::new(),
            ts: Vec::new(),
        }
    }
}

impl<T: Scalar> HermiteInterpolator<T> {
    /// Create a new Hermite interpolator with the given solution data.
    ///
    /// All three vectors must have the same length and the time points must be strictly monotonic.
    pub fn new(ys: Vec<DVector<T>>, ydots: Vec<DVector<T>>, ts: Vec<T>) -> Self {
        assert_eq!(ys.len(), ts.len());
        assert_eq!(ydots.len(), ts.len());
        HermiteInterpolator { ys, ydots, ts }
    }

    /// Append a point. Points with the same time as the last one are ignored.
    pub fn push(&mut self, t: T, y: &DVector<T>, dy: &DVector<T>) {
        if self.last_t() == Some(t) {
            return;
        }
        self.ts.push(t);
        self.ys.push(y.clone());
        self.ydots.push(dy.clone());
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    pub fn first_t(&self) -> Option<T> {
        self.ts.first().copied()
    }

    pub fn last_t(&self) -> Option<T> {
        self.ts.last().copied()
    }

    /// Interpolate the solution at time `t` into `y`.
    pub fn interpolate(&self, t: T, y: &mut DVector<T>) -> Result<(), NodesolError> {
        let (Some(first), Some(last)) = (self.first_t(), self.last_t()) else {
            return Err(ode_solver_error!(InterpolationTimeOutsideCurrentStep));
        };
        if y.len() != self.ys[0].len() {
            return Err(NodesolError::from(
                OdeSolverError::InterpolationVectorWrongSize {
                    expected: self.ys[0].len(),
                    found: y.len(),
                },
            ));
        }
        if self.ts.len() == 1 || t == first {
            y.copy_from(&self.ys[0]);
            return Ok(());
        }
        let is_forward = last > first;
        let troundoff = constant::<T>(100.0) * T::EPSILON * (first.abs() + last.abs());
        if (is_forward && (t < first - troundoff || t > last + troundoff))
            || (!is_forward && (t > first + troundoff || t < last - troundoff))
        {
            return Err(ode_solver_error!(InterpolationTimeOutsideCurrentStep));
        }

        // index of the first point at or beyond t in the direction of integration
        let idx = if is_forward {
            self.ts.partition_point(|&ti| ti < t)
        } else {
            self.ts.partition_point(|&ti| ti > t)
        }
        .clamp(1, self.ts.len() - 1);

        let t0 = self.ts[idx - 1];
        let t1 = self.ts[idx];
        let h = t1 - t0;
        let theta = (t - t0) / h;
        let u0 = &self.ys[idx - 1];
        let u1 = &self.ys[idx];
        let f0 = &self.ydots[idx - 1];
        let f1 = &self.ydots[idx];
        let one = T::one();

        y.copy_from(u1);
        *y -= u0;
        y.axpy(h * (theta - one), f0, one - constant::<T>(2.0) * theta);
        y.axpy(h * theta, f1, one);
        y.axpy(one - theta, u0, theta * (theta - one));
        y.axpy(theta, u1, one);
        Ok(())
    }
}
