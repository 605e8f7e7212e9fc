use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error,
    scalar::constant,
    Scalar,
};

/// State of an explicit Runge-Kutta solver between steps.
#[derive(Clone, Debug)]
pub struct RkState<T: Scalar> {
    pub y: DVector<T>,
    /// `f(t, y)`, reused as the first stage of the next step.
    pub dy: DVector<T>,
    pub t: T,
    /// Step size to try next. Zero until a direction of integration is known.
    pub h: T,
}

impl<T: Scalar> RkState<T> {
    pub fn new(y: DVector<T>, dy: DVector<T>, t: T) -> Self {
        Self {
            y,
            dy,
            t,
            h: T::zero(),
        }
    }
}

/// The last accepted step, kept so that the solution can be evaluated anywhere inside it.
///
/// `diff` holds the scaled stage derivatives `h * k_i` as columns.
#[derive(Clone, Debug)]
pub struct StepRecord<T: Scalar> {
    pub t_start: T,
    pub t_end: T,
    pub y_start: DVector<T>,
    pub y_end: DVector<T>,
    pub diff: DMatrix<T>,
}

impl<T: Scalar> StepRecord<T> {
    pub fn new(y: &DVector<T>, t: T, nstages: usize) -> Self {
        Self {
            t_start: t,
            t_end: t,
            y_start: y.clone(),
            y_end: y.clone(),
            diff: DMatrix::zeros(y.len(), nstages),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.t_start == self.t_end
    }

    pub fn interpolate_inplace(
        &self,
        t: T,
        beta: Option<&DMatrix<T>>,
        y: &mut DVector<T>,
    ) -> Result<(), NodesolError> {
        if y.len() != self.y_end.len() {
            return Err(NodesolError::from(
                OdeSolverError::InterpolationVectorWrongSize {
                    expected: self.y_end.len(),
                    found: y.len(),
                },
            ));
        }
        // endpoints are returned exactly
        if t == self.t_end {
            y.copy_from(&self.y_end);
            return Ok(());
        }
        if t == self.t_start {
            y.copy_from(&self.y_start);
            return Ok(());
        }
        let dt = self.t_end - self.t_start;
        let troundoff = constant::<T>(100.0) * T::EPSILON * (self.t_end.abs() + dt.abs());
        let is_forward = dt > T::zero();
        if self.is_empty()
            || (is_forward && (t > self.t_end + troundoff || t < self.t_start - troundoff))
            || (!is_forward && (t < self.t_end - troundoff || t > self.t_start + troundoff))
        {
            return Err(ode_solver_error!(InterpolationTimeOutsideCurrentStep));
        }
        let theta = ((t - self.t_start) / dt).max(T::zero()).min(T::one());
        match beta {
            Some(beta) => self.interpolate_continuous_extension(theta, beta, y),
            None => self.interpolate_hermite(theta, y),
        }
        Ok(())
    }

    fn interpolate_continuous_extension(&self, theta: T, beta: &DMatrix<T>, y: &mut DVector<T>) {
        let poly_order = beta.ncols();
        let mut thetav = DVector::zeros(poly_order);
        thetav[0] = theta;
        for i in 1..poly_order {
            thetav[i] = theta * thetav[i - 1];
        }
        // y = y0 + sum_i (beta * thetav)[i] * diff[:, i]
        let beta_f = beta * thetav;
        y.copy_from(&self.y_start);
        y.gemv(T::one(), &self.diff, &beta_f, T::one());
    }

    /// Cubic Hermite interpolation between the step endpoints, using the first and last stage derivatives
    /// (the last stage of a first-same-as-last method is evaluated at the end of the step).
    fn interpolate_hermite(&self, theta: T, y: &mut DVector<T>) {
        let f0 = self.diff.column(0);
        let f1 = self.diff.column(self.diff.ncols() - 1);
        let two = constant::<T>(2.0);

        y.copy_from(&self.y_end);
        *y -= &self.y_start;
        y.axpy(theta - T::one(), &f0, T::one() - two * theta);
        y.axpy(theta, &f1, T::one());
        y.axpy(T::one() - theta, &self.y_start, theta * (theta - T::one()));
        y.axpy(theta, &self.y_end, T::one());
    }
}
