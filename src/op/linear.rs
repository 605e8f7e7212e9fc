use nalgebra::{DMatrix, DMatrixView, DVector};
use num_traits::{One, Zero};

use crate::{Op, Scalar, VectorField, VectorFieldAdjoint};

use super::{OpStatistics, StatisticsCounter};

/// The linear vector field `f(t, x) = A x`.
///
/// The parameters are the entries of `A` in column-major order, so `nparams() == n * n`. The exact flow is
/// `x(t) = exp(A t) x0`, which makes this field the reference problem for checking accuracy and gradients.
#[derive(Clone, Debug)]
pub struct LinearField<T: Scalar> {
    n: usize,
    p: DVector<T>,
    statistics: StatisticsCounter,
}

impl<T: Scalar> LinearField<T> {
    pub fn new(a: &DMatrix<T>) -> Self {
        assert_eq!(a.nrows(), a.ncols(), "LinearField needs a square matrix");
        Self {
            n: a.nrows(),
            p: DVector::from_column_slice(a.as_slice()),
            statistics: StatisticsCounter::default(),
        }
    }

    pub fn matrix(&self) -> DMatrixView<'_, T> {
        DMatrixView::from_slice(self.p.as_slice(), self.n, self.n)
    }
}

impl<T: Scalar> Op for LinearField<T> {
    type T = T;

    fn nstates(&self) -> usize {
        self.n
    }

    fn nparams(&self) -> usize {
        self.n * self.n
    }

    fn statistics(&self) -> OpStatistics {
        self.statistics.snapshot()
    }
}

impl<T: Scalar> VectorField for LinearField<T> {
    fn call_inplace(&self, x: &DVector<T>, _t: T, y: &mut DVector<T>) {
        self.statistics.increment_call();
        y.gemv(T::one(), &self.matrix(), x, T::zero());
    }
}

impl<T: Scalar> VectorFieldAdjoint for LinearField<T> {
    fn vjp_inplace(
        &self,
        x: &DVector<T>,
        _t: T,
        seed: &DVector<T>,
        grad_x: &mut DVector<T>,
        grad_p: &mut DVector<T>,
    ) {
        self.statistics.increment_vjp();
        grad_x.gemv_tr(T::one(), &self.matrix(), seed, T::zero());
        // d(v^T A x)/dA_ij = v_i x_j, stored column-major
        for j in 0..self.n {
            for i in 0..self.n {
                grad_p[i + j * self.n] = seed[i] * x[j];
            }
        }
    }

    fn params(&self) -> &DVector<T> {
        &self.p
    }

    fn set_params(&mut self, p: &DVector<T>) {
        self.p.copy_from(p);
    }
}
