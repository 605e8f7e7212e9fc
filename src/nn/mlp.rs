use nalgebra::{DMatrixView, DMatrixViewMut, DVector, DVectorView};
use num_traits::{One, Zero};
use rand::{
    distr::{Distribution, Uniform},
    Rng,
};

use crate::{
    error::{LayerError, NodesolError},
    op::{OpStatistics, StatisticsCounter},
    other_error,
    scalar::constant,
    Op, Scalar, VectorField, VectorFieldAdjoint,
};

/// A time-conditioned two layer perceptron used as a learned vector field:
///
/// ```text
/// f(t, x) = W2 tanh(W1 [x; t] + b1) + b2
/// ```
///
/// The parameter vector is `[vec(W1), b1, vec(W2), b2]`, matrices stored column-major.
#[derive(Clone, Debug)]
pub struct Mlp<T: Scalar> {
    nstates: usize,
    hidden: usize,
    p: DVector<T>,
    statistics: StatisticsCounter,
}

struct Forward<T: Scalar> {
    z: DVector<T>,
    h: DVector<T>,
}

impl<T: Scalar> Mlp<T> {
    pub fn nparams_for(nstates: usize, hidden: usize) -> usize {
        hidden * (nstates + 1) + hidden + nstates * hidden + nstates
    }

    /// Initialise weights uniformly in `±1/sqrt(fan_in)` and biases to zero.
    pub fn new(nstates: usize, hidden: usize, rng: &mut impl Rng) -> Result<Self, NodesolError> {
        let mut p = DVector::zeros(Self::nparams_for(nstates, hidden));
        let w1_len = hidden * (nstates + 1);
        let w2_start = w1_len + hidden;
        let w2_len = nstates * hidden;
        for (range, fan_in) in [(0..w1_len, nstates + 1), (w2_start..w2_start + w2_len, hidden)] {
            let bound = 1.0 / (fan_in as f64).sqrt();
            let dist = Uniform::new(-bound, bound).map_err(|e| other_error!(e))?;
            for i in range {
                p[i] = constant(dist.sample(rng));
            }
        }
        Ok(Self {
            nstates,
            hidden,
            p,
            statistics: StatisticsCounter::default(),
        })
    }

    pub fn from_params(nstates: usize, hidden: usize, p: DVector<T>) -> Result<Self, NodesolError> {
        let expected = Self::nparams_for(nstates, hidden);
        if p.len() != expected {
            return Err(NodesolError::from(LayerError::WrongParameterLength {
                expected,
                found: p.len(),
            }));
        }
        Ok(Self {
            nstates,
            hidden,
            p,
            statistics: StatisticsCounter::default(),
        })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    #[allow(clippy::type_complexity)]
    fn layers(&self) -> (DMatrixView<'_, T>, DVectorView<'_, T>, DMatrixView<'_, T>, DVectorView<'_, T>) {
        let (n, h) = (self.nstates, self.hidden);
        let p = self.p.as_slice();
        let (w1, rest) = p.split_at(h * (n + 1));
        let (b1, rest) = rest.split_at(h);
        let (w2, b2) = rest.split_at(n * h);
        (
            DMatrixView::from_slice(w1, h, n + 1),
            DVectorView::from_slice(b1, h),
            DMatrixView::from_slice(w2, n, h),
            DVectorView::from_slice(b2, n),
        )
    }

    fn hidden_layer(&self, x: &DVector<T>, t: T) -> Forward<T> {
        let (w1, b1, _, _) = self.layers();
        let mut z = DVector::zeros(self.nstates + 1);
        z.rows_mut(0, self.nstates).copy_from(x);
        z[self.nstates] = t;
        let mut h = b1.into_owned();
        h.gemv(T::one(), &w1, &z, T::one());
        h.apply(|v| *v = v.tanh());
        Forward { z, h }
    }

    /// Backpropagate `seed` through the network. Returns the gradient with respect to `[x; t]` and writes the
    /// parameter gradient into `grad_p` when given.
    fn backward(
        &self,
        forward: &Forward<T>,
        seed: &DVector<T>,
        grad_p: Option<&mut DVector<T>>,
    ) -> DVector<T> {
        let (n, h) = (self.nstates, self.hidden);
        let (w1, _, w2, _) = self.layers();
        let mut g_pre = DVector::zeros(h);
        g_pre.gemv_tr(T::one(), &w2, seed, T::zero());
        g_pre.zip_apply(&forward.h, |g, hi| *g *= T::one() - hi * hi);

        if let Some(grad_p) = grad_p {
            let (gw1, rest) = grad_p.as_mut_slice().split_at_mut(h * (n + 1));
            let (gb1, rest) = rest.split_at_mut(h);
            let (gw2, gb2) = rest.split_at_mut(n * h);
            DMatrixViewMut::from_slice(gw1, h, n + 1).ger(T::one(), &g_pre, &forward.z, T::zero());
            gb1.copy_from_slice(g_pre.as_slice());
            DMatrixViewMut::from_slice(gw2, n, h).ger(T::one(), seed, &forward.h, T::zero());
            gb2.copy_from_slice(seed.as_slice());
        }

        let mut g_z = DVector::zeros(n + 1);
        g_z.gemv_tr(T::one(), &w1, &g_pre, T::zero());
        g_z
    }
}

impl<T: Scalar> Op for Mlp<T> {
    type T = T;

    fn nstates(&self) -> usize {
        self.nstates
    }

    fn nparams(&self) -> usize {
        self.p.len()
    }

    fn statistics(&self) -> OpStatistics {
        self.statistics.snapshot()
    }
}

impl<T: Scalar> VectorField for Mlp<T> {
    fn call_inplace(&self, x: &DVector<T>, t: T, y: &mut DVector<T>) {
        self.statistics.increment_call();
        let forward = self.hidden_layer(x, t);
        let (_, _, w2, b2) = self.layers();
        y.copy_from(&b2);
        y.gemv(T::one(), &w2, &forward.h, T::one());
    }
}

impl<T: Scalar> VectorFieldAdjoint for Mlp<T> {
    fn vjp_inplace(
        &self,
        x: &DVector<T>,
        t: T,
        seed: &DVector<T>,
        grad_x: &mut DVector<T>,
        grad_p: &mut DVector<T>,
    ) {
        self.statistics.increment_vjp();
        let forward = self.hidden_layer(x, t);
        let g_z = self.backward(&forward, seed, Some(grad_p));
        grad_x.copy_from(&g_z.rows(0, self.nstates));
    }

    fn vjp_time(&self, x: &DVector<T>, t: T, seed: &DVector<T>) -> T {
        let forward = self.hidden_layer(x, t);
        self.backward(&forward, seed, None)[self.nstates]
    }

    fn params(&self) -> &DVector<T> {
        &self.p
    }

    fn set_params(&mut self, p: &DVector<T>) {
        self.p.copy_from(p);
    }
}
