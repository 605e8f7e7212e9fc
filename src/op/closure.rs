use nalgebra::DVector;
use num_traits::Zero;

use crate::{Op, Scalar, VectorField, VectorFieldAdjoint};

use super::{OpStatistics, StatisticsCounter};

/// A vector field built from closures.
///
/// `func(x, p, t, y)` writes `f(t, x; p)` into `y`, and `vjp(x, p, t, seed, grad_x, grad_p)` writes the
/// vector-Jacobian products with respect to `x` and `p`.
///
/// Unless [Closure::with_vjp_time] supplies `seed^T ∂f/∂t`, the field is treated as autonomous by the adjoint. A
/// closure that reads `t` without it gets wrong time gradients ([crate::AdjointGradients::grad_t]); the state and
/// parameter gradients do not depend on it.
pub struct Closure<T, F, G>
where
    T: Scalar,
    F: Fn(&DVector<T>, &DVector<T>, T, &mut DVector<T>),
    G: Fn(&DVector<T>, &DVector<T>, T, &DVector<T>, &mut DVector<T>, &mut DVector<T>),
{
    func: F,
    vjp: G,
    vjp_time: Option<VjpTime<T>>,
    nstates: usize,
    p: DVector<T>,
    statistics: StatisticsCounter,
}

type VjpTime<T> = Box<dyn Fn(&DVector<T>, &DVector<T>, T, &DVector<T>) -> T + Send + Sync>;

impl<T, F, G> Closure<T, F, G>
where
    T: Scalar,
    F: Fn(&DVector<T>, &DVector<T>, T, &mut DVector<T>),
    G: Fn(&DVector<T>, &DVector<T>, T, &DVector<T>, &mut DVector<T>, &mut DVector<T>),
{
    pub fn new(func: F, vjp: G, nstates: usize, p: DVector<T>) -> Self {
        Self {
            func,
            vjp,
            vjp_time: None,
            nstates,
            p,
            statistics: StatisticsCounter::default(),
        }
    }

    /// Set `vjp_time(x, p, t, seed)`, returning `seed^T ∂f/∂t`.
    pub fn with_vjp_time(
        mut self,
        vjp_time: impl Fn(&DVector<T>, &DVector<T>, T, &DVector<T>) -> T + Send + Sync + 'static,
    ) -> Self {
        self.vjp_time = Some(Box::new(vjp_time));
        self
    }

    pub fn reset_statistics(&self) {
        self.statistics.reset();
    }
}

impl<T, F, G> Op for Closure<T, F, G>
where
    T: Scalar,
    F: Fn(&DVector<T>, &DVector<T>, T, &mut DVector<T>),
    G: Fn(&DVector<T>, &DVector<T>, T, &DVector<T>, &mut DVector<T>, &mut DVector<T>),
{
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

impl<T, F, G> VectorField for Closure<T, F, G>
where
    T: Scalar,
    F: Fn(&DVector<T>, &DVector<T>, T, &mut DVector<T>),
    G: Fn(&DVector<T>, &DVector<T>, T, &DVector<T>, &mut DVector<T>, &mut DVector<T>),
{
    fn call_inplace(&self, x: &DVector<T>, t: T, y: &mut DVector<T>) {
        self.statistics.increment_call();
        (self.func)(x, &self.p, t, y)
    }
}

impl<T, F, G> VectorFieldAdjoint for Closure<T, F, G>
where
    T: Scalar,
    F: Fn(&DVector<T>, &DVector<T>, T, &mut DVector<T>),
    G: Fn(&DVector<T>, &DVector<T>, T, &DVector<T>, &mut DVector<T>, &mut DVector<T>),
{
    fn vjp_inplace(
        &self,
        x: &DVector<T>,
        t: T,
        seed: &DVector<T>,
        grad_x: &mut DVector<T>,
        grad_p: &mut DVector<T>,
    ) {
        self.statistics.increment_vjp();
        (self.vjp)(x, &self.p, t, seed, grad_x, grad_p)
    }

    fn vjp_time(&self, x: &DVector<T>, t: T, seed: &DVector<T>) -> T {
        match &self.vjp_time {
            Some(vjp_time) => vjp_time(x, &self.p, t, seed),
            None => T::zero(),
        }
    }

    fn params(&self) -> &DVector<T> {
        &self.p
    }

    fn set_params(&mut self, p: &DVector<T>) {
        self.p.copy_from(p);
    }
}
