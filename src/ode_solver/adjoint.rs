use std::cell::RefCell;

use nalgebra::DVector;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error, ExplicitRk, ExplicitRkConfig, HermiteInterpolator, Op, OpStatistics, Scalar,
    Tableau, VectorField, VectorFieldAdjoint,
};

/// How the backward pass recovers the forward state `x(t)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjointStrategy {
    /// Integrate `x` backwards alongside the adjoint from the terminal state. Memory use is independent of the
    /// number of forward steps, but the recovered `x` drifts from the forward one by roughly the solver
    /// tolerance.
    #[default]
    Reintegrate,
    /// Store the value and derivative at every forward step and interpolate them during the backward pass.
    Checkpointed,
}

/// Gradients of a scalar loss with respect to the inputs of an ODE solve.
#[derive(Clone, Debug)]
pub struct AdjointGradients<T: Scalar> {
    pub grad_y0: DVector<T>,
    pub grad_params: DVector<T>,
    /// `dL/dt_i` for every output time, the first entry being the initial time.
    pub grad_t: Vec<T>,
}

impl<T: Scalar> AdjointGradients<T> {
    pub fn grad_t0(&self) -> T {
        self.grad_t[0]
    }

    pub fn grad_t1(&self) -> T {
        self.grad_t[self.grad_t.len() - 1]
    }
}

/// A vector field output of the wrong length, seen while evaluating the adjoint equations.
#[derive(Clone, Copy, Debug)]
struct ShapeFault {
    time: f64,
    expected: usize,
    found: usize,
}

struct AdjointWork<T: Scalar> {
    x: DVector<T>,
    a: DVector<T>,
    fx: DVector<T>,
    grad_x: DVector<T>,
    grad_p: DVector<T>,
    fault: Option<ShapeFault>,
}

impl<T: Scalar> AdjointWork<T> {
    fn new(nstates: usize, nparams: usize) -> Self {
        Self {
            x: DVector::zeros(nstates),
            a: DVector::zeros(nstates),
            fx: DVector::zeros(nstates),
            grad_x: DVector::zeros(nstates),
            grad_p: DVector::zeros(nparams),
            fault: None,
        }
    }

    /// Record a wrong-length output and poison `y`, so the solver stops at this evaluation.
    fn fail(&mut self, t: T, expected: usize, found: usize, y: &mut DVector<T>) {
        self.fault.get_or_insert(ShapeFault {
            time: t.as_f64(),
            expected,
            found,
        });
        y.fill(T::NAN);
    }

    /// The solver only sees the poisoned output as a non-finite state; report the recorded fault instead.
    fn explain(&self, err: NodesolError) -> NodesolError {
        match (self.fault, err) {
            (
                Some(fault),
                NodesolError::OdeSolverError(OdeSolverError::NonFiniteState { step_index, .. }),
            ) => NodesolError::from(OdeSolverError::ShapeMismatch {
                time: fault.time,
                step_index,
                expected: fault.expected,
                found: fault.found,
            }),
            (_, err) => err,
        }
    }
}

/// Write `[-a^T df/dx, -a^T df/dp, -a^T df/dt]` into `y` starting at `offset`, given `x` and `a` in `work`.
fn adjoint_rhs<F: VectorFieldAdjoint>(
    field: &F,
    t: F::T,
    work: &mut AdjointWork<F::T>,
    y: &mut DVector<F::T>,
    offset: usize,
) {
    let AdjointWork {
        x,
        a,
        grad_x,
        grad_p,
        ..
    } = &mut *work;
    let (n, np) = (field.nstates(), field.nparams());
    field.vjp_inplace(x, t, a, grad_x, grad_p);
    let fault = if grad_x.len() != n {
        Some((n, grad_x.len()))
    } else if grad_p.len() != np {
        Some((np, grad_p.len()))
    } else {
        None
    };
    if let Some((expected, found)) = fault {
        grad_x.resize_vertically_mut(n, F::T::zero());
        grad_p.resize_vertically_mut(np, F::T::zero());
        work.fail(t, expected, found, y);
        return;
    }
    for i in 0..n {
        y[offset + i] = -grad_x[i];
    }
    for i in 0..np {
        y[offset + n + i] = -grad_p[i];
    }
    y[offset + n + np] = -field.vjp_time(x, t, a);
}

/// The forward system augmented with the adjoint equations, state `[x, a, a_p, a_t]`:
///
/// ```text
/// dx/dt   = f(t, x)
/// da/dt   = -a^T df/dx
/// da_p/dt = -a^T df/dp
/// da_t/dt = -a^T df/dt
/// ```
pub struct AugmentedAdjointField<'a, F: VectorFieldAdjoint> {
    field: &'a F,
    work: RefCell<AdjointWork<F::T>>,
}

impl<'a, F: VectorFieldAdjoint> AugmentedAdjointField<'a, F> {
    pub fn new(field: &'a F) -> Self {
        Self {
            field,
            work: RefCell::new(AdjointWork::new(field.nstates(), field.nparams())),
        }
    }

    /// Turn a solver failure caused by a wrong-length output of the wrapped field into a shape mismatch.
    pub fn explain(&self, err: NodesolError) -> NodesolError {
        self.work.borrow().explain(err)
    }
}

impl<F: VectorFieldAdjoint> Op for AugmentedAdjointField<'_, F> {
    type T = F::T;

    fn nstates(&self) -> usize {
        2 * self.field.nstates() + self.field.nparams() + 1
    }

    fn statistics(&self) -> OpStatistics {
        self.field.statistics()
    }
}

impl<F: VectorFieldAdjoint> VectorField for AugmentedAdjointField<'_, F> {
    fn call_inplace(&self, z: &DVector<F::T>, t: F::T, y: &mut DVector<F::T>) {
        let n = self.field.nstates();
        let mut work = self.work.borrow_mut();
        work.x.copy_from(&z.rows(0, n));
        work.a.copy_from(&z.rows(n, n));
        {
            let AdjointWork { x, fx, .. } = &mut *work;
            self.field.call_inplace(x, t, fx);
        }
        if work.fx.len() != n {
            let found = work.fx.len();
            work.fx.resize_vertically_mut(n, F::T::zero());
            work.fail(t, n, found, y);
            return;
        }
        y.rows_mut(0, n).copy_from(&work.fx);
        adjoint_rhs(self.field, t, &mut work, y, n);
    }
}

/// The adjoint equations alone, state `[a, a_p, a_t]`, with `x(t)` read from a forward trajectory.
pub struct CheckpointedAdjointField<'a, F: VectorFieldAdjoint> {
    field: &'a F,
    trajectory: &'a HermiteInterpolator<F::T>,
    work: RefCell<AdjointWork<F::T>>,
}

impl<'a, F: VectorFieldAdjoint> CheckpointedAdjointField<'a, F> {
    pub fn new(field: &'a F, trajectory: &'a HermiteInterpolator<F::T>) -> Self {
        Self {
            field,
            trajectory,
            work: RefCell::new(AdjointWork::new(field.nstates(), field.nparams())),
        }
    }

    /// See [AugmentedAdjointField::explain].
    pub fn explain(&self, err: NodesolError) -> NodesolError {
        self.work.borrow().explain(err)
    }
}

impl<F: VectorFieldAdjoint> Op for CheckpointedAdjointField<'_, F> {
    type T = F::T;

    fn nstates(&self) -> usize {
        self.field.nstates() + self.field.nparams() + 1
    }

    fn statistics(&self) -> OpStatistics {
        self.field.statistics()
    }
}

impl<F: VectorFieldAdjoint> VectorField for CheckpointedAdjointField<'_, F> {
    fn call_inplace(&self, z: &DVector<F::T>, t: F::T, y: &mut DVector<F::T>) {
        let n = self.field.nstates();
        let mut work = self.work.borrow_mut();
        if self.trajectory.interpolate(t, &mut work.x).is_err() {
            // the solver never leaves the forward time span, but a failure must not go unnoticed
            y.fill(F::T::NAN);
            return;
        }
        work.a.copy_from(&z.rows(0, n));
        adjoint_rhs(self.field, t, &mut work, y, 0);
    }
}

/// Computes gradients of a loss through an ODE solve by integrating the adjoint equations backwards in time.
///
/// The loss is assumed to depend on the solution only at a set of output times `t_0, ..., t_m`, through the
/// gradients `g_i = dL/dx(t_i)`. Starting from `a(t_m) = g_m`, the adjoint `a` is integrated back to `t_0`,
/// picking up `g_i` at each intermediate output time. The parameter gradient is accumulated along the way,
/// so no Jacobian of the vector field is ever formed.
pub struct AdjointGradientEngine<'a, F: VectorFieldAdjoint> {
    field: &'a F,
    tableau: Tableau<F::T>,
    config: ExplicitRkConfig<F::T>,
}

impl<'a, F: VectorFieldAdjoint> AdjointGradientEngine<'a, F> {
    pub fn new(field: &'a F, tableau: Tableau<F::T>, config: ExplicitRkConfig<F::T>) -> Self {
        // the augmented state is a single system, whatever the forward batching
        let config = config.with_batch_size(1);
        Self {
            field,
            tableau,
            config,
        }
    }

    /// Gradients for a loss that depends only on the terminal state `y1 = x(t1)` of a solve from `t0` to `t1`.
    pub fn backward(
        &self,
        t0: F::T,
        t1: F::T,
        y1: &DVector<F::T>,
        grad_y1: &DVector<F::T>,
    ) -> Result<AdjointGradients<F::T>, NodesolError> {
        let n = self.field.nstates();
        let grads = [DVector::zeros(n), grad_y1.clone()];
        let ys = [y1.clone(), y1.clone()];
        self.backward_dense(&[t0, t1], &ys, &grads)
    }

    /// Gradients for a loss depending on the solution at every time in `t_eval`.
    ///
    /// `ys[i]` is the forward solution at `t_eval[i]` and `grads[i]` the loss gradient there. The forward state is
    /// reset to `ys[i]` at each output time, so the reintegrated trajectory only drifts within one interval.
    /// `ys[0]` is not used.
    pub fn backward_dense(
        &self,
        t_eval: &[F::T],
        ys: &[DVector<F::T>],
        grads: &[DVector<F::T>],
    ) -> Result<AdjointGradients<F::T>, NodesolError> {
        self.check_inputs(t_eval, ys.len(), grads)?;
        for (y, &t) in ys.iter().zip(t_eval) {
            self.check_len(y, t)?;
        }
        let n = self.field.nstates();
        let np = self.field.nparams();
        let m = t_eval.len() - 1;
        let aug = AugmentedAdjointField::new(self.field);

        let mut grad_t = vec![F::T::zero(); t_eval.len()];
        let mut z = DVector::zeros(2 * n + np + 1);
        z.rows_mut(0, n).copy_from(&ys[m]);
        z.rows_mut(n, n).copy_from(&grads[m]);
        grad_t[m] = self.time_gradient(t_eval[m], &ys[m], &grads[m])?;
        z[2 * n + np] = -grad_t[m];

        let explain = |err: NodesolError| aug.explain(err);
        for i in (1..=m).rev() {
            let mut solver =
                ExplicitRk::new(&aug, &z, t_eval[i], self.tableau.clone(), self.config.clone())
                    .map_err(explain)?;
            z = Self::last(solver.solve_dense(&[t_eval[i - 1]]).map_err(explain)?);
            debug!(
                t = t_eval[i - 1].as_f64(),
                steps = solver.get_statistics().number_of_steps,
                "adjoint interval solved"
            );
            let mut a = z.rows_mut(n, n);
            a += &grads[i - 1];
            if i > 1 {
                z.rows_mut(0, n).copy_from(&ys[i - 1]);
                grad_t[i - 1] = self.time_gradient(t_eval[i - 1], &ys[i - 1], &grads[i - 1])?;
                z[2 * n + np] -= grad_t[i - 1];
            }
        }
        grad_t[0] = z[2 * n + np];
        Ok(AdjointGradients {
            grad_y0: z.rows(n, n).into_owned(),
            grad_params: z.rows(2 * n, np).into_owned(),
            grad_t,
        })
    }

    /// As [AdjointGradientEngine::backward_dense], reading the forward solution from a trajectory recorded with
    /// [ExplicitRk::solve_dense_with_checkpointing] instead of reintegrating it.
    pub fn backward_checkpointed(
        &self,
        trajectory: &HermiteInterpolator<F::T>,
        t_eval: &[F::T],
        grads: &[DVector<F::T>],
    ) -> Result<AdjointGradients<F::T>, NodesolError> {
        self.check_inputs(t_eval, t_eval.len(), grads)?;
        let n = self.field.nstates();
        let np = self.field.nparams();
        let m = t_eval.len() - 1;
        let adj = CheckpointedAdjointField::new(self.field, trajectory);

        let mut x = DVector::zeros(n);
        let mut grad_t = vec![F::T::zero(); t_eval.len()];
        let mut z = DVector::zeros(n + np + 1);
        z.rows_mut(0, n).copy_from(&grads[m]);
        trajectory.interpolate(t_eval[m], &mut x)?;
        grad_t[m] = self.time_gradient(t_eval[m], &x, &grads[m])?;
        z[n + np] = -grad_t[m];

        let explain = |err: NodesolError| adj.explain(err);
        for i in (1..=m).rev() {
            let mut solver =
                ExplicitRk::new(&adj, &z, t_eval[i], self.tableau.clone(), self.config.clone())
                    .map_err(explain)?;
            z = Self::last(solver.solve_dense(&[t_eval[i - 1]]).map_err(explain)?);
            let mut a = z.rows_mut(0, n);
            a += &grads[i - 1];
            if i > 1 {
                trajectory.interpolate(t_eval[i - 1], &mut x)?;
                grad_t[i - 1] = self.time_gradient(t_eval[i - 1], &x, &grads[i - 1])?;
                z[n + np] -= grad_t[i - 1];
            }
        }
        grad_t[0] = z[n + np];
        Ok(AdjointGradients {
            grad_y0: z.rows(0, n).into_owned(),
            grad_params: z.rows(n, np).into_owned(),
            grad_t,
        })
    }

    fn last(mut ys: Vec<DVector<F::T>>) -> DVector<F::T> {
        ys.pop().unwrap_or_else(|| DVector::zeros(0))
    }

    fn time_gradient(
        &self,
        t: F::T,
        y: &DVector<F::T>,
        grad: &DVector<F::T>,
    ) -> Result<F::T, NodesolError> {
        let f = self.field.call(y, t);
        self.check_len(&f, t)?;
        Ok(f.dot(grad))
    }

    fn check_len(&self, v: &DVector<F::T>, t: F::T) -> Result<(), NodesolError> {
        if v.len() != self.field.nstates() {
            return Err(NodesolError::from(OdeSolverError::ShapeMismatch {
                time: t.as_f64(),
                step_index: 0,
                expected: self.field.nstates(),
                found: v.len(),
            }));
        }
        Ok(())
    }

    fn check_inputs(
        &self,
        t_eval: &[F::T],
        nys: usize,
        grads: &[DVector<F::T>],
    ) -> Result<(), NodesolError> {
        if t_eval.len() < 2 {
            return Err(ode_solver_error!(InvalidTEval));
        }
        if grads.len() != t_eval.len() || nys != t_eval.len() {
            return Err(NodesolError::from(OdeSolverError::GradientCountMismatch {
                expected: t_eval.len(),
                found: grads.len().min(nys),
            }));
        }
        for (g, &t) in grads.iter().zip(t_eval) {
            self.check_len(g, t)?;
        }
        Ok(())
    }
}
