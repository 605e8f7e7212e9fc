use std::mem::swap;

use nalgebra::{ComplexField, DMatrix, DVector, RealField};
use num_traits::{One, Zero};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error,
    scalar::constant,
    vector::VectorNorm,
    ExplicitRkConfig, HermiteInterpolator, Scalar, StepController, StepDecision, StepRecord,
    Tableau, VectorField,
};

use super::state::RkState;

#[derive(Clone, Debug, Serialize, Default, PartialEq, Eq)]
pub struct RkStatistics {
    pub number_of_steps: usize,
    pub number_of_error_test_failures: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OdeSolverStopReason {
    InternalTimestep,
    TstopReached,
}

/// An adaptive explicit Runge-Kutta solver for `dy/dt = f(t, y)`.
///
/// The tableau must be explicit and first-same-as-last (the last stage is evaluated at the new solution), which
/// holds for [Tableau::dopri5] and [Tableau::tsit45]. Each step evaluates the remaining `s - 1` stages, estimates
/// the local error from the embedded method, and passes the scaled error norm to a [StepController]. Accepted
/// steps are kept in a [StepRecord] so the solution can be evaluated anywhere inside the last step.
///
/// Integration can run forwards or backwards in time; the direction is fixed by the first stop time (or is forward
/// if [ExplicitRk::step] is called before any stop time is set).
pub struct ExplicitRk<'a, F: VectorField> {
    field: &'a F,
    tableau: Tableau<F::T>,
    config: ExplicitRkConfig<F::T>,
    controller: StepController<F::T>,
    state: RkState<F::T>,
    record: StepRecord<F::T>,
    a_rows: Vec<DVector<F::T>>,
    diff: DMatrix<F::T>,
    stage_y: DVector<F::T>,
    stage_dy: DVector<F::T>,
    error: DVector<F::T>,
    tstop: Option<F::T>,
    steps_since_output: usize,
    statistics: RkStatistics,
}

/// Evaluate `f(t, x)` into `y`, checking that the field kept the shape of the state and produced finite values.
fn evaluate<F: VectorField>(
    field: &F,
    x: &DVector<F::T>,
    t: F::T,
    y: &mut DVector<F::T>,
    step_index: usize,
) -> Result<(), NodesolError> {
    if !x.is_all_finite() {
        return Err(NodesolError::from(OdeSolverError::NonFiniteState {
            time: t.as_f64(),
            step_index,
            state: x.to_f64_vec(),
        }));
    }
    field.call_inplace(x, t, y);
    if y.len() != x.len() {
        return Err(NodesolError::from(OdeSolverError::ShapeMismatch {
            time: t.as_f64(),
            step_index,
            expected: x.len(),
            found: y.len(),
        }));
    }
    if !y.is_all_finite() {
        return Err(NodesolError::from(OdeSolverError::NonFiniteState {
            time: t.as_f64(),
            step_index,
            state: x.to_f64_vec(),
        }));
    }
    Ok(())
}

impl<'a, F: VectorField> ExplicitRk<'a, F> {
    pub fn new(
        field: &'a F,
        y0: &DVector<F::T>,
        t0: F::T,
        tableau: Tableau<F::T>,
        config: ExplicitRkConfig<F::T>,
    ) -> Result<Self, NodesolError> {
        config.validate()?;
        tableau.check_explicit_fsal()?;
        let n = field.nstates();
        if y0.len() != n {
            return Err(NodesolError::from(OdeSolverError::ShapeMismatch {
                time: t0.as_f64(),
                step_index: 0,
                expected: n,
                found: y0.len(),
            }));
        }
        if field.nout() != n {
            return Err(NodesolError::from(OdeSolverError::ShapeMismatch {
                time: t0.as_f64(),
                step_index: 0,
                expected: n,
                found: field.nout(),
            }));
        }
        if n % config.batch_size != 0 {
            return Err(ode_solver_error!(
                Other,
                format!(
                    "state length {n} is not divisible by batch_size {}",
                    config.batch_size
                )
            ));
        }
        if !t0.is_finite() {
            return Err(ode_solver_error!(InvalidTEval));
        }
        let mut dy = DVector::zeros(n);
        evaluate(field, y0, t0, &mut dy, 0)?;

        let s = tableau.s();
        let a_rows = (0..s)
            .map(|i| DVector::from_iterator(i, (0..i).map(|j| tableau.a()[(i, j)])))
            .collect();
        Ok(Self {
            field,
            controller: StepController::new(&config),
            record: StepRecord::new(y0, t0, s),
            state: RkState::new(y0.clone(), dy, t0),
            a_rows,
            diff: DMatrix::zeros(n, s),
            stage_y: DVector::zeros(n),
            stage_dy: DVector::zeros(n),
            error: DVector::zeros(n),
            tstop: None,
            steps_since_output: 0,
            statistics: RkStatistics::default(),
            tableau,
            config,
        })
    }

    pub fn state(&self) -> &RkState<F::T> {
        &self.state
    }

    pub fn field(&self) -> &F {
        self.field
    }

    pub fn tableau(&self) -> &Tableau<F::T> {
        &self.tableau
    }

    pub fn get_statistics(&self) -> &RkStatistics {
        &self.statistics
    }

    /// Number of step attempts so far, accepted or rejected.
    pub fn step_index(&self) -> usize {
        self.statistics.number_of_steps + self.statistics.number_of_error_test_failures
    }

    fn troundoff(&self) -> F::T {
        constant::<F::T>(100.0) * F::T::EPSILON * (self.state.t.abs() + self.state.h.abs())
    }

    /// Pick a first step size, following Hairer, Norsett & Wanner, Solving Ordinary Differential Equations I,
    /// section II.4. Costs one extra evaluation of `f` unless the configuration fixes `h0`.
    fn initial_step_size(&self, direction: F::T) -> Result<F::T, NodesolError> {
        if let Some(h0) = self.config.h0 {
            return Ok(h0.abs() * direction);
        }
        let (rtol, atol) = (self.config.rtol, self.config.atol);
        let y0 = &self.state.y;
        let f0 = &self.state.dy;
        let batch = self.config.batch_size;

        let d0 = y0.error_norm(y0, y0, atol, rtol, batch);
        let d1 = f0.error_norm(y0, y0, atol, rtol, batch);
        let threshold = constant::<F::T>(1e-5);
        let h0 = if d0 < threshold || d1 < threshold {
            constant(1e-6)
        } else {
            constant::<F::T>(0.01) * (d0 / d1)
        };

        // explicit Euler step to estimate the second derivative
        let mut y1 = y0.clone();
        y1.axpy(h0 * direction, f0, F::T::one());
        let t1 = self.state.t + h0 * direction;
        let mut f1 = DVector::zeros(y0.len());
        evaluate(self.field, &y1, t1, &mut f1, 0)?;
        f1 -= f0;
        let d2 = f1.error_norm(y0, y0, atol, rtol, batch) / h0;

        let order = constant::<F::T>(self.tableau.order() as f64);
        let max_d = d1.max(d2);
        let h1 = if max_d < constant(1e-15) {
            (h0 * constant(1e-3)).max(constant(1e-6))
        } else {
            (constant::<F::T>(0.01) / max_d).powf(F::T::one() / (order + F::T::one()))
        };
        let h = (constant::<F::T>(100.0) * h0).min(h1);
        debug!(h = h.as_f64(), "selected initial step size");
        Ok(h * direction)
    }

    /// Set a time the solver must stop at exactly. Steps are shortened so that they do not pass it.
    pub fn set_stop_time(&mut self, tstop: F::T) -> Result<(), NodesolError> {
        if !tstop.is_finite() {
            return Err(ode_solver_error!(InvalidTEval));
        }
        let troundoff = self.troundoff();
        let distance = tstop - self.state.t;
        if distance.abs() <= troundoff {
            return Err(ode_solver_error!(StopTimeAtCurrentTime));
        }
        let direction = if distance > F::T::zero() {
            F::T::one()
        } else {
            -F::T::one()
        };
        if self.state.h == F::T::zero() {
            self.state.h = self.initial_step_size(direction)?;
        } else if self.state.h * direction < F::T::zero() {
            return Err(NodesolError::from(
                OdeSolverError::StopTimeBeforeCurrentTime {
                    stop_time: tstop.as_f64(),
                    state_time: self.state.t.as_f64(),
                },
            ));
        }
        self.tstop = Some(tstop);
        self.steps_since_output = 0;
        Ok(())
    }

    /// Compute all stages for a step of size `h` from the current state. On return `stage_y` holds the candidate
    /// solution, `stage_dy` its derivative, and `error` the embedded error estimate.
    fn attempt(&mut self, h: F::T, step_index: usize) -> Result<(), NodesolError> {
        let t = self.state.t;
        {
            let mut col = self.diff.column_mut(0);
            col.copy_from(&self.state.dy);
            col *= h;
        }
        for i in 1..self.tableau.s() {
            self.stage_y.copy_from(&self.state.y);
            self.stage_y.gemv(
                F::T::one(),
                &self.diff.columns(0, i),
                &self.a_rows[i],
                F::T::one(),
            );
            let ti = t + self.tableau.c()[i] * h;
            evaluate(
                self.field,
                &self.stage_y,
                ti,
                &mut self.stage_dy,
                step_index,
            )?;
            let mut col = self.diff.column_mut(i);
            col.copy_from(&self.stage_dy);
            col *= h;
        }
        self.error
            .gemv(F::T::one(), &self.diff, self.tableau.d(), F::T::zero());
        Ok(())
    }

    /// Take one accepted step, retrying with smaller steps as long as the error test fails.
    pub fn step(&mut self) -> Result<OdeSolverStopReason, NodesolError> {
        if self.state.h == F::T::zero() {
            self.state.h = self.initial_step_size(F::T::one())?;
        }
        let mut h = self.state.h;
        if let Some(tstop) = self.tstop {
            let t = self.state.t;
            if (h > F::T::zero() && t + h > tstop) || (h < F::T::zero() && t + h < tstop) {
                h = tstop - t;
            }
        }
        let order = self.tableau.order();

        loop {
            let step_index = self.step_index();
            if self.steps_since_output >= self.config.max_steps {
                warn!(
                    t = self.state.t.as_f64(),
                    max_steps = self.config.max_steps,
                    "maximum number of steps exceeded"
                );
                return Err(NodesolError::from(OdeSolverError::MaxStepsExceeded {
                    time: self.state.t.as_f64(),
                    step_index,
                    max_steps: self.config.max_steps,
                    target: self.tstop.map_or(f64::NAN, |t| t.as_f64()),
                    outputs: Vec::new(),
                }));
            }
            self.steps_since_output += 1;

            if let Err(err) = self.attempt(h, step_index) {
                warn!(t = self.state.t.as_f64(), h = h.as_f64(), "step failed: {err}");
                return Err(err);
            }
            let error_ratio = self.error.error_norm(
                &self.state.y,
                &self.stage_y,
                self.config.atol,
                self.config.rtol,
                self.config.batch_size,
            );
            let decision = match self.controller.propose_next(error_ratio, h, order) {
                Ok(decision) => decision,
                Err(underflow) => {
                    warn!(
                        t = self.state.t.as_f64(),
                        h = underflow.proposed.as_f64(),
                        "step size underflow"
                    );
                    return Err(NodesolError::from(OdeSolverError::StepSizeUnderflow {
                        time: self.state.t.as_f64(),
                        step_index,
                        step_size: underflow.proposed.as_f64(),
                        state: self.state.y.to_f64_vec(),
                    }));
                }
            };
            match decision {
                StepDecision::Accept { next_step } => {
                    return Ok(self.accept(h, next_step, error_ratio));
                }
                StepDecision::Reject { next_step } => {
                    self.statistics.number_of_error_test_failures += 1;
                    debug!(
                        t = self.state.t.as_f64(),
                        h = h.as_f64(),
                        error = error_ratio.as_f64(),
                        "step rejected"
                    );
                    h = next_step;
                }
            }
        }
    }

    fn accept(
        &mut self,
        h: F::T,
        next_step: F::T,
        error_ratio: F::T,
    ) -> OdeSolverStopReason {
        let t_start = self.state.t;
        let mut t_end = t_start + h;
        let mut reached_tstop = false;
        if let Some(tstop) = self.tstop {
            let troundoff = constant::<F::T>(100.0) * F::T::EPSILON * (t_end.abs() + h.abs());
            if (t_end - tstop).abs() <= troundoff {
                t_end = tstop;
                reached_tstop = true;
            }
        }

        self.record.t_start = t_start;
        self.record.t_end = t_end;
        self.record.y_start.copy_from(&self.state.y);
        swap(&mut self.record.diff, &mut self.diff);
        swap(&mut self.state.y, &mut self.stage_y);
        swap(&mut self.state.dy, &mut self.stage_dy);
        self.record.y_end.copy_from(&self.state.y);
        self.state.t = t_end;
        self.state.h = next_step;
        self.statistics.number_of_steps += 1;
        trace!(
            t = t_end.as_f64(),
            h = h.as_f64(),
            error = error_ratio.as_f64(),
            "step accepted"
        );

        if reached_tstop {
            self.tstop = None;
            OdeSolverStopReason::TstopReached
        } else {
            OdeSolverStopReason::InternalTimestep
        }
    }

    /// Evaluate the solution at `t`, which must lie within the last accepted step.
    pub fn interpolate_inplace(&self, t: F::T, y: &mut DVector<F::T>) -> Result<(), NodesolError> {
        if (t - self.state.t).abs() <= self.troundoff() {
            if y.len() != self.state.y.len() {
                return Err(NodesolError::from(
                    OdeSolverError::InterpolationVectorWrongSize {
                        expected: self.state.y.len(),
                        found: y.len(),
                    },
                ));
            }
            y.copy_from(&self.state.y);
            return Ok(());
        }
        self.record
            .interpolate_inplace(t, self.tableau.beta(), y)
    }

    pub fn interpolate(&self, t: F::T) -> Result<DVector<F::T>, NodesolError> {
        let mut y = DVector::zeros(self.state.y.len());
        self.interpolate_inplace(t, &mut y)?;
        Ok(y)
    }

    /// Solve up to the last of `t_eval` and return the solution at each time.
    ///
    /// The times must be strictly monotonic, and none may lie behind the current time. Only the final time is
    /// hit exactly by a step; the others are evaluated with the continuous extension of the step containing them.
    pub fn solve_dense(&mut self, t_eval: &[F::T]) -> Result<Vec<DVector<F::T>>, NodesolError> {
        self.solve_dense_inner(t_eval, None)
    }

    /// As [ExplicitRk::solve_dense], also recording the value and derivative at every accepted step.
    pub fn solve_dense_with_checkpointing(
        &mut self,
        t_eval: &[F::T],
    ) -> Result<(Vec<DVector<F::T>>, HermiteInterpolator<F::T>), NodesolError> {
        let mut checkpoints = HermiteInterpolator::default();
        checkpoints.push(self.state.t, &self.state.y, &self.state.dy);
        let ys = self.solve_dense_inner(t_eval, Some(&mut checkpoints))?;
        Ok((ys, checkpoints))
    }

    fn check_t_eval(&self, t_eval: &[F::T]) -> Result<F::T, NodesolError> {
        let (Some(&first), Some(&last)) = (t_eval.first(), t_eval.last()) else {
            return Err(ode_solver_error!(InvalidTEval));
        };
        if t_eval.iter().any(|t| !t.is_finite()) {
            return Err(ode_solver_error!(InvalidTEval));
        }
        let direction = if last >= self.state.t {
            F::T::one()
        } else {
            -F::T::one()
        };
        if self.state.h * direction < F::T::zero() {
            return Err(NodesolError::from(
                OdeSolverError::StopTimeBeforeCurrentTime {
                    stop_time: last.as_f64(),
                    state_time: self.state.t.as_f64(),
                },
            ));
        }
        if (first - self.state.t) * direction < -self.troundoff()
            || t_eval
                .windows(2)
                .any(|w| (w[1] - w[0]) * direction <= F::T::zero())
        {
            return Err(ode_solver_error!(InvalidTEval));
        }
        Ok(direction)
    }

    fn solve_dense_inner(
        &mut self,
        t_eval: &[F::T],
        mut checkpoints: Option<&mut HermiteInterpolator<F::T>>,
    ) -> Result<Vec<DVector<F::T>>, NodesolError> {
        let direction = self.check_t_eval(t_eval)?;
        let last = t_eval[t_eval.len() - 1];
        if (last - self.state.t).abs() > self.troundoff() {
            self.set_stop_time(last)?;
        }

        let mut ret: Vec<DVector<F::T>> = Vec::with_capacity(t_eval.len());
        for &t in t_eval {
            while (t - self.state.t) * direction > self.troundoff() {
                if let Err(err) = self.step() {
                    return Err(Self::attach_outputs(err, &ret));
                }
                if let Some(checkpoints) = checkpoints.as_deref_mut() {
                    checkpoints.push(self.state.t, &self.state.y, &self.state.dy);
                }
            }
            ret.push(self.interpolate(t)?);
            self.steps_since_output = 0;
        }
        Ok(ret)
    }

    fn attach_outputs(err: NodesolError, ret: &[DVector<F::T>]) -> NodesolError {
        match err {
            NodesolError::OdeSolverError(OdeSolverError::MaxStepsExceeded {
                time,
                step_index,
                max_steps,
                target,
                ..
            }) => NodesolError::from(OdeSolverError::MaxStepsExceeded {
                time,
                step_index,
                max_steps,
                target,
                outputs: ret.iter().map(|y| y.to_f64_vec()).collect(),
            }),
            err => err,
        }
    }
}

#[cfg(test)]
mod test {
    use nalgebra::{DMatrix, DVector};

    use crate::{
        error::{NodesolError, OdeSolverError},
        ode_solver::test_models::{
            constant_rate::constant_rate_problem,
            exponential_decay::exponential_decay_problem,
            oscillator::{damped_oscillator_problem, damped_oscillator_solution},
        },
        ExplicitRk, ExplicitRkConfig, Method, Op, OdeSolverStopReason, Tableau, VectorField,
    };

    #[test]
    fn dopri5_exponential_decay_matches_exp() {
        // atol is tightened along with rtol, the default atol of 1e-4 dominates near y = e^-1
        let (field, y0) = exponential_decay_problem(1.0);
        let config = ExplicitRkConfig::default().with_tolerances(1e-6, 1e-6);
        let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), config).unwrap();
        let ys = s.solve_dense(&[0.0, 1.0]).unwrap();
        assert_eq!(ys[0], y0);
        assert!((ys[1][0] - (-1.0f64).exp()).abs() < 1e-5);
        assert_eq!(s.state().t, 1.0);
    }

    #[test]
    fn both_methods_track_the_damped_oscillator() {
        for method in [Method::Dopri5, Method::Tsit45] {
            let (field, y0) = damped_oscillator_problem(0.1, 2.0);
            let config = ExplicitRkConfig::default().with_tolerances(1e-8, 1e-8);
            let mut s = ExplicitRk::new(&field, &y0, 0.0, method.tableau(), config).unwrap();
            let t_eval: Vec<f64> = (0..=20).map(|i| i as f64 * 0.25).collect();
            let ys = s.solve_dense(&t_eval).unwrap();
            for (t, y) in t_eval.iter().zip(ys.iter()) {
                let expect = damped_oscillator_solution(0.1, 2.0, &y0, *t);
                assert!(
                    (y - &expect).amax() < 1e-6,
                    "{method:?} at t = {t}: {y} vs {expect}"
                );
            }
        }
    }

    #[test]
    fn tighter_tolerance_never_increases_error() {
        let (field, y0) = damped_oscillator_problem(0.5, 3.0);
        let expect = damped_oscillator_solution(0.5, 3.0, &y0, 2.0);
        let mut last_error = f64::INFINITY;
        for tol in [1e-3, 1e-5, 1e-7, 1e-9] {
            let config = ExplicitRkConfig::default().with_tolerances(tol, tol);
            let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), config).unwrap();
            let ys = s.solve_dense(&[0.0, 2.0]).unwrap();
            let error = (&ys[1] - &expect).amax();
            assert!(error <= last_error, "tol = {tol}: {error} > {last_error}");
            last_error = error;
        }
        assert!(last_error < 1e-7);
    }

    #[test]
    fn integrates_backwards_in_time() {
        let (field, _y0) = exponential_decay_problem(1.0);
        let y1 = DVector::from_vec(vec![(-1.0f64).exp()]);
        let config = ExplicitRkConfig::default().with_tolerances(1e-8, 1e-10);
        let mut s = ExplicitRk::new(&field, &y1, 1.0, Tableau::dopri5(), config).unwrap();
        let ys = s.solve_dense(&[1.0, 0.5, 0.0]).unwrap();
        assert!((ys[1][0] - (-0.5f64).exp()).abs() < 1e-7);
        assert!((ys[2][0] - 1.0).abs() < 1e-7);
        assert!(s.state().h < 0.0);
    }

    #[test]
    fn dense_output_endpoints_are_exact() {
        let (field, y0) = damped_oscillator_problem(0.1, 2.0);
        let mut s =
            ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), ExplicitRkConfig::default())
                .unwrap();
        s.set_stop_time(10.0).unwrap();
        s.step().unwrap();
        let t_start = 0.0;
        let t_end = s.state().t;
        assert_eq!(s.interpolate(t_start).unwrap(), y0);
        assert_eq!(s.interpolate(t_end).unwrap(), s.state().y);
        let mid = s.interpolate(0.5 * t_end).unwrap();
        let expect = damped_oscillator_solution(0.1, 2.0, &y0, 0.5 * t_end);
        assert!((mid - expect).amax() < 1e-3);
        assert!(s.interpolate(2.0 * t_end).is_err());
    }

    #[test]
    fn stop_time_is_hit_exactly() {
        let (field, y0) = exponential_decay_problem(1.0);
        let mut s =
            ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), ExplicitRkConfig::default())
                .unwrap();
        s.set_stop_time(0.7).unwrap();
        while s.step().unwrap() != OdeSolverStopReason::TstopReached {}
        assert_eq!(s.state().t, 0.7);
        assert!(matches!(
            s.set_stop_time(0.7),
            Err(NodesolError::OdeSolverError(
                OdeSolverError::StopTimeAtCurrentTime
            ))
        ));
        assert!(matches!(
            s.set_stop_time(0.5),
            Err(NodesolError::OdeSolverError(
                OdeSolverError::StopTimeBeforeCurrentTime { .. }
            ))
        ));
    }

    #[test]
    fn constant_rate_statistics() {
        let (field, y0) = constant_rate_problem();
        let config = ExplicitRkConfig::default().with_h0(0.1);
        let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), config).unwrap();
        let ys = s.solve_dense(&[0.0, 1.0]).unwrap();
        assert!((ys[1][0] - 1.0).abs() < 1e-14);
        insta::assert_yaml_snapshot!(s.get_statistics(), @r###"
        number_of_steps: 2
        number_of_error_test_failures: 0
        "###);
        insta::assert_yaml_snapshot!(field.statistics(), @r###"
        number_of_calls: 13
        number_of_vjps: 0
        "###);
    }

    #[test]
    fn max_steps_exceeded_reports_partial_outputs() {
        let (field, y0) = damped_oscillator_problem(0.1, 2.0);
        let config = ExplicitRkConfig::default()
            .with_tolerances(1e-10, 1e-10)
            .with_max_steps(1);
        let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), config).unwrap();
        match s.solve_dense(&[0.0, 5.0]) {
            Err(NodesolError::OdeSolverError(OdeSolverError::MaxStepsExceeded {
                max_steps,
                target,
                outputs,
                step_index,
                ..
            })) => {
                assert_eq!(max_steps, 1);
                assert_eq!(target, 5.0);
                assert_eq!(step_index, 1);
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0], vec![y0[0], y0[1]]);
            }
            other => panic!("expected MaxStepsExceeded, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_field_is_fatal() {
        let field = crate::Closure::new(
            |x: &DVector<f64>, _p: &DVector<f64>, t: f64, y: &mut DVector<f64>| {
                y[0] = if t > 0.05 { f64::NAN } else { -x[0] };
            },
            |_x: &DVector<f64>, _p: &DVector<f64>, _t, _v: &DVector<f64>, _gx: &mut DVector<f64>, _gp: &mut DVector<f64>| {},
            1,
            DVector::zeros(0),
        );
        let y0 = DVector::from_vec(vec![1.0]);
        let config = ExplicitRkConfig::default().with_h0(0.1);
        let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), config).unwrap();
        let err = s.solve_dense(&[0.0, 1.0]).unwrap_err();
        assert!(matches!(
            err,
            NodesolError::OdeSolverError(OdeSolverError::NonFiniteState { step_index: 0, .. })
        ));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let field = crate::Closure::new(
            |_x: &DVector<f64>, _p: &DVector<f64>, _t: f64, y: &mut DVector<f64>| {
                *y = DVector::zeros(3);
            },
            |_x: &DVector<f64>, _p: &DVector<f64>, _t, _v: &DVector<f64>, _gx: &mut DVector<f64>, _gp: &mut DVector<f64>| {},
            2,
            DVector::zeros(0),
        );
        let y0 = DVector::from_vec(vec![1.0, 1.0]);
        let err = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), ExplicitRkConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            NodesolError::OdeSolverError(OdeSolverError::ShapeMismatch {
                step_index: 0,
                expected: 2,
                found: 3,
                ..
            })
        ));
        let wrong_y0 = DVector::from_vec(vec![1.0]);
        assert!(ExplicitRk::new(&field, &wrong_y0, 0.0, Tableau::dopri5(), ExplicitRkConfig::default()).is_err());
    }

    #[test]
    fn shape_change_mid_solve_reports_time_and_step() {
        let field = crate::Closure::new(
            |x: &DVector<f64>, _p: &DVector<f64>, t: f64, y: &mut DVector<f64>| {
                if t > 0.3 {
                    *y = DVector::zeros(2);
                } else {
                    y[0] = -x[0];
                }
            },
            |_x: &DVector<f64>, _p: &DVector<f64>, _t, _v: &DVector<f64>, _gx: &mut DVector<f64>, _gp: &mut DVector<f64>| {},
            1,
            DVector::zeros(0),
        );
        let y0 = DVector::from_vec(vec![1.0]);
        let config = ExplicitRkConfig::default().with_h0(0.1);
        let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), config).unwrap();
        match s.solve_dense(&[0.0, 1.0]) {
            Err(NodesolError::OdeSolverError(OdeSolverError::ShapeMismatch {
                time,
                step_index,
                expected,
                found,
            })) => {
                assert!(time > 0.3 && time <= 1.0, "time = {time}");
                assert!(step_index >= 1);
                assert_eq!((expected, found), (1, 2));
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn blow_up_ends_in_step_size_underflow() {
        // y' = y^2, y(0) = 1 has a pole at t = 1
        let field = crate::Closure::new(
            |x: &DVector<f64>, _p: &DVector<f64>, _t: f64, y: &mut DVector<f64>| {
                y[0] = x[0] * x[0];
            },
            |_x: &DVector<f64>, _p: &DVector<f64>, _t, _v: &DVector<f64>, _gx: &mut DVector<f64>, _gp: &mut DVector<f64>| {},
            1,
            DVector::zeros(0),
        );
        let y0 = DVector::from_vec(vec![1.0]);
        let mut s =
            ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), ExplicitRkConfig::default())
                .unwrap();
        match s.solve_dense(&[0.0, 2.0]) {
            Err(NodesolError::OdeSolverError(OdeSolverError::StepSizeUnderflow {
                time,
                step_index,
                step_size,
                state,
            })) => {
                assert!((time - 1.0).abs() < 1e-3, "time = {time}");
                assert!(step_index > 0);
                assert!(step_size.abs() < 1e-13);
                assert_eq!(state.len(), 1);
                assert!(state[0] > 1e6);
            }
            other => panic!("expected StepSizeUnderflow, got {other:?}"),
        }
    }

    #[test]
    fn invalid_t_eval_is_rejected() {
        let (field, y0) = exponential_decay_problem(1.0);
        let mut s =
            ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), ExplicitRkConfig::default())
                .unwrap();
        assert!(s.solve_dense(&[]).is_err());
        assert!(s.solve_dense(&[0.0, 0.5, 0.5]).is_err());
        assert!(s.solve_dense(&[0.0, 0.5, 0.2]).is_err());
    }

    #[test]
    fn batched_error_norm_uses_worst_member() {
        // two copies of y' = -k y stacked, with very different rates
        let a = DMatrix::from_diagonal(&DVector::from_vec(vec![-0.1, -10.0]));
        let field = crate::LinearField::new(&a);
        let y0 = DVector::from_vec(vec![1.0, 1.0]);
        let batched = ExplicitRkConfig::default()
            .with_tolerances(1e-6, 1e-6)
            .with_batch_size(2);
        let mut s = ExplicitRk::new(&field, &y0, 0.0, Tableau::dopri5(), batched).unwrap();
        let ys = s.solve_dense(&[0.0, 1.0]).unwrap();
        assert!((ys[1][0] - (-0.1f64).exp()).abs() < 1e-5);
        assert!((ys[1][1] - (-10.0f64).exp()).abs() < 1e-5);
        assert!(field.nstates() == 2);
        assert!(field.call(&y0, 0.0)[1] == -10.0);
    }
}
