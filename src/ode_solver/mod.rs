use nalgebra::DVector;

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error, VectorField,
};

pub mod adjoint;
pub mod checkpointing;
pub mod config;
pub mod controller;
pub mod explicit_rk;
pub mod state;
pub mod tableau;

#[cfg(test)]
pub mod test_models;

use config::ExplicitRkConfig;
use explicit_rk::ExplicitRk;
use tableau::Method;

/// Solve `dy/dt = f(t, y)` with `y(times[0]) = y0` and return the solution at every entry of `times`.
///
/// `times` must be strictly monotonic, increasing or decreasing; the first output is `y0` itself.
pub fn integrate<F: VectorField>(
    field: &F,
    y0: &DVector<F::T>,
    times: &[F::T],
    method: Method,
    config: ExplicitRkConfig<F::T>,
) -> Result<Vec<DVector<F::T>>, NodesolError> {
    let Some(&t0) = times.first() else {
        return Err(ode_solver_error!(InvalidTEval));
    };
    let mut solver = ExplicitRk::new(field, y0, t0, method.tableau(), config)?;
    solver.solve_dense(times)
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::{
        integrate,
        test_models::{
            exponential_decay::exponential_decay_problem,
            oscillator::{damped_oscillator_problem, damped_oscillator_solution},
        },
    };
    use crate::{ExplicitRkConfig, Method};

    #[test]
    fn integrate_returns_initial_state_first() {
        let (field, y0) = exponential_decay_problem(2.0);
        let times = [0.0, 0.1, 0.2, 0.4, 0.8];
        let ys = integrate(&field, &y0, &times, Method::Dopri5, ExplicitRkConfig::default()).unwrap();
        assert_eq!(ys.len(), times.len());
        assert_eq!(ys[0], y0);
        for (t, y) in times.iter().zip(ys.iter()) {
            assert!((y[0] - (-2.0 * t).exp()).abs() < 1e-3);
        }
    }

    #[test]
    fn forward_then_backward_recovers_initial_state() {
        let (field, y0) = damped_oscillator_problem(0.1, 2.0);
        let config = ExplicitRkConfig::default().with_tolerances(1e-8, 1e-8);
        let forward = integrate(&field, &y0, &[0.0, 3.0], Method::Dopri5, config.clone()).unwrap();
        let y1 = forward[1].clone();
        assert!((&y1 - damped_oscillator_solution(0.1, 2.0, &y0, 3.0)).amax() < 1e-6);
        let backward = integrate(&field, &y1, &[3.0, 0.0], Method::Dopri5, config).unwrap();
        assert!((&backward[1] - &y0).amax() < 1e-6);
    }

    #[test]
    fn empty_times_are_rejected() {
        let (field, y0) = exponential_decay_problem(2.0);
        assert!(integrate(&field, &y0, &[], Method::Dopri5, ExplicitRkConfig::default()).is_err());
        let y = DVector::from_vec(vec![1.0]);
        assert!(integrate(&field, &y, &[0.0, 1.0, 0.5], Method::Tsit45, ExplicitRkConfig::default()).is_err());
    }
}
