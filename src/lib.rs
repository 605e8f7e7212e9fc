//! # Nodesol
//!
//! Nodesol integrates ordinary differential equations of the form
//!
//! ```text
//! dx/dt = f(t, x; p),  x(t0) = x0
//! ```
//!
//! with adaptive explicit Runge-Kutta methods, and computes gradients of a loss on the solution with respect to
//! `x0`, `p` and the time span using the adjoint method. Together these make a neural ODE layer, [OdeLayer], that
//! can sit between a feature extractor and a classifier head.
//!
//! ## Vector fields
//!
//! A vector field implements [VectorField] (and [VectorFieldAdjoint] if gradients are needed). Nodesol provides
//! [Closure] for fields written as closures, [LinearField] for `f(t, x) = A x`, and [nn::Mlp], a time-conditioned
//! two layer perceptron.
//!
//! ## Solving
//!
//! [ExplicitRk] takes a step at a time with an embedded error estimate, adapting the step size with a
//! [StepController]. The coefficients come from a [Tableau]; [Method::Dopri5] (the default) and [Method::Tsit45]
//! are provided. Use [ExplicitRk::solve_dense] (or the [integrate] shortcut) to get the solution at a list of
//! times, using the continuous extension of each step for times a step jumps over.
//!
//! ## Gradients
//!
//! [AdjointGradientEngine] integrates the adjoint equations backwards in time, either reintegrating the forward
//! state alongside ([AdjointStrategy::Reintegrate]) or reading it from a trajectory recorded during the forward
//! solve ([AdjointStrategy::Checkpointed]).

pub mod error;
pub mod layer;
pub mod nn;
pub mod ode_solver;
pub mod op;
pub mod scalar;
pub mod vector;

pub use error::{LayerError, NodesolError, OdeSolverError};
pub use layer::{BatchGradients, LayerGradients, OdeLayer, OdeLayerConfig};
pub use ode_solver::{
    adjoint::{AdjointGradientEngine, AdjointGradients, AdjointStrategy},
    checkpointing::HermiteInterpolator,
    config::ExplicitRkConfig,
    controller::{StepController, StepDecision},
    explicit_rk::{ExplicitRk, OdeSolverStopReason, RkStatistics},
    integrate,
    state::{RkState, StepRecord},
    tableau::{Method, Tableau},
};
pub use op::{
    closure::Closure, linear::LinearField, Op, OpStatistics, VectorField, VectorFieldAdjoint, Vjp,
};
pub use scalar::{IndexType, Scalar};
