use nalgebra::{ComplexField, DVector};
use num_traits::{One, Zero};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{LayerError, NodesolError, OdeSolverError},
    layer_error, ode_solver_error,
    scalar::constant,
    AdjointGradientEngine, AdjointStrategy, ExplicitRk, ExplicitRkConfig, HermiteInterpolator,
    Method, Op, Scalar, VectorFieldAdjoint,
};

/// Configuration of an [OdeLayer].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdeLayerConfig<T> {
    pub rtol: T,
    pub atol: T,
    pub method: Method,
    pub max_steps: usize,
    pub t_span: (T, T),
    pub h0: Option<T>,
    pub adjoint_rtol: T,
    pub adjoint_atol: T,
    pub adjoint_strategy: AdjointStrategy,
    /// Number of equal, independent chunks the state is made of. The error test uses the worst chunk.
    pub batch_size: usize,
}

impl<T: Scalar> Default for OdeLayerConfig<T> {
    fn default() -> Self {
        Self {
            rtol: constant(1e-3),
            atol: constant(1e-4),
            method: Method::Dopri5,
            max_steps: 10_000,
            t_span: (T::zero(), T::one()),
            h0: None,
            adjoint_rtol: constant(1e-3),
            adjoint_atol: constant(1e-4),
            adjoint_strategy: AdjointStrategy::Reintegrate,
            batch_size: 1,
        }
    }
}

impl<T: Scalar> OdeLayerConfig<T> {
    pub fn with_tolerances(mut self, rtol: T, atol: T) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_adjoint_tolerances(mut self, rtol: T, atol: T) -> Self {
        self.adjoint_rtol = rtol;
        self.adjoint_atol = atol;
        self
    }

    pub fn with_t_span(mut self, t0: T, t1: T) -> Self {
        self.t_span = (t0, t1);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_adjoint_strategy(mut self, strategy: AdjointStrategy) -> Self {
        self.adjoint_strategy = strategy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn solver_config(&self) -> ExplicitRkConfig<T> {
        let config = ExplicitRkConfig::default()
            .with_tolerances(self.rtol, self.atol)
            .with_max_steps(self.max_steps)
            .with_batch_size(self.batch_size);
        match self.h0 {
            Some(h0) => config.with_h0(h0),
            None => config,
        }
    }

    pub fn adjoint_config(&self) -> ExplicitRkConfig<T> {
        ExplicitRkConfig::default()
            .with_tolerances(self.adjoint_rtol, self.adjoint_atol)
            .with_max_steps(self.max_steps)
    }
}

/// Gradients returned by [OdeLayer::backward].
#[derive(Clone, Debug)]
pub struct LayerGradients<T: Scalar> {
    pub grad_x0: DVector<T>,
    pub grad_params: DVector<T>,
}

/// Gradients returned by [OdeLayer::backward_batch]. Parameter gradients are summed over the batch.
#[derive(Clone, Debug)]
pub struct BatchGradients<T: Scalar> {
    pub grad_x0: Vec<DVector<T>>,
    pub grad_params: DVector<T>,
}

struct ForwardRecord<T: Scalar> {
    y1: DVector<T>,
    trajectory: Option<HermiteInterpolator<T>>,
}

/// A neural ODE layer: `forward` maps `x0` to the solution `x(t1)` of `dx/dt = f(t, x; p)` with `x(t0) = x0`,
/// and `backward` turns `dL/dx(t1)` into `dL/dx0` and `dL/dp` with the adjoint method.
///
/// The layer remembers what `backward` needs from the most recent forward call (a single state, or one entry per
/// batch element); changing the parameters discards it.
pub struct OdeLayer<F: VectorFieldAdjoint> {
    field: F,
    config: OdeLayerConfig<F::T>,
    cache: Vec<ForwardRecord<F::T>>,
}

impl<F: VectorFieldAdjoint> OdeLayer<F> {
    pub fn new(field: F, config: OdeLayerConfig<F::T>) -> Result<Self, NodesolError> {
        let (t0, t1) = config.t_span;
        if t0 == t1 || !t0.is_finite() || !t1.is_finite() {
            return Err(NodesolError::from(LayerError::EmptySpan {
                t0: t0.as_f64(),
                t1: t1.as_f64(),
            }));
        }
        config.solver_config().validate()?;
        config.adjoint_config().validate()?;
        Ok(Self {
            field,
            config,
            cache: Vec::new(),
        })
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    /// Mutable access to the vector field. Invalidates the last forward pass.
    pub fn field_mut(&mut self) -> &mut F {
        self.cache.clear();
        &mut self.field
    }

    pub fn config(&self) -> &OdeLayerConfig<F::T> {
        &self.config
    }

    pub fn params(&self) -> &DVector<F::T> {
        self.field.params()
    }

    pub fn set_params(&mut self, p: &DVector<F::T>) -> Result<(), NodesolError> {
        if p.len() != self.field.nparams() {
            return Err(NodesolError::from(LayerError::WrongParameterLength {
                expected: self.field.nparams(),
                found: p.len(),
            }));
        }
        self.cache.clear();
        self.field.set_params(p);
        Ok(())
    }

    fn forward_one(
        field: &F,
        config: &OdeLayerConfig<F::T>,
        x0: &DVector<F::T>,
        t_eval: &[F::T],
    ) -> Result<(Vec<DVector<F::T>>, ForwardRecord<F::T>), NodesolError> {
        let mut solver = ExplicitRk::new(
            field,
            x0,
            config.t_span.0,
            config.method.tableau(),
            config.solver_config(),
        )?;
        let (ys, trajectory) = match config.adjoint_strategy {
            AdjointStrategy::Reintegrate => (solver.solve_dense(t_eval)?, None),
            AdjointStrategy::Checkpointed => {
                let (ys, trajectory) = solver.solve_dense_with_checkpointing(t_eval)?;
                (ys, Some(trajectory))
            }
        };
        debug!(
            steps = solver.get_statistics().number_of_steps,
            rejected = solver.get_statistics().number_of_error_test_failures,
            "forward solve finished"
        );
        let y1 = ys[ys.len() - 1].clone();
        Ok((ys, ForwardRecord { y1, trajectory }))
    }

    fn backward_one(
        field: &F,
        config: &OdeLayerConfig<F::T>,
        record: &ForwardRecord<F::T>,
        grad_x1: &DVector<F::T>,
    ) -> Result<LayerGradients<F::T>, NodesolError> {
        let (t0, t1) = config.t_span;
        let engine =
            AdjointGradientEngine::new(field, config.method.tableau(), config.adjoint_config());
        let grads = match &record.trajectory {
            None => engine.backward(t0, t1, &record.y1, grad_x1)?,
            Some(trajectory) => engine.backward_checkpointed(
                trajectory,
                &[t0, t1],
                &[DVector::zeros(field.nstates()), grad_x1.clone()],
            )?,
        };
        Ok(LayerGradients {
            grad_x0: grads.grad_y0,
            grad_params: grads.grad_params,
        })
    }

    /// Integrate from `x0` over the configured span and return the terminal state.
    pub fn forward(&mut self, x0: &DVector<F::T>) -> Result<DVector<F::T>, NodesolError> {
        self.cache.clear();
        let (t0, t1) = self.config.t_span;
        let (_, record) = Self::forward_one(&self.field, &self.config, x0, &[t0, t1])?;
        let y1 = record.y1.clone();
        self.cache.push(record);
        Ok(y1)
    }

    /// As [OdeLayer::forward], returning the states at the strictly monotonic `times`, which must lie within the
    /// configured span. The terminal state is still what [OdeLayer::backward] differentiates.
    pub fn forward_dense(
        &mut self,
        x0: &DVector<F::T>,
        times: &[F::T],
    ) -> Result<Vec<DVector<F::T>>, NodesolError> {
        self.cache.clear();
        let (t0, t1) = self.config.t_span;
        let direction = if t1 > t0 { F::T::one() } else { -F::T::one() };
        if times
            .iter()
            .any(|&t| (t - t0) * direction < F::T::zero() || (t1 - t) * direction < F::T::zero())
            || times
                .windows(2)
                .any(|w| (w[1] - w[0]) * direction <= F::T::zero())
        {
            return Err(ode_solver_error!(InvalidTEval));
        }

        let mut t_eval = vec![t0];
        t_eval.extend(times.iter().copied().filter(|&t| t != t0 && t != t1));
        t_eval.push(t1);
        let (ys, record) = Self::forward_one(&self.field, &self.config, x0, &t_eval)?;
        self.cache.push(record);

        let mut ret = Vec::with_capacity(times.len());
        let mut cursor = 0;
        for &t in times {
            while t_eval[cursor] != t {
                cursor += 1;
            }
            ret.push(ys[cursor].clone());
        }
        Ok(ret)
    }

    /// Gradients of the loss with respect to the input and the parameters, given `dL/dx(t1)` for the last
    /// [OdeLayer::forward] call.
    pub fn backward(&self, grad_x1: &DVector<F::T>) -> Result<LayerGradients<F::T>, NodesolError> {
        match self.cache.as_slice() {
            [] => Err(layer_error!(BackwardBeforeForward)),
            [record] => Self::backward_one(&self.field, &self.config, record, grad_x1),
            records => Err(NodesolError::from(LayerError::BatchSizeMismatch {
                expected: records.len(),
                found: 1,
            })),
        }
    }
}

impl<F: VectorFieldAdjoint + Sync> OdeLayer<F> {
    /// [OdeLayer::forward] for each element of a batch. Elements are integrated independently, in parallel when
    /// the `rayon` feature is enabled.
    pub fn forward_batch(
        &mut self,
        xs: &[DVector<F::T>],
    ) -> Result<Vec<DVector<F::T>>, NodesolError> {
        self.cache.clear();
        let (t0, t1) = self.config.t_span;
        let (field, config) = (&self.field, &self.config);
        #[cfg(feature = "rayon")]
        let iter = xs.par_iter();
        #[cfg(not(feature = "rayon"))]
        let iter = xs.iter();
        let records = iter
            .map(|x0| Self::forward_one(field, config, x0, &[t0, t1]).map(|(_, record)| record))
            .collect::<Result<Vec<_>, _>>()?;
        let ys = records.iter().map(|record| record.y1.clone()).collect();
        self.cache = records;
        Ok(ys)
    }

    /// [OdeLayer::backward] for the batch of the last [OdeLayer::forward_batch] call.
    pub fn backward_batch(
        &self,
        grads: &[DVector<F::T>],
    ) -> Result<BatchGradients<F::T>, NodesolError> {
        if self.cache.is_empty() {
            return Err(layer_error!(BackwardBeforeForward));
        }
        if grads.len() != self.cache.len() {
            return Err(NodesolError::from(LayerError::BatchSizeMismatch {
                expected: self.cache.len(),
                found: grads.len(),
            }));
        }
        let (field, config) = (&self.field, &self.config);
        #[cfg(feature = "rayon")]
        let iter = self.cache.par_iter().zip(grads.par_iter());
        #[cfg(not(feature = "rayon"))]
        let iter = self.cache.iter().zip(grads.iter());
        let per_element = iter
            .map(|(record, grad)| Self::backward_one(field, config, record, grad))
            .collect::<Result<Vec<_>, _>>()?;

        let mut grad_params = DVector::zeros(self.field.nparams());
        let mut grad_x0 = Vec::with_capacity(per_element.len());
        for grads in per_element {
            grad_params += &grads.grad_params;
            grad_x0.push(grads.grad_x0);
        }
        Ok(BatchGradients {
            grad_x0,
            grad_params,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};
    use rand::{rngs::StdRng, SeedableRng};

    use crate::{
        error::{LayerError, NodesolError},
        nn::{softmax_cross_entropy, LinearHead, Mlp},
        AdjointStrategy, LinearField, Method, OdeLayer, OdeLayerConfig, Op,
    };

    fn tight() -> OdeLayerConfig<f64> {
        OdeLayerConfig::default()
            .with_tolerances(1e-9, 1e-11)
            .with_adjoint_tolerances(1e-9, 1e-11)
    }

    fn mlp_layer(strategy: AdjointStrategy) -> OdeLayer<Mlp<f64>> {
        let mut rng = StdRng::seed_from_u64(7);
        let field = Mlp::new(2, 8, &mut rng).unwrap();
        OdeLayer::new(field, tight().with_adjoint_strategy(strategy)).unwrap()
    }

    #[test]
    fn mlp_layer_gradients_match_finite_differences() {
        for strategy in [AdjointStrategy::Reintegrate, AdjointStrategy::Checkpointed] {
            let mut layer = mlp_layer(strategy);
            let x0 = DVector::from_vec(vec![0.5, -0.3]);
            let w = DVector::from_vec(vec![1.0, 2.0]);
            layer.forward(&x0).unwrap();
            let grads = layer.backward(&w).unwrap();

            let eps = 1e-6;
            for i in 0..2 {
                let mut xp = x0.clone();
                let mut xm = x0.clone();
                xp[i] += eps;
                xm[i] -= eps;
                let fd = (layer.forward(&xp).unwrap().dot(&w) - layer.forward(&xm).unwrap().dot(&w))
                    / (2.0 * eps);
                assert_relative_eq!(grads.grad_x0[i], fd, epsilon = 1e-5, max_relative = 1e-4);
            }

            let p0 = layer.params().clone();
            for k in [0, 5, 17, p0.len() - 1] {
                let mut p = p0.clone();
                p[k] += eps;
                layer.set_params(&p).unwrap();
                let lp = layer.forward(&x0).unwrap().dot(&w);
                p[k] -= 2.0 * eps;
                layer.set_params(&p).unwrap();
                let lm = layer.forward(&x0).unwrap().dot(&w);
                let fd = (lp - lm) / (2.0 * eps);
                assert_relative_eq!(grads.grad_params[k], fd, epsilon = 1e-5, max_relative = 1e-4);
            }
            layer.set_params(&p0).unwrap();
        }
    }

    #[test]
    fn backward_requires_forward() {
        let mut layer = mlp_layer(AdjointStrategy::Reintegrate);
        let g = DVector::from_vec(vec![1.0, 0.0]);
        assert!(matches!(
            layer.backward(&g),
            Err(NodesolError::LayerError(LayerError::BackwardBeforeForward))
        ));
        layer.forward(&DVector::from_vec(vec![0.1, 0.2])).unwrap();
        assert!(layer.backward(&g).is_ok());
        let p = layer.params().clone();
        layer.set_params(&p).unwrap();
        assert!(layer.backward(&g).is_err());
        assert!(layer.set_params(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn empty_span_is_rejected() {
        let field = LinearField::new(&DMatrix::<f64>::identity(2, 2));
        let config = OdeLayerConfig::default().with_t_span(1.0, 1.0);
        assert!(matches!(
            OdeLayer::new(field, config),
            Err(NodesolError::LayerError(LayerError::EmptySpan { .. }))
        ));
    }

    #[test]
    fn forward_dense_returns_requested_times() {
        let a = DMatrix::from_row_slice(2, 2, &[-0.1, 2.0, -2.0, -0.1]);
        let mut layer = OdeLayer::new(LinearField::new(&a), tight().with_t_span(0.0, 2.0)).unwrap();
        let x0 = DVector::from_vec(vec![1.0, 0.0]);
        let ys = layer.forward_dense(&x0, &[0.0, 0.5, 1.0, 2.0]).unwrap();
        assert_eq!(ys.len(), 4);
        assert_eq!(ys[0], x0);
        let (s, c) = 2.0f64.sin_cos();
        let expect = DVector::from_vec(vec![c, -s]) * (-0.1f64).exp();
        assert_relative_eq!(ys[2], expect, epsilon = 1e-7);
        let terminal = layer.forward(&x0).unwrap();
        assert_relative_eq!(ys[3], terminal, epsilon = 1e-9);
        assert!(layer.forward_dense(&x0, &[0.5, 3.0]).is_err());
        assert!(layer.forward_dense(&x0, &[1.0, 0.5]).is_err());
    }

    #[test]
    fn batch_matches_single_elements() {
        let mut layer = mlp_layer(AdjointStrategy::Reintegrate);
        let xs = vec![
            DVector::from_vec(vec![0.5, -0.3]),
            DVector::from_vec(vec![-1.0, 0.2]),
            DVector::from_vec(vec![0.0, 0.9]),
        ];
        let gs = vec![
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0]),
            DVector::from_vec(vec![1.0, -1.0]),
        ];
        let ys = layer.forward_batch(&xs).unwrap();
        let batch = layer.backward_batch(&gs).unwrap();
        assert!(layer.backward(&gs[0]).is_err());
        assert!(layer.backward_batch(&gs[..2]).is_err());

        let mut grad_params = DVector::zeros(layer.field().nparams());
        for i in 0..xs.len() {
            let y = layer.forward(&xs[i]).unwrap();
            assert_relative_eq!(y, ys[i], epsilon = 1e-14);
            let single = layer.backward(&gs[i]).unwrap();
            assert_relative_eq!(single.grad_x0, batch.grad_x0[i], epsilon = 1e-14);
            grad_params += &single.grad_params;
        }
        assert_relative_eq!(grad_params, batch.grad_params, epsilon = 1e-12);
    }

    #[test]
    fn gradient_step_reduces_classifier_loss() {
        let mut rng = StdRng::seed_from_u64(3);
        let field = Mlp::new(2, 6, &mut rng).unwrap();
        let config = OdeLayerConfig::default()
            .with_method(Method::Tsit45)
            .with_tolerances(1e-8, 1e-10)
            .with_adjoint_tolerances(1e-8, 1e-10);
        let mut layer = OdeLayer::new(field, config).unwrap();
        let mut head = LinearHead::new(2, 3, &mut rng).unwrap();
        let x0 = DVector::from_vec(vec![0.4, -0.7]);
        let label = 2;

        let loss_at = |layer: &mut OdeLayer<Mlp<f64>>, head: &LinearHead<f64>| {
            let x1 = layer.forward(&x0).unwrap();
            softmax_cross_entropy(&head.forward(&x1), label).unwrap()
        };

        let x1 = layer.forward(&x0).unwrap();
        let logits = head.forward(&x1);
        let (loss0, grad_logits) = softmax_cross_entropy(&logits, label).unwrap();
        let head_grads = head.backward(&x1, &grad_logits);
        let grads = layer.backward(&head_grads.grad_x).unwrap();

        let p = layer.params() - grads.grad_params * 1e-2;
        layer.set_params(&p).unwrap();
        let (loss1, _) = loss_at(&mut layer, &head);
        assert!(loss1 < loss0, "{loss1} >= {loss0}");

        let x1 = layer.forward(&x0).unwrap();
        let (_, grad_logits) = softmax_cross_entropy(&head.forward(&x1), label).unwrap();
        head.sgd_step(&head.backward(&x1, &grad_logits), 1e-2);
        let (loss2, _) = loss_at(&mut layer, &head);
        assert!(loss2 < loss1, "{loss2} >= {loss1}");
    }

    #[test]
    fn layer_batches_within_the_state() {
        // two decoupled members stacked in one state, with very different rates
        let a = DMatrix::from_diagonal(&DVector::from_vec(vec![-0.1, -10.0]));
        let config = OdeLayerConfig::default()
            .with_tolerances(1e-6, 1e-8)
            .with_adjoint_tolerances(1e-8, 1e-10)
            .with_batch_size(2);
        assert_eq!(config.solver_config().batch_size, 2);
        assert_eq!(config.adjoint_config().batch_size, 1);
        let mut layer = OdeLayer::new(LinearField::new(&a), config).unwrap();
        let x0 = DVector::from_vec(vec![1.0, 1.0]);
        let x1 = layer.forward(&x0).unwrap();
        assert_relative_eq!(x1[0], (-0.1f64).exp(), epsilon = 1e-5);
        assert_relative_eq!(x1[1], (-10.0f64).exp(), epsilon = 1e-5);

        let grads = layer.backward(&DVector::from_vec(vec![1.0, 1.0])).unwrap();
        assert_relative_eq!(grads.grad_x0[0], (-0.1f64).exp(), epsilon = 1e-5);
        assert_relative_eq!(grads.grad_x0[1], (-10.0f64).exp(), epsilon = 1e-5);

        let uneven = OdeLayerConfig::default().with_batch_size(3);
        let mut layer = OdeLayer::new(LinearField::new(&a), uneven).unwrap();
        assert!(layer.forward(&x0).is_err());
    }
}
