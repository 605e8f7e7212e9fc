use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};
use rand::{
    distr::{Distribution, Uniform},
    Rng,
};

use crate::{
    error::{LayerError, NodesolError},
    other_error,
    scalar::constant,
    Scalar,
};

/// Affine map from a state to class logits, `logits = W x + b`.
#[derive(Clone, Debug)]
pub struct LinearHead<T: Scalar> {
    weights: DMatrix<T>,
    bias: DVector<T>,
}

/// Gradients of a loss with respect to the input and parameters of a [LinearHead].
#[derive(Clone, Debug)]
pub struct HeadGradients<T: Scalar> {
    pub grad_x: DVector<T>,
    pub grad_weights: DMatrix<T>,
    pub grad_bias: DVector<T>,
}

impl<T: Scalar> LinearHead<T> {
    pub fn new(nstates: usize, nclasses: usize, rng: &mut impl Rng) -> Result<Self, NodesolError> {
        let bound = 1.0 / (nstates.max(1) as f64).sqrt();
        let dist = Uniform::new(-bound, bound).map_err(|e| other_error!(e))?;
        Ok(Self {
            weights: DMatrix::from_fn(nclasses, nstates, |_, _| constant(dist.sample(rng))),
            bias: DVector::zeros(nclasses),
        })
    }

    pub fn from_parts(weights: DMatrix<T>, bias: DVector<T>) -> Result<Self, NodesolError> {
        if bias.len() != weights.nrows() {
            return Err(NodesolError::from(LayerError::WrongParameterLength {
                expected: weights.nrows(),
                found: bias.len(),
            }));
        }
        Ok(Self { weights, bias })
    }

    pub fn weights(&self) -> &DMatrix<T> {
        &self.weights
    }

    pub fn bias(&self) -> &DVector<T> {
        &self.bias
    }

    pub fn forward(&self, x: &DVector<T>) -> DVector<T> {
        let mut logits = self.bias.clone();
        logits.gemv(T::one(), &self.weights, x, T::one());
        logits
    }

    pub fn backward(&self, x: &DVector<T>, grad_logits: &DVector<T>) -> HeadGradients<T> {
        let mut grad_x = DVector::zeros(self.weights.ncols());
        grad_x.gemv_tr(T::one(), &self.weights, grad_logits, T::zero());
        HeadGradients {
            grad_x,
            grad_weights: grad_logits * x.transpose(),
            grad_bias: grad_logits.clone(),
        }
    }

    /// Plain gradient descent update.
    pub fn sgd_step(&mut self, grads: &HeadGradients<T>, learning_rate: T) {
        self.weights -= &grads.grad_weights * learning_rate;
        self.bias.axpy(-learning_rate, &grads.grad_bias, T::one());
    }
}
