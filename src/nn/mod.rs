//! Small building blocks for training a classifier around an [crate::OdeLayer].

use nalgebra::DVector;
use num_traits::One;

use crate::{error::NodesolError, other_error, Scalar};

mod head;
mod mlp;

pub use head::{HeadGradients, LinearHead};
pub use mlp::Mlp;

/// Cross-entropy of `softmax(logits)` against the class `label`, and its gradient with respect to the logits
/// (`softmax(logits) - onehot(label)`).
pub fn softmax_cross_entropy<T: Scalar>(
    logits: &DVector<T>,
    label: usize,
) -> Result<(T, DVector<T>), NodesolError> {
    if label >= logits.len() {
        return Err(other_error!(format!(
            "label {label} out of range for {} classes",
            logits.len()
        )));
    }
    // shift by the largest logit so exp never overflows
    let max = logits.max();
    let shifted = logits.map(|l| l - max);
    let log_sum = shifted.map(|l| l.exp()).sum().ln();
    let loss = log_sum - shifted[label];
    let mut grad = shifted.map(|l| (l - log_sum).exp());
    grad[label] -= T::one();
    Ok((loss, grad))
}
