use nalgebra::{DMatrix, DVector};

use crate::LinearField;

// damped oscillator, linear with A = | -l  w |
//                                    | -w -l |
// x(t) = e^{-lt} | cos(wt)  sin(wt) | x0
//                | -sin(wt) cos(wt) |
pub fn damped_oscillator_matrix(damping: f64, frequency: f64) -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[-damping, frequency, -frequency, -damping])
}

pub fn damped_oscillator_problem(damping: f64, frequency: f64) -> (LinearField<f64>, DVector<f64>) {
    (
        LinearField::new(&damped_oscillator_matrix(damping, frequency)),
        DVector::from_vec(vec![1.0, 0.0]),
    )
}

pub fn damped_oscillator_solution(
    damping: f64,
    frequency: f64,
    y0: &DVector<f64>,
    t: f64,
) -> DVector<f64> {
    let (s, c) = (frequency * t).sin_cos();
    let propagator = DMatrix::from_row_slice(2, 2, &[c, s, -s, c]) * (-damping * t).exp();
    propagator * y0
}

// transpose of the propagator above: the exact gradient of w.x(t) with respect to x0 is P(t)^T w
pub fn damped_oscillator_gradient(
    damping: f64,
    frequency: f64,
    w: &DVector<f64>,
    t: f64,
) -> DVector<f64> {
    let (s, c) = (frequency * t).sin_cos();
    let propagator = DMatrix::from_row_slice(2, 2, &[c, s, -s, c]) * (-damping * t).exp();
    propagator.transpose() * w
}
