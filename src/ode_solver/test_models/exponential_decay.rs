use nalgebra::DVector;

use crate::{Closure, VectorFieldAdjoint};

// exponential decay problem
// dy/dt = -ay (p = [a])
fn exponential_decay(x: &DVector<f64>, p: &DVector<f64>, _t: f64, y: &mut DVector<f64>) {
    y.copy_from(x);
    *y *= -p[0];
}

// v^T df/dy = -av
// v^T df/dp = -y.v
fn exponential_decay_vjp(
    x: &DVector<f64>,
    p: &DVector<f64>,
    _t: f64,
    v: &DVector<f64>,
    grad_x: &mut DVector<f64>,
    grad_p: &mut DVector<f64>,
) {
    grad_x.copy_from(v);
    *grad_x *= -p[0];
    grad_p[0] = -x.dot(v);
}

pub fn exponential_decay_problem(a: f64) -> (impl VectorFieldAdjoint<T = f64>, DVector<f64>) {
    let field = Closure::new(
        exponential_decay,
        exponential_decay_vjp,
        1,
        DVector::from_vec(vec![a]),
    );
    (field, DVector::from_vec(vec![1.0]))
}
