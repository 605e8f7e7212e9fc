use nalgebra::DVector;

use crate::{Closure, VectorFieldAdjoint};

// dy/dt = 1, solved exactly by every step
fn constant_rate(_x: &DVector<f64>, _p: &DVector<f64>, _t: f64, y: &mut DVector<f64>) {
    y.fill(1.0);
}

fn constant_rate_vjp(
    _x: &DVector<f64>,
    _p: &DVector<f64>,
    _t: f64,
    _v: &DVector<f64>,
    grad_x: &mut DVector<f64>,
    _grad_p: &mut DVector<f64>,
) {
    grad_x.fill(0.0);
}

pub fn constant_rate_problem() -> (impl VectorFieldAdjoint<T = f64>, DVector<f64>) {
    let field = Closure::new(constant_rate, constant_rate_vjp, 1, DVector::zeros(0));
    (field, DVector::from_vec(vec![0.0]))
}
