use nalgebra::DVector;
use num_traits::Zero;

use crate::{scalar::constant, Scalar};

/// Norms and checks the solvers need on top of [nalgebra::DVector].
pub trait VectorNorm<T: Scalar> {
    /// returns \sum_i (x_i / (atol + rtol * max(|y0_i|, |y1_i|)))^2 over the index range `start..end`
    fn squared_norm_range(
        &self,
        y0: &Self,
        y1: &Self,
        atol: T,
        rtol: T,
        start: usize,
        end: usize,
    ) -> T;

    /// Root mean square of `x_i / (atol + rtol * max(|y0_i|, |y1_i|))`.
    ///
    /// When `nchunks > 1` the vector is treated as `nchunks` equally sized, independent states
    /// and the worst (largest) per-chunk norm is returned.
    fn error_norm(&self, y0: &Self, y1: &Self, atol: T, rtol: T, nchunks: usize) -> T;

    fn is_all_finite(&self) -> bool;

    fn to_f64_vec(&self) -> Vec<f64>;
}

impl<T: Scalar> VectorNorm<T> for DVector<T> {
    fn squared_norm_range(
        &self,
        y0: &Self,
        y1: &Self,
        atol: T,
        rtol: T,
        start: usize,
        end: usize,
    ) -> T {
        let mut acc = T::zero();
        for i in start..end {
            let scale = atol + rtol * y0[i].abs().max(y1[i].abs());
            let xi = self[i] / scale;
            acc += xi * xi;
        }
        acc
    }

    fn error_norm(&self, y0: &Self, y1: &Self, atol: T, rtol: T, nchunks: usize) -> T {
        let n = self.len();
        if n == 0 {
            return T::zero();
        }
        let nchunks = nchunks.max(1);
        let chunk = n / nchunks;
        let mut worst = T::zero();
        for c in 0..nchunks {
            let start = c * chunk;
            let end = if c + 1 == nchunks { n } else { start + chunk };
            let len: T = constant((end - start) as f64);
            let norm = (self.squared_norm_range(y0, y1, atol, rtol, start, end) / len).sqrt();
            // non-finite norms must win so the caller sees them
            if !norm.is_finite() || norm > worst {
                worst = norm;
            }
        }
        worst
    }

    fn is_all_finite(&self) -> bool {
        self.iter().all(|x| x.is_finite())
    }

    fn to_f64_vec(&self) -> Vec<f64> {
        self.iter().map(|x| x.as_f64()).collect()
    }
}
