use std::fmt::{Debug, Display};

/// Floating point type used for states, times and parameters.
///
/// Everything the solvers need comes from [nalgebra::RealField] (arithmetic, `abs`, `sqrt`,
/// `powf`, `max`) plus a couple of constants and a lossy conversion used when reporting errors.
pub trait Scalar:
    nalgebra::RealField + num_traits::FromPrimitive + Copy + Display + Debug + Send + Sync
{
    const EPSILON: Self;
    const INFINITY: Self;
    const NAN: Self;

    /// Lossy conversion used for diagnostics (error payloads, log fields).
    fn as_f64(self) -> f64;
}

pub type IndexType = usize;

impl Scalar for f64 {
    const EPSILON: Self = f64::EPSILON;
    const INFINITY: Self = f64::INFINITY;
    const NAN: Self = f64::NAN;
    fn as_f64(self) -> f64 {
        self
    }
}

impl Scalar for f32 {
    const EPSILON: Self = f32::EPSILON;
    const INFINITY: Self = f32::INFINITY;
    const NAN: Self = f32::NAN;
    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}

/// Infallible conversion of an `f64` constant into the scalar type.
#[inline]
pub fn constant<T: Scalar>(value: f64) -> T {
    nalgebra::convert(value)
}

#[test]
fn test_constant() {
    assert_eq!(constant::<f32>(0.5), 0.5f32);
    assert_eq!(constant::<f64>(0.9).as_f64(), 0.9);
}
