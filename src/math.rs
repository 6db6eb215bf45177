/// Create a `NonZero` from a literal, failing to compile on zero.
macro_rules! nz {
    ($val:expr) => {
        const { core::num::NonZero::new($val).expect("value should not be zero") }
    };
}

pub(crate) use nz;

/// Linear interpolation between two samples.
///
/// The result should be equivalent to
/// `first * (1 - numerator / denominator) + second * numerator / denominator`.
///
/// To avoid numeric overflows pick smaller numerator.
#[inline]
pub fn lerp(first: &f32, second: &f32, numerator: u32, denominator: u32) -> f32 {
    first + (second - first) * numerator as f32 / denominator as f32
}
