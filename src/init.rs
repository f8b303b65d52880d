//! Weight initializers
//!
//! Small pure functions that produce fresh weight tensors. Layers call these
//! when they are built against an input shape without pre-set weights; the
//! factorization fits call them for their factor matrices.

use ndarray::{Array, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::StandardNormal;

/// Standard deviation used for Gaussian factor/kernel initialization.
pub const NORMAL_STDDEV: f32 = 0.05;

/// Gaussian initializer with mean 0 and stddev [`NORMAL_STDDEV`].
pub fn random_normal<Sh, D>(shape: Sh, rng: &mut impl Rng) -> Array<f32, D>
where
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
{
    Array::from_shape_simple_fn(shape, || {
        let z: f32 = rng.sample(StandardNormal);
        z * NORMAL_STDDEV
    })
}

/// Glorot (Xavier) uniform initializer for dense/convolution kernels.
///
/// Samples from `U(-limit, limit)` with `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform<Sh, D>(shape: Sh, fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Array<f32, D>
where
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
{
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array::from_shape_simple_fn(shape, || rng.gen_range(-limit..limit))
}

/// Random {0, 1} initializer, used to seed sparse dictionary codes.
pub fn random_binary<Sh, D>(shape: Sh, rng: &mut impl Rng) -> Array<f32, D>
where
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
{
    Array::from_shape_simple_fn(shape, || if rng.gen_bool(0.5) { 1.0 } else { 0.0 })
}

/// Identity matrix initializer.
pub fn identity(n: usize) -> ndarray::Array2<f32> {
    ndarray::Array2::eye(n)
}
