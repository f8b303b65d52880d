//! Weightless reshaping layers: global average pooling and flatten

use super::FeatureShape;
use crate::error::{CompressError, Result};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};

/// Global average pooling over the spatial axes: `(b, h, w, c)` -> `(b, c)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalAvgPool2d {
    pub(crate) name: String,
}

impl GlobalAvgPool2d {
    /// New pooling layer.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(&self, input: &FeatureShape) -> Result<FeatureShape> {
        match *input {
            FeatureShape::Map { channels, .. } => Ok(FeatureShape::flat(channels)),
            other => Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: "a feature map".into(),
                actual: other.to_string(),
            }),
        }
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Array2<f32> {
        let (batch, h, w, channels) = x.dim();
        let scale = 1.0 / (h * w) as f32;
        let mut out = Array2::<f32>::zeros((batch, channels));
        for b in 0..batch {
            for y in 0..h {
                for xw in 0..w {
                    for c in 0..channels {
                        out[[b, c]] += x[[b, y, xw, c]];
                    }
                }
            }
        }
        out.mapv_inplace(|v| v * scale);
        out
    }

    pub(crate) fn backward(&self, x: &Array4<f32>, grad_out: &Array2<f32>) -> Array4<f32> {
        let (batch, h, w, channels) = x.dim();
        let scale = 1.0 / (h * w) as f32;
        let mut grad_x = Array4::<f32>::zeros(x.raw_dim());
        for b in 0..batch {
            for y in 0..h {
                for xw in 0..w {
                    for c in 0..channels {
                        grad_x[[b, y, xw, c]] = grad_out[[b, c]] * scale;
                    }
                }
            }
        }
        grad_x
    }
}

/// Flatten `(b, h, w, c)` row-major into `(b, h*w*c)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flatten {
    pub(crate) name: String,
}

impl Flatten {
    /// New flatten layer.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(&self, input: &FeatureShape) -> Result<FeatureShape> {
        match *input {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => Ok(FeatureShape::flat(height * width * channels)),
            // Flattening an already-flat feature is the identity.
            FeatureShape::Flat { features } => Ok(FeatureShape::flat(features)),
        }
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Array2<f32> {
        let (batch, h, w, c) = x.dim();
        x.to_owned()
            .into_shape((batch, h * w * c))
            .expect("NHWC tensors are contiguous")
    }

    pub(crate) fn backward(&self, x: &Array4<f32>, grad_out: &Array2<f32>) -> Array4<f32> {
        grad_out
            .to_owned()
            .into_shape(x.raw_dim())
            .expect("flatten preserves element count")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_global_avg_pool_means() {
        let x = Array4::from_shape_fn((1, 2, 2, 2), |(_, y, xw, c)| (y * 2 + xw) as f32 + c as f32);
        let pool = GlobalAvgPool2d::new("gap");
        let out = pool.forward(&x);
        assert_eq!(out.dim(), (1, 2));
        assert_abs_diff_eq!(out[[0, 0]], 1.5);
        assert_abs_diff_eq!(out[[0, 1]], 2.5);
    }

    #[test]
    fn test_global_avg_pool_backward_distributes() {
        let x = Array4::zeros((1, 2, 2, 1));
        let grad_out = Array2::from_elem((1, 1), 4.0);
        let pool = GlobalAvgPool2d::new("gap");
        let grad_x = pool.backward(&x, &grad_out);
        assert!(grad_x.iter().all(|&g| (g - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_flatten_round_trip() {
        let x = Array4::from_shape_fn((2, 2, 3, 2), |(b, y, xw, c)| {
            (b * 100 + y * 10 + xw * 2 + c) as f32
        });
        let flat = Flatten::new("flatten");
        let y = flat.forward(&x);
        assert_eq!(y.dim(), (2, 12));
        let back = flat.backward(&x, &y);
        assert_eq!(back, x);
    }
}
