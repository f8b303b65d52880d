//! Per-pixel MLP surrogate for a convolution
//!
//! Evaluates a two-layer perceptron over every interior receptive-field
//! position (a border of half the kernel extent is excluded), vectorized as
//! one matmul over all positions of the batch.

use super::{Activation, FeatureShape};
use crate::error::{CompressError, Result};
use crate::init;
use ndarray::{Array1, Array2, Array4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-position MLP layer: `patch -> filters -> filters`, with the original
/// convolution's activation after each of the two matmuls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpConv {
    pub(crate) name: String,
    pub(crate) filters: usize,
    pub(crate) kernel_size: (usize, usize),
    pub(crate) activation: Activation,
    /// `(kh * kw * channels, filters)`
    pub(crate) w0: Option<Array2<f32>>,
    pub(crate) b0: Option<Array1<f32>>,
    /// `(filters, filters)`
    pub(crate) w1: Option<Array2<f32>>,
    pub(crate) b1: Option<Array1<f32>>,
}

impl MlpConv {
    /// Fresh (unbuilt) MLP surrogate.
    pub fn new(
        name: impl Into<String>,
        filters: usize,
        kernel_size: (usize, usize),
        activation: Activation,
    ) -> Self {
        Self {
            name: name.into(),
            filters,
            kernel_size,
            activation,
            w0: None,
            b0: None,
            w1: None,
            b1: None,
        }
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filter count.
    pub fn filters(&self) -> usize {
        self.filters
    }

    fn border(&self) -> (usize, usize) {
        (self.kernel_size.0 / 2, self.kernel_size.1 / 2)
    }

    pub(crate) fn build(
        &mut self,
        input: &FeatureShape,
        rng: &mut impl Rng,
    ) -> Result<FeatureShape> {
        let (h, w, c) = match *input {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => (height, width, channels),
            other => {
                return Err(CompressError::ShapeMismatch {
                    layer: self.name.clone(),
                    expected: "a feature map".into(),
                    actual: other.to_string(),
                })
            }
        };
        let (kh, kw) = self.kernel_size;
        let patch = kh * kw * c;
        let (dh, dw) = self.border();
        if h <= 2 * dh || w <= 2 * dw {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("spatial extent > ({}, {})", 2 * dh, 2 * dw),
                actual: input.to_string(),
            });
        }
        match &self.w0 {
            Some(w0) => {
                if w0.dim().0 != patch {
                    return Err(CompressError::ShapeMismatch {
                        layer: self.name.clone(),
                        expected: format!("patch width {}", w0.dim().0),
                        actual: format!("patch width {patch}"),
                    });
                }
            }
            None => {
                self.w0 = Some(init::random_normal((patch, self.filters), rng));
                self.b0 = Some(Array1::zeros(self.filters));
                self.w1 = Some(init::random_normal((self.filters, self.filters), rng));
                self.b1 = Some(Array1::zeros(self.filters));
            }
        }
        Ok(FeatureShape::map(h - 2 * dh, w - 2 * dw, self.filters))
    }

    /// Gather the interior receptive-field patches as a
    /// `(batch * positions, kh * kw * channels)` matrix.
    fn patches(&self, x: &Array4<f32>) -> Array2<f32> {
        let (batch, h, w, c) = x.dim();
        let (kh, kw) = self.kernel_size;
        let (dh, dw) = self.border();
        let (oh, ow) = (h - 2 * dh, w - 2 * dw);
        let mut patches = Array2::<f32>::zeros((batch * oh * ow, kh * kw * c));
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = (b * oh + oy) * ow + ox;
                    let mut col = 0;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            for ci in 0..c {
                                patches[[row, col]] = x[[b, oy + ky, ox + kx, ci]];
                                col += 1;
                            }
                        }
                    }
                }
            }
        }
        patches
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (w0, b0, w1, b1) = self.weights()?;
        let (batch, h, w, _) = x.dim();
        let (dh, dw) = self.border();
        let (oh, ow) = (h - 2 * dh, w - 2 * dw);

        let patches = self.patches(x);
        let mut h0 = patches.dot(w0) + b0;
        self.activation.apply(&mut h0.view_mut());
        let mut out = h0.dot(w1) + b1;
        self.activation.apply(&mut out.view_mut());

        Ok(out
            .into_shape((batch, oh, ow, self.filters))
            .expect("positions fill the output grid"))
    }

    pub(crate) fn backward(
        &self,
        x: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> Result<(Vec<Array1<f32>>, Array4<f32>)> {
        let (w0, b0, w1, b1) = self.weights()?;
        let (batch, h, w, c) = x.dim();
        let (kh, kw) = self.kernel_size;
        let (dh, dw) = self.border();
        let (oh, ow) = (h - 2 * dh, w - 2 * dw);

        let patches = self.patches(x);
        let z0 = patches.dot(w0) + b0;
        let mut h0 = z0.clone();
        self.activation.apply(&mut h0.view_mut());
        let z1 = h0.dot(w1) + b1;

        let g_flat = grad_out
            .to_owned()
            .into_shape((batch * oh * ow, self.filters))
            .expect("NHWC tensors are contiguous");
        let gz1 = self.activation.backprop(&z1, &g_flat);
        let gw1 = h0.t().dot(&gz1);
        let gb1 = gz1.sum_axis(Axis(0));
        let gh0 = gz1.dot(&w1.t());
        let gz0 = self.activation.backprop(&z0, &gh0);
        let gw0 = patches.t().dot(&gz0);
        let gb0 = gz0.sum_axis(Axis(0));
        let gpatches = gz0.dot(&w0.t());

        // Scatter patch gradients back, accumulating over overlaps.
        let mut grad_x = Array4::<f32>::zeros(x.raw_dim());
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = (b * oh + oy) * ow + ox;
                    let mut col = 0;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            for ci in 0..c {
                                grad_x[[b, oy + ky, ox + kx, ci]] += gpatches[[row, col]];
                                col += 1;
                            }
                        }
                    }
                }
            }
        }

        Ok((
            vec![
                Array1::from_iter(gw0.iter().copied()),
                gb0,
                Array1::from_iter(gw1.iter().copied()),
                gb1,
            ],
            grad_x,
        ))
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        match (&self.w0, &self.b0, &self.w1, &self.b1) {
            (Some(w0), Some(b0), Some(w1), Some(b1)) => vec![
                w0.as_slice().expect("contiguous"),
                b0.as_slice().expect("contiguous"),
                w1.as_slice().expect("contiguous"),
                b1.as_slice().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        match (&mut self.w0, &mut self.b0, &mut self.w1, &mut self.b1) {
            (Some(w0), Some(b0), Some(w1), Some(b1)) => vec![
                w0.as_slice_mut().expect("contiguous"),
                b0.as_slice_mut().expect("contiguous"),
                w1.as_slice_mut().expect("contiguous"),
                b1.as_slice_mut().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn trainable_weight_count(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn weights(&self) -> Result<(&Array2<f32>, &Array1<f32>, &Array2<f32>, &Array1<f32>)> {
        match (&self.w0, &self.b0, &self.w1, &self.b1) {
            (Some(w0), Some(b0), Some(w1), Some(b1)) => Ok((w0, b0, w1, b1)),
            _ => Err(CompressError::NotBuilt {
                layer: self.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_build_and_output_shape() {
        let mut layer = MlpConv::new("mlp", 4, (3, 3), Activation::Relu);
        let mut rng = StdRng::seed_from_u64(5);
        let out = layer.build(&FeatureShape::map(6, 6, 2), &mut rng).unwrap();
        assert_eq!(out, FeatureShape::map(4, 4, 4));

        let x = Array4::from_elem((2, 6, 6, 2), 0.25);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dim(), (2, 4, 4, 4));
    }

    #[test]
    fn test_weight_count() {
        let mut layer = MlpConv::new("mlp", 4, (3, 3), Activation::Relu);
        let mut rng = StdRng::seed_from_u64(5);
        layer.build(&FeatureShape::map(6, 6, 2), &mut rng).unwrap();
        assert_eq!(
            layer.trainable_weight_count(),
            (3 * 3 * 2) * 4 + 4 + 4 * 4 + 4
        );
    }

    #[test]
    fn test_backward_grad_shapes() {
        let mut layer = MlpConv::new("mlp", 3, (3, 3), Activation::Relu);
        let mut rng = StdRng::seed_from_u64(5);
        layer.build(&FeatureShape::map(5, 5, 2), &mut rng).unwrap();
        let x = Array4::from_elem((1, 5, 5, 2), 0.2);
        let grad_out = Array4::from_elem((1, 3, 3, 3), 1.0);
        let (grads, grad_x) = layer.backward(&x, &grad_out).unwrap();
        assert_eq!(grads.len(), 4);
        assert_eq!(grads[0].len(), 18 * 3);
        assert_eq!(grad_x.dim(), x.dim());
    }
}
