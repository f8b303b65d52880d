//! Structured sparse convolution through P/Q/S factor contractions
//!
//! Performs a convolution as three chained per-position contractions instead
//! of one kernel application: a channel mix (P), a projection of each spatial
//! window onto a small set of bases (Q), and a basis-to-filter combination
//! (S). The factors are fitted against the original kernel before the layer
//! is spliced in; S additionally carries an L1+L2 penalty during training.

use super::{Activation, FeatureShape};
use crate::error::{CompressError, Result};
use ndarray::{Array1, Array2, Array3, Array4, Array5};
use serde::{Deserialize, Serialize};

/// Convolution layer evaluated through the P/Q/S factorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseConv2d {
    pub(crate) name: String,
    pub(crate) filters: usize,
    pub(crate) kernel_size: (usize, usize),
    pub(crate) bases: usize,
    /// Stored from the replaced layer's config; the contraction output is
    /// left linear, matching the fitted regression target.
    pub(crate) activation: Activation,
    /// Channel mix `(channels, channels)`, row `i` mixes into channel `i`.
    pub(crate) p: Array2<f32>,
    /// Spatial bases `(channels, kh, kw, bases)`.
    pub(crate) q: Array4<f32>,
    /// Basis-to-filter map `(channels, bases, filters)`.
    pub(crate) s: Array3<f32>,
    /// L1 penalty weight on S.
    pub(crate) l1: f32,
    /// L2 penalty weight on S.
    pub(crate) l2: f32,
}

impl SparseConv2d {
    /// Build the layer from fitted factors.
    #[allow(clippy::too_many_arguments)]
    pub fn from_factors(
        name: impl Into<String>,
        kernel_size: (usize, usize),
        filters: usize,
        bases: usize,
        p: Array2<f32>,
        q: Array4<f32>,
        s: Array3<f32>,
        activation: Activation,
    ) -> Self {
        Self {
            name: name.into(),
            filters,
            kernel_size,
            bases,
            activation,
            p,
            q,
            s,
            l1: 0.5,
            l2: 0.5,
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

    /// Basis count.
    pub fn bases(&self) -> usize {
        self.bases
    }

    fn border(&self) -> (usize, usize) {
        (self.kernel_size.0 / 2, self.kernel_size.1 / 2)
    }

    pub(crate) fn build(&self, input: &FeatureShape) -> Result<FeatureShape> {
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
        if self.p.dim() != (c, c) {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("channel mix ({0}, {0})", self.p.dim().0),
                actual: input.to_string(),
            });
        }
        let (dh, dw) = self.border();
        if h <= 2 * dh || w <= 2 * dw {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("spatial extent > ({}, {})", 2 * dh, 2 * dw),
                actual: input.to_string(),
            });
        }
        Ok(FeatureShape::map(h - 2 * dh, w - 2 * dw, self.filters))
    }

    /// Channel mix stage: `J[b, y, x, i] = sum_c x[b, y, x, c] * P[i, c]`.
    fn mix_channels(&self, x: &Array4<f32>) -> Array4<f32> {
        let (batch, h, w, channels) = x.dim();
        let mut j = Array4::<f32>::zeros((batch, h, w, channels));
        for b in 0..batch {
            for y in 0..h {
                for xw in 0..w {
                    for i in 0..channels {
                        let mut acc = 0.0;
                        for c in 0..channels {
                            acc += x[[b, y, xw, c]] * self.p[[i, c]];
                        }
                        j[[b, y, xw, i]] = acc;
                    }
                }
            }
        }
        j
    }

    /// Basis projection stage over interior positions:
    /// `tau[b, i, oy, ox, k] = sum_{u,v} J[b, oy+u, ox+v, i] * Q[i, u, v, k]`.
    fn project_bases(&self, j: &Array4<f32>) -> Array5<f32> {
        let (batch, h, w, channels) = j.dim();
        let (kh, kw) = self.kernel_size;
        let (dh, dw) = self.border();
        let (oh, ow) = (h - 2 * dh, w - 2 * dw);
        let mut tau = Array5::<f32>::zeros((batch, channels, oh, ow, self.bases));
        for b in 0..batch {
            for i in 0..channels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        for k in 0..self.bases {
                            let mut acc = 0.0;
                            for u in 0..kh {
                                for v in 0..kw {
                                    acc += j[[b, oy + u, ox + v, i]] * self.q[[i, u, v, k]];
                                }
                            }
                            tau[[b, i, oy, ox, k]] = acc;
                        }
                    }
                }
            }
        }
        tau
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let j = self.mix_channels(x);
        let tau = self.project_bases(&j);
        let (batch, channels, oh, ow, _) = tau.dim();
        let mut out = Array4::<f32>::zeros((batch, oh, ow, self.filters));
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    for jf in 0..self.filters {
                        let mut acc = 0.0;
                        for i in 0..channels {
                            for k in 0..self.bases {
                                acc += tau[[b, i, oy, ox, k]] * self.s[[i, k, jf]];
                            }
                        }
                        out[[b, oy, ox, jf]] = acc;
                    }
                }
            }
        }
        out
    }

    pub(crate) fn backward(
        &self,
        x: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> (Vec<Array1<f32>>, Array4<f32>) {
        let (batch, h, w, channels) = x.dim();
        let (kh, kw) = self.kernel_size;
        let (_, oh, ow, _) = grad_out.dim();

        let j = self.mix_channels(x);
        let tau = self.project_bases(&j);

        // S gradient (with its L1+L2 penalty) and tau gradient.
        let mut grad_s = Array3::<f32>::zeros(self.s.raw_dim());
        let mut grad_tau = Array5::<f32>::zeros(tau.raw_dim());
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    for jf in 0..self.filters {
                        let g = grad_out[[b, oy, ox, jf]];
                        if g == 0.0 {
                            continue;
                        }
                        for i in 0..channels {
                            for k in 0..self.bases {
                                grad_s[[i, k, jf]] += tau[[b, i, oy, ox, k]] * g;
                                grad_tau[[b, i, oy, ox, k]] += g * self.s[[i, k, jf]];
                            }
                        }
                    }
                }
            }
        }
        grad_s.zip_mut_with(&self.s, |g, &sv| {
            *g += self.l1 * sv.signum() + 2.0 * self.l2 * sv;
        });

        // Q gradient and J gradient.
        let mut grad_q = Array4::<f32>::zeros(self.q.raw_dim());
        let mut grad_j = Array4::<f32>::zeros(j.raw_dim());
        for b in 0..batch {
            for i in 0..channels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        for k in 0..self.bases {
                            let g = grad_tau[[b, i, oy, ox, k]];
                            if g == 0.0 {
                                continue;
                            }
                            for u in 0..kh {
                                for v in 0..kw {
                                    grad_q[[i, u, v, k]] += j[[b, oy + u, ox + v, i]] * g;
                                    grad_j[[b, oy + u, ox + v, i]] += self.q[[i, u, v, k]] * g;
                                }
                            }
                        }
                    }
                }
            }
        }

        // P gradient and input gradient.
        let mut grad_p = Array2::<f32>::zeros(self.p.raw_dim());
        let mut grad_x = Array4::<f32>::zeros(x.raw_dim());
        for b in 0..batch {
            for y in 0..h {
                for xw in 0..w {
                    for i in 0..channels {
                        let g = grad_j[[b, y, xw, i]];
                        if g == 0.0 {
                            continue;
                        }
                        for c in 0..channels {
                            grad_p[[i, c]] += g * x[[b, y, xw, c]];
                            grad_x[[b, y, xw, c]] += g * self.p[[i, c]];
                        }
                    }
                }
            }
        }

        (
            vec![
                Array1::from_iter(grad_s.iter().copied()),
                Array1::from_iter(grad_q.iter().copied()),
                Array1::from_iter(grad_p.iter().copied()),
            ],
            grad_x,
        )
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        vec![
            self.s.as_slice().expect("contiguous"),
            self.q.as_slice().expect("contiguous"),
            self.p.as_slice().expect("contiguous"),
        ]
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        vec![
            self.s.as_slice_mut().expect("contiguous"),
            self.q.as_slice_mut().expect("contiguous"),
            self.p.as_slice_mut().expect("contiguous"),
        ]
    }

    pub(crate) fn trainable_weight_count(&self) -> usize {
        self.s.len() + self.q.len() + self.p.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn identity_layer(channels: usize, filters: usize, bases: usize) -> SparseConv2d {
        // P = I, Q puts basis 0 on the window center, S maps channel sums.
        let p = Array2::eye(channels);
        let mut q = Array4::<f32>::zeros((channels, 3, 3, bases));
        for i in 0..channels {
            q[[i, 1, 1, 0]] = 1.0;
        }
        let mut s = Array3::<f32>::zeros((channels, bases, filters));
        for i in 0..channels {
            for f in 0..filters {
                s[[i, 0, f]] = 1.0;
            }
        }
        SparseConv2d::from_factors("pqs", (3, 3), filters, bases, p, q, s, Activation::Linear)
    }

    #[test]
    fn test_center_basis_reproduces_channel_sum() {
        let layer = identity_layer(2, 1, 2);
        let mut x = Array4::<f32>::zeros((1, 4, 4, 2));
        x[[0, 1, 1, 0]] = 3.0;
        x[[0, 1, 1, 1]] = 4.0;
        let out = layer.forward(&x);
        assert_eq!(out.dim(), (1, 2, 2, 1));
        // Interior position (0, 0) has its window center at (1, 1).
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], 7.0);
    }

    #[test]
    fn test_backward_shapes_and_regularizer() {
        let layer = identity_layer(2, 2, 2);
        let x = Array4::from_elem((1, 4, 4, 2), 0.5);
        let grad_out = Array4::<f32>::zeros((1, 2, 2, 2));
        let (grads, grad_x) = layer.backward(&x, &grad_out);
        assert_eq!(grads.len(), 3);
        assert_eq!(grads[0].len(), 2 * 2 * 2);
        assert_eq!(grads[1].len(), 2 * 3 * 3 * 2);
        assert_eq!(grads[2].len(), 4);
        assert_eq!(grad_x.dim(), x.dim());
        // With a zero output gradient the S gradient is pure penalty:
        // l1 * sign(1) + 2 * l2 * 1 = 1.5 on the unit entries.
        let s_grad = &grads[0];
        assert!(s_grad.iter().any(|&g| (g - 1.5).abs() < 1e-6));
    }

    #[test]
    fn test_build_rejects_wrong_channels() {
        let layer = identity_layer(2, 1, 1);
        let err = layer.build(&FeatureShape::map(4, 4, 3)).unwrap_err();
        assert!(matches!(err, CompressError::ShapeMismatch { .. }));
    }
}
