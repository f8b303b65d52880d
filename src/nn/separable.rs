//! Depthwise-separable convolution layer

use super::conv::{activate_map, backprop_map, conv2d_backward, conv2d_forward};
use super::{Activation, FeatureShape, Padding};
use crate::error::{CompressError, Result};
use crate::init;
use ndarray::{Array1, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Separable convolution: a per-channel spatial filter followed by a 1x1
/// pointwise mix down to `filters` outputs. Replaces a full `kh*kw*c*f`
/// kernel with `kh*kw*c + c*f` weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparableConv2d {
    pub(crate) name: String,
    pub(crate) filters: usize,
    pub(crate) kernel_size: (usize, usize),
    pub(crate) padding: Padding,
    pub(crate) activation: Activation,
    /// `(kh, kw, channels, 1)`
    pub(crate) depthwise: Option<Array4<f32>>,
    /// `(1, 1, channels, filters)`
    pub(crate) pointwise: Option<Array4<f32>>,
    pub(crate) bias: Option<Array1<f32>>,
}

impl SeparableConv2d {
    /// Fresh (unbuilt) separable convolution.
    pub fn new(
        name: impl Into<String>,
        filters: usize,
        kernel_size: (usize, usize),
        activation: Activation,
        padding: Padding,
    ) -> Self {
        Self {
            name: name.into(),
            filters,
            kernel_size,
            padding,
            activation,
            depthwise: None,
            pointwise: None,
            bias: None,
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

    fn depthwise_forward(&self, x: &Array4<f32>, dw: &Array4<f32>) -> Array4<f32> {
        let (batch, h, w, channels) = x.dim();
        let (kh, kw, _, _) = dw.dim();
        let (oh, ow) = (
            self.padding.out_extent(h, kh),
            self.padding.out_extent(w, kw),
        );
        let (ph, pw) = (self.padding.offset(kh), self.padding.offset(kw));
        let mut out = Array4::<f32>::zeros((batch, oh, ow, channels));
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    for ky in 0..kh {
                        let iy = (oy + ky).wrapping_sub(ph);
                        if iy >= h {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox + kx).wrapping_sub(pw);
                            if ix >= w {
                                continue;
                            }
                            for c in 0..channels {
                                out[[b, oy, ox, c]] += x[[b, iy, ix, c]] * dw[[ky, kx, c, 0]];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn depthwise_backward(
        &self,
        x: &Array4<f32>,
        dw: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> (Array4<f32>, Array4<f32>) {
        let (batch, h, w, channels) = x.dim();
        let (kh, kw, _, _) = dw.dim();
        let (_, oh, ow, _) = grad_out.dim();
        let (ph, pw) = (self.padding.offset(kh), self.padding.offset(kw));
        let mut grad_dw = Array4::<f32>::zeros(dw.raw_dim());
        let mut grad_x = Array4::<f32>::zeros(x.raw_dim());
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    for ky in 0..kh {
                        let iy = (oy + ky).wrapping_sub(ph);
                        if iy >= h {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox + kx).wrapping_sub(pw);
                            if ix >= w {
                                continue;
                            }
                            for c in 0..channels {
                                let g = grad_out[[b, oy, ox, c]];
                                grad_dw[[ky, kx, c, 0]] += x[[b, iy, ix, c]] * g;
                                grad_x[[b, iy, ix, c]] += dw[[ky, kx, c, 0]] * g;
                            }
                        }
                    }
                }
            }
        }
        (grad_dw, grad_x)
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
        if h < kh || w < kw {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("spatial extent >= ({kh}, {kw})"),
                actual: input.to_string(),
            });
        }
        match &self.depthwise {
            Some(dw) => {
                if dw.dim().2 != c {
                    return Err(CompressError::ShapeMismatch {
                        layer: self.name.clone(),
                        expected: format!("{} input channels", dw.dim().2),
                        actual: input.to_string(),
                    });
                }
            }
            None => {
                self.depthwise = Some(init::glorot_uniform(
                    (kh, kw, c, 1),
                    kh * kw,
                    kh * kw,
                    rng,
                ));
                self.pointwise = Some(init::glorot_uniform((1, 1, c, self.filters), c, self.filters, rng));
                self.bias = Some(Array1::zeros(self.filters));
            }
        }
        Ok(FeatureShape::map(
            self.padding.out_extent(h, kh),
            self.padding.out_extent(w, kw),
            self.filters,
        ))
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (dw, pw) = self.weights()?;
        let mid = self.depthwise_forward(x, dw);
        let mut z = conv2d_forward(&mid, pw, self.bias.as_ref(), Padding::Valid);
        activate_map(self.activation, &mut z);
        Ok(z)
    }

    pub(crate) fn backward(
        &self,
        x: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> Result<(Vec<Array1<f32>>, Array4<f32>)> {
        let (dw, pw) = self.weights()?;
        let mid = self.depthwise_forward(x, dw);
        let z = conv2d_forward(&mid, pw, self.bias.as_ref(), Padding::Valid);
        let grad_z = backprop_map(self.activation, &z, grad_out);
        let (grad_pw, grad_bias, grad_mid) = conv2d_backward(&mid, pw, Padding::Valid, &grad_z);
        let (grad_dw, grad_x) = self.depthwise_backward(x, dw, &grad_mid);
        Ok((
            vec![
                Array1::from_iter(grad_dw.iter().copied()),
                Array1::from_iter(grad_pw.iter().copied()),
                grad_bias,
            ],
            grad_x,
        ))
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        match (&self.depthwise, &self.pointwise, &self.bias) {
            (Some(d), Some(p), Some(b)) => vec![
                d.as_slice().expect("contiguous"),
                p.as_slice().expect("contiguous"),
                b.as_slice().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        match (&mut self.depthwise, &mut self.pointwise, &mut self.bias) {
            (Some(d), Some(p), Some(b)) => vec![
                d.as_slice_mut().expect("contiguous"),
                p.as_slice_mut().expect("contiguous"),
                b.as_slice_mut().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn trainable_weight_count(&self) -> usize {
        self.depthwise.as_ref().map_or(0, |d| d.len())
            + self.pointwise.as_ref().map_or(0, |p| p.len())
            + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn weights(&self) -> Result<(&Array4<f32>, &Array4<f32>)> {
        match (&self.depthwise, &self.pointwise) {
            (Some(d), Some(p)) => Ok((d, p)),
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
    fn test_build_and_forward_shapes() {
        let mut layer = SeparableConv2d::new("sep", 4, (3, 3), Activation::Linear, Padding::Valid);
        let mut rng = StdRng::seed_from_u64(3);
        let out = layer.build(&FeatureShape::map(6, 6, 2), &mut rng).unwrap();
        assert_eq!(out, FeatureShape::map(4, 4, 4));

        let x = Array4::from_elem((1, 6, 6, 2), 0.5);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dim(), (1, 4, 4, 4));
    }

    #[test]
    fn test_weight_count_smaller_than_full_conv() {
        let mut layer = SeparableConv2d::new("sep", 16, (3, 3), Activation::Linear, Padding::Valid);
        let mut rng = StdRng::seed_from_u64(3);
        layer.build(&FeatureShape::map(8, 8, 8), &mut rng).unwrap();
        // 3*3*8 + 8*16 + 16 vs full conv 3*3*8*16 + 16
        assert!(layer.trainable_weight_count() < 3 * 3 * 8 * 16 + 16);
    }

    #[test]
    fn test_backward_param_grad_shapes() {
        let mut layer = SeparableConv2d::new("sep", 3, (3, 3), Activation::Relu, Padding::Valid);
        let mut rng = StdRng::seed_from_u64(3);
        layer.build(&FeatureShape::map(5, 5, 2), &mut rng).unwrap();
        let x = Array4::from_elem((2, 5, 5, 2), 0.3);
        let grad_out = Array4::from_elem((2, 3, 3, 3), 1.0);
        let (grads, grad_x) = layer.backward(&x, &grad_out).unwrap();
        assert_eq!(grads.len(), 3);
        assert_eq!(grads[0].len(), 3 * 3 * 2);
        assert_eq!(grads[1].len(), 2 * 3);
        assert_eq!(grads[2].len(), 3);
        assert_eq!(grad_x.dim(), x.dim());
    }
}
