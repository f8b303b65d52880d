//! Fire module: 1x1 squeeze followed by parallel 1x1 and 3x3 expand branches
//!
//! The branch outputs are concatenated along the channel axis and cropped by
//! one pixel on each border so the module shrinks the spatial extent like a
//! 3x3 valid convolution does.

use super::conv::{activate_map, backprop_map, conv2d_backward, conv2d_forward};
use super::{Activation, FeatureShape, Padding};
use crate::error::{CompressError, Result};
use crate::init;
use ndarray::{Array1, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fire module replacement for a full convolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireModule {
    pub(crate) name: String,
    pub(crate) squeeze_filters: usize,
    pub(crate) expand1_filters: usize,
    pub(crate) expand3_filters: usize,
    /// `(1, 1, in, squeeze)`
    pub(crate) squeeze_kernel: Option<Array4<f32>>,
    pub(crate) squeeze_bias: Option<Array1<f32>>,
    /// `(1, 1, squeeze, expand1)`
    pub(crate) expand1_kernel: Option<Array4<f32>>,
    pub(crate) expand1_bias: Option<Array1<f32>>,
    /// `(3, 3, squeeze, expand3)`
    pub(crate) expand3_kernel: Option<Array4<f32>>,
    pub(crate) expand3_bias: Option<Array1<f32>>,
}

impl FireModule {
    /// Fresh (unbuilt) fire module.
    pub fn new(
        name: impl Into<String>,
        squeeze_filters: usize,
        expand1_filters: usize,
        expand3_filters: usize,
    ) -> Self {
        Self {
            name: name.into(),
            squeeze_filters,
            expand1_filters,
            expand3_filters,
            squeeze_kernel: None,
            squeeze_bias: None,
            expand1_kernel: None,
            expand1_bias: None,
            expand3_kernel: None,
            expand3_bias: None,
        }
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output channel count (both expand branches concatenated).
    pub fn filters(&self) -> usize {
        self.expand1_filters + self.expand3_filters
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
        if h < 3 || w < 3 {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: "spatial extent >= (3, 3)".into(),
                actual: input.to_string(),
            });
        }
        match &self.squeeze_kernel {
            Some(k) => {
                if k.dim().2 != c {
                    return Err(CompressError::ShapeMismatch {
                        layer: self.name.clone(),
                        expected: format!("{} input channels", k.dim().2),
                        actual: input.to_string(),
                    });
                }
            }
            None => {
                let s = self.squeeze_filters;
                self.squeeze_kernel = Some(init::glorot_uniform((1, 1, c, s), c, s, rng));
                self.squeeze_bias = Some(Array1::zeros(s));
                self.expand1_kernel = Some(init::glorot_uniform(
                    (1, 1, s, self.expand1_filters),
                    s,
                    self.expand1_filters,
                    rng,
                ));
                self.expand1_bias = Some(Array1::zeros(self.expand1_filters));
                self.expand3_kernel = Some(init::glorot_uniform(
                    (3, 3, s, self.expand3_filters),
                    9 * s,
                    9 * self.expand3_filters,
                    rng,
                ));
                self.expand3_bias = Some(Array1::zeros(self.expand3_filters));
            }
        }
        Ok(FeatureShape::map(h - 2, w - 2, self.filters()))
    }

    fn squeeze_out(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let k = self.squeeze_kernel.as_ref().ok_or_else(|| self.not_built())?;
        let mut z = conv2d_forward(x, k, self.squeeze_bias.as_ref(), Padding::Valid);
        activate_map(Activation::Relu, &mut z);
        Ok(z)
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let sq = self.squeeze_out(x)?;
        let e1k = self.expand1_kernel.as_ref().ok_or_else(|| self.not_built())?;
        let e3k = self.expand3_kernel.as_ref().ok_or_else(|| self.not_built())?;
        let o1 = conv2d_forward(&sq, e1k, self.expand1_bias.as_ref(), Padding::Valid);
        let o3 = conv2d_forward(&sq, e3k, self.expand3_bias.as_ref(), Padding::Same);

        let (batch, h, w, _) = o1.dim();
        let (e1, e3) = (self.expand1_filters, self.expand3_filters);
        let mut out = Array4::<f32>::zeros((batch, h - 2, w - 2, e1 + e3));
        for b in 0..batch {
            for y in 0..h - 2 {
                for xw in 0..w - 2 {
                    for c in 0..e1 {
                        out[[b, y, xw, c]] = o1[[b, y + 1, xw + 1, c]];
                    }
                    for c in 0..e3 {
                        out[[b, y, xw, e1 + c]] = o3[[b, y + 1, xw + 1, c]];
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn backward(
        &self,
        x: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> Result<(Vec<Array1<f32>>, Array4<f32>)> {
        let sk = self.squeeze_kernel.as_ref().ok_or_else(|| self.not_built())?;
        let e1k = self.expand1_kernel.as_ref().ok_or_else(|| self.not_built())?;
        let e3k = self.expand3_kernel.as_ref().ok_or_else(|| self.not_built())?;

        let z_sq = conv2d_forward(x, sk, self.squeeze_bias.as_ref(), Padding::Valid);
        let mut sq = z_sq.clone();
        activate_map(Activation::Relu, &mut sq);

        // Undo the crop: scatter the output gradient back into the branch
        // gradients with a zero border, then split by channel block.
        let (batch, h, w, _) = sq.dim();
        let (e1, e3) = (self.expand1_filters, self.expand3_filters);
        let mut g1 = Array4::<f32>::zeros((batch, h, w, e1));
        let mut g3 = Array4::<f32>::zeros((batch, h, w, e3));
        for b in 0..batch {
            for y in 0..h - 2 {
                for xw in 0..w - 2 {
                    for c in 0..e1 {
                        g1[[b, y + 1, xw + 1, c]] = grad_out[[b, y, xw, c]];
                    }
                    for c in 0..e3 {
                        g3[[b, y + 1, xw + 1, c]] = grad_out[[b, y, xw, e1 + c]];
                    }
                }
            }
        }

        let (ge1k, ge1b, gsq_1) = conv2d_backward(&sq, e1k, Padding::Valid, &g1);
        let (ge3k, ge3b, gsq_3) = conv2d_backward(&sq, e3k, Padding::Same, &g3);
        let gsq = &gsq_1 + &gsq_3;
        let gz_sq = backprop_map(Activation::Relu, &z_sq, &gsq);
        let (gsk, gsb, gx) = conv2d_backward(x, sk, Padding::Valid, &gz_sq);

        Ok((
            vec![
                Array1::from_iter(gsk.iter().copied()),
                gsb,
                Array1::from_iter(ge1k.iter().copied()),
                ge1b,
                Array1::from_iter(ge3k.iter().copied()),
                ge3b,
            ],
            gx,
        ))
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        let built = [
            self.squeeze_kernel.as_ref().map(|a| a.as_slice().expect("contiguous")),
            self.squeeze_bias.as_ref().map(|a| a.as_slice().expect("contiguous")),
            self.expand1_kernel.as_ref().map(|a| a.as_slice().expect("contiguous")),
            self.expand1_bias.as_ref().map(|a| a.as_slice().expect("contiguous")),
            self.expand3_kernel.as_ref().map(|a| a.as_slice().expect("contiguous")),
            self.expand3_bias.as_ref().map(|a| a.as_slice().expect("contiguous")),
        ];
        if built.iter().any(Option::is_none) {
            return Vec::new();
        }
        built.into_iter().flatten().collect()
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        match (
            &mut self.squeeze_kernel,
            &mut self.squeeze_bias,
            &mut self.expand1_kernel,
            &mut self.expand1_bias,
            &mut self.expand3_kernel,
            &mut self.expand3_bias,
        ) {
            (Some(sk), Some(sb), Some(e1k), Some(e1b), Some(e3k), Some(e3b)) => vec![
                sk.as_slice_mut().expect("contiguous"),
                sb.as_slice_mut().expect("contiguous"),
                e1k.as_slice_mut().expect("contiguous"),
                e1b.as_slice_mut().expect("contiguous"),
                e3k.as_slice_mut().expect("contiguous"),
                e3b.as_slice_mut().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn trainable_weight_count(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn not_built(&self) -> CompressError {
        CompressError::NotBuilt {
            layer: self.name.clone(),
        }
    }
}
