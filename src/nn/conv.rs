//! Stride-1 NHWC convolution primitive and the standard convolution layer
//!
//! Kernels are laid out `(kh, kw, in_channels, filters)`. The forward and
//! backward passes are explicit free functions so that the composite layers
//! (separable, fire, masked) can share them.

use super::{Activation, FeatureShape};
use crate::error::{CompressError, Result};
use crate::init;
use ndarray::{Array1, Array2, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Spatial padding mode for stride-1 convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// No padding; output shrinks by `kernel - 1`.
    #[default]
    Valid,
    /// Zero padding preserving the spatial size.
    Same,
}

impl Padding {
    /// Top/left zero rows for a kernel extent.
    pub fn offset(&self, k: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => (k - 1) / 2,
        }
    }

    /// Output extent for an input extent and kernel extent.
    pub fn out_extent(&self, input: usize, k: usize) -> usize {
        match self {
            Padding::Valid => input + 1 - k,
            Padding::Same => input,
        }
    }
}

/// Convolve `x` `(b, h, w, c)` with `kernel` `(kh, kw, c, f)`, stride 1.
pub fn conv2d_forward(
    x: &Array4<f32>,
    kernel: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    padding: Padding,
) -> Array4<f32> {
    let (batch, h, w, channels) = x.dim();
    let (kh, kw, kc, filters) = kernel.dim();
    debug_assert_eq!(channels, kc);
    let (oh, ow) = (padding.out_extent(h, kh), padding.out_extent(w, kw));
    let (ph, pw) = (padding.offset(kh), padding.offset(kw));

    let mut out = Array4::<f32>::zeros((batch, oh, ow, filters));
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
                            let xv = x[[b, iy, ix, c]];
                            if xv == 0.0 {
                                continue;
                            }
                            for f in 0..filters {
                                out[[b, oy, ox, f]] += xv * kernel[[ky, kx, c, f]];
                            }
                        }
                    }
                }
                if let Some(bias) = bias {
                    for f in 0..filters {
                        out[[b, oy, ox, f]] += bias[f];
                    }
                }
            }
        }
    }
    out
}

/// Backward pass of [`conv2d_forward`] given the gradient w.r.t. the
/// pre-activation output. Returns `(grad_kernel, grad_bias, grad_input)`.
pub fn conv2d_backward(
    x: &Array4<f32>,
    kernel: &Array4<f32>,
    padding: Padding,
    grad_z: &Array4<f32>,
) -> (Array4<f32>, Array1<f32>, Array4<f32>) {
    let (batch, h, w, channels) = x.dim();
    let (kh, kw, _, filters) = kernel.dim();
    let (_, oh, ow, _) = grad_z.dim();
    let (ph, pw) = (padding.offset(kh), padding.offset(kw));

    let mut grad_kernel = Array4::<f32>::zeros(kernel.raw_dim());
    let mut grad_bias = Array1::<f32>::zeros(filters);
    let mut grad_x = Array4::<f32>::zeros(x.raw_dim());

    for b in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                for f in 0..filters {
                    grad_bias[f] += grad_z[[b, oy, ox, f]];
                }
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
                            let xv = x[[b, iy, ix, c]];
                            let mut acc = 0.0;
                            for f in 0..filters {
                                let g = grad_z[[b, oy, ox, f]];
                                grad_kernel[[ky, kx, c, f]] += xv * g;
                                acc += g * kernel[[ky, kx, c, f]];
                            }
                            grad_x[[b, iy, ix, c]] += acc;
                        }
                    }
                }
            }
        }
    }
    (grad_kernel, grad_bias, grad_x)
}

/// Apply an activation to an NHWC tensor over its channel lanes.
pub(crate) fn activate_map(activation: Activation, z: &mut Array4<f32>) {
    let (b, h, w, c) = z.dim();
    let mut lanes = z
        .view_mut()
        .into_shape((b * h * w, c))
        .expect("NHWC tensors are contiguous");
    activation.apply(&mut lanes);
}

/// Backprop an activation over channel lanes of an NHWC tensor.
pub(crate) fn backprop_map(
    activation: Activation,
    z: &Array4<f32>,
    grad_out: &Array4<f32>,
) -> Array4<f32> {
    let dim = z.raw_dim();
    let (b, h, w, c) = z.dim();
    let z2: Array2<f32> = z
        .to_owned()
        .into_shape((b * h * w, c))
        .expect("NHWC tensors are contiguous");
    let g2: Array2<f32> = grad_out
        .to_owned()
        .into_shape((b * h * w, c))
        .expect("NHWC tensors are contiguous");
    activation
        .backprop(&z2, &g2)
        .into_shape(dim)
        .expect("shape preserved")
}

/// Standard 2-D convolution layer (stride 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    pub(crate) name: String,
    pub(crate) filters: usize,
    pub(crate) kernel_size: (usize, usize),
    pub(crate) padding: Padding,
    pub(crate) activation: Activation,
    pub(crate) kernel: Option<Array4<f32>>,
    pub(crate) bias: Option<Array1<f32>>,
}

impl Conv2d {
    /// Fresh (unbuilt) convolution layer; weights materialize at build time.
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
            kernel: None,
            bias: None,
        }
    }

    /// Convolution layer with pre-set weights.
    pub fn with_weights(
        name: impl Into<String>,
        kernel: Array4<f32>,
        bias: Array1<f32>,
        activation: Activation,
        padding: Padding,
    ) -> Self {
        let (kh, kw, _, filters) = kernel.dim();
        Self {
            name: name.into(),
            filters,
            kernel_size: (kh, kw),
            padding,
            activation,
            kernel: Some(kernel),
            bias: Some(bias),
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

    /// Kernel tensor `(kh, kw, in, filters)`, if built.
    pub fn kernel(&self) -> Option<&Array4<f32>> {
        self.kernel.as_ref()
    }

    /// Bias vector, if built.
    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
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
        match &self.kernel {
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
                let fan_in = kh * kw * c;
                let fan_out = kh * kw * self.filters;
                self.kernel = Some(init::glorot_uniform(
                    (kh, kw, c, self.filters),
                    fan_in,
                    fan_out,
                    rng,
                ));
                self.bias = Some(Array1::zeros(self.filters));
            }
        }
        if h < kh || w < kw {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("spatial extent >= ({kh}, {kw})"),
                actual: input.to_string(),
            });
        }
        Ok(FeatureShape::map(
            self.padding.out_extent(h, kh),
            self.padding.out_extent(w, kw),
            self.filters,
        ))
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| self.not_built())?;
        let mut z = conv2d_forward(x, kernel, self.bias.as_ref(), self.padding);
        activate_map(self.activation, &mut z);
        Ok(z)
    }

    pub(crate) fn backward(
        &self,
        x: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> Result<(Vec<Array1<f32>>, Array4<f32>)> {
        let kernel = self.kernel.as_ref().ok_or_else(|| self.not_built())?;
        let z = conv2d_forward(x, kernel, self.bias.as_ref(), self.padding);
        let grad_z = backprop_map(self.activation, &z, grad_out);
        let (gk, gb, gx) = conv2d_backward(x, kernel, self.padding, &grad_z);
        Ok((vec![Array1::from_iter(gk.iter().copied()), gb], gx))
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        match (&self.kernel, &self.bias) {
            (Some(k), Some(b)) => vec![
                k.as_slice().expect("contiguous"),
                b.as_slice().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        match (&mut self.kernel, &mut self.bias) {
            (Some(k), Some(b)) => vec![
                k.as_slice_mut().expect("contiguous"),
                b.as_slice_mut().expect("contiguous"),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn trainable_weight_count(&self) -> usize {
        self.kernel.as_ref().map_or(0, |k| k.len())
            + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn not_built(&self) -> CompressError {
        CompressError::NotBuilt {
            layer: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array4};

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let n = shape.0 * shape.1 * shape.2 * shape.3;
        Array4::from_shape_vec(shape, (0..n).map(|i| i as f32 * 0.1).collect()).unwrap()
    }

    #[test]
    fn test_valid_conv_identity_kernel() {
        // 1x1 kernel with a single unit weight passes the input through.
        let x = ramp((1, 3, 3, 1));
        let kernel = Array4::from_shape_vec((1, 1, 1, 1), vec![1.0]).unwrap();
        let out = conv2d_forward(&x, &kernel, None, Padding::Valid);
        assert_eq!(out.dim(), (1, 3, 3, 1));
        assert_abs_diff_eq!(out[[0, 1, 1, 0]], x[[0, 1, 1, 0]]);
    }

    #[test]
    fn test_valid_conv_output_shape() {
        let x = ramp((2, 5, 5, 3));
        let kernel = Array4::zeros((3, 3, 3, 4));
        let out = conv2d_forward(&x, &kernel, None, Padding::Valid);
        assert_eq!(out.dim(), (2, 3, 3, 4));
    }

    #[test]
    fn test_same_conv_preserves_shape() {
        let x = ramp((1, 4, 4, 2));
        let kernel = Array4::zeros((3, 3, 2, 5));
        let out = conv2d_forward(&x, &kernel, None, Padding::Same);
        assert_eq!(out.dim(), (1, 4, 4, 5));
    }

    #[test]
    fn test_sum_kernel_matches_window_sum() {
        let x = ramp((1, 3, 3, 1));
        let kernel = Array4::from_elem((3, 3, 1, 1), 1.0);
        let out = conv2d_forward(&x, &kernel, None, Padding::Valid);
        assert_eq!(out.dim(), (1, 1, 1, 1));
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], x.sum(), epsilon = 1e-5);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let x = ramp((1, 4, 4, 2));
        let mut kernel = Array4::zeros((3, 3, 2, 2));
        kernel
            .iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = ((i % 7) as f32 - 3.0) * 0.1);
        let grad_z = Array4::from_elem((1, 2, 2, 2), 1.0);

        let (gk, gb, gx) = conv2d_backward(&x, &kernel, Padding::Valid, &grad_z);
        assert_eq!(gb, Array1::from_elem(2, 4.0));

        let eps = 1e-2f32;
        // Kernel gradient check at a few entries.
        for &idx in &[[0usize, 0, 0, 0], [1, 2, 1, 1], [2, 0, 0, 1]] {
            let mut kp = kernel.clone();
            kp[idx] += eps;
            let mut km = kernel.clone();
            km[idx] -= eps;
            let fp = conv2d_forward(&x, &kp, None, Padding::Valid).sum();
            let fm = conv2d_forward(&x, &km, None, Padding::Valid).sum();
            assert_abs_diff_eq!(gk[idx], (fp - fm) / (2.0 * eps), epsilon = 1e-2);
        }
        // Input gradient check at one entry.
        let idx = [0usize, 1, 1, 0];
        let mut xp = x.clone();
        xp[idx] += eps;
        let mut xm = x.clone();
        xm[idx] -= eps;
        let fp = conv2d_forward(&xp, &kernel, None, Padding::Valid).sum();
        let fm = conv2d_forward(&xm, &kernel, None, Padding::Valid).sum();
        assert_abs_diff_eq!(gx[idx], (fp - fm) / (2.0 * eps), epsilon = 1e-2);
    }

    #[test]
    fn test_layer_build_rejects_channel_mismatch() {
        let mut layer = Conv2d::with_weights(
            "conv",
            Array4::zeros((3, 3, 4, 8)),
            Array1::zeros(8),
            Activation::Relu,
            Padding::Valid,
        );
        let mut rng = rand::thread_rng();
        let err = layer
            .build(&FeatureShape::map(8, 8, 3), &mut rng)
            .unwrap_err();
        assert!(matches!(err, CompressError::ShapeMismatch { .. }));
    }
}
