//! Activation functions with explicit backward passes

use ndarray::{Array2, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};

/// Activation applied after a layer's affine transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    /// `max(0, x)` elementwise.
    Relu,
    /// Softmax over the last axis.
    Softmax,
}

impl Activation {
    /// Apply the activation to pre-activations laid out as `(lanes, width)`,
    /// where the last axis is the one softmax normalizes over.
    pub fn apply(&self, z: &mut ArrayViewMut2<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Softmax => {
                for mut row in z.axis_iter_mut(Axis(0)) {
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    if sum > 0.0 {
                        row.mapv_inplace(|v| v / sum);
                    }
                }
            }
        }
    }

    /// Gradient of the loss w.r.t. pre-activations, given pre-activations `z`
    /// and the gradient w.r.t. the activation output. Layout as in [`apply`].
    pub fn backprop(&self, z: &Array2<f32>, grad_out: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Linear => grad_out.clone(),
            Activation::Relu => {
                let mut grad = grad_out.clone();
                grad.zip_mut_with(z, |g, &zv| {
                    if zv <= 0.0 {
                        *g = 0.0;
                    }
                });
                grad
            }
            Activation::Softmax => {
                // grad_z_i = s_i * (g_i - sum_j g_j s_j), per lane
                let mut s = z.clone();
                self.apply(&mut s.view_mut());
                let mut grad = Array2::zeros(z.raw_dim());
                for ((s_row, g_row), mut out_row) in s
                    .axis_iter(Axis(0))
                    .zip(grad_out.axis_iter(Axis(0)))
                    .zip(grad.axis_iter_mut(Axis(0)))
                {
                    let dot: f32 = s_row.iter().zip(g_row.iter()).map(|(a, b)| a * b).sum();
                    for ((o, &sv), &gv) in out_row.iter_mut().zip(s_row.iter()).zip(g_row.iter()) {
                        *o = sv * (gv - dot);
                    }
                }
                grad
            }
        }
    }

    /// Display name, matching the serialized form.
    pub fn display_name(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Softmax => "softmax",
        }
    }
}
