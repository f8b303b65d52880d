//! Fully-connected layer

use super::{Activation, FeatureShape};
use crate::error::{CompressError, Result};
use crate::init;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Kernel constraint that rounds a weight matrix to {0, 1} after clipping each
/// column to a maximum L2 norm. Re-applied after every weight update so the
/// sparse code stays binary through fitting and fine-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryWeightConstraint {
    /// Maximum per-column L2 norm before rounding.
    pub max_norm: f32,
}

impl BinaryWeightConstraint {
    /// Constraint with the given column-norm bound.
    pub fn new(max_norm: f32) -> Self {
        Self { max_norm }
    }

    /// Clip every column of `w` to `max_norm`, then round each entry.
    pub fn apply(&self, w: &mut Array2<f32>) {
        for mut col in w.axis_iter_mut(Axis(1)) {
            let norm = col.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > self.max_norm && norm > 0.0 {
                let scale = self.max_norm / norm;
                col.mapv_inplace(|v| v * scale);
            }
            col.mapv_inplace(f32::round);
        }
    }
}

/// Dense (fully-connected) layer with kernel `(in, units)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub(crate) name: String,
    pub(crate) units: usize,
    pub(crate) activation: Activation,
    pub(crate) use_bias: bool,
    pub(crate) kernel: Option<Array2<f32>>,
    pub(crate) bias: Option<Array1<f32>>,
    pub(crate) kernel_constraint: Option<BinaryWeightConstraint>,
}

impl Dense {
    /// Fresh (unbuilt) dense layer; the kernel materializes at build time.
    pub fn new(name: impl Into<String>, units: usize, activation: Activation) -> Self {
        Self {
            name: name.into(),
            units,
            activation,
            use_bias: true,
            kernel: None,
            bias: None,
            kernel_constraint: None,
        }
    }

    /// Dense layer with a pre-set kernel (and optional bias; `None` disables
    /// the bias entirely, as for the inserted factor layers).
    pub fn with_weights(
        name: impl Into<String>,
        kernel: Array2<f32>,
        bias: Option<Array1<f32>>,
        activation: Activation,
    ) -> Self {
        let units = kernel.dim().1;
        let use_bias = bias.is_some();
        Self {
            name: name.into(),
            units,
            activation,
            use_bias,
            kernel: Some(kernel),
            bias,
            kernel_constraint: None,
        }
    }

    /// Attach a kernel constraint.
    pub fn with_constraint(mut self, constraint: BinaryWeightConstraint) -> Self {
        self.kernel_constraint = Some(constraint);
        self
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output width.
    pub fn units(&self) -> usize {
        self.units
    }

    /// Activation.
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Kernel `(in, units)`, if built.
    pub fn kernel(&self) -> Option<&Array2<f32>> {
        self.kernel.as_ref()
    }

    /// Mutable kernel, if built. Used by in-place weight edits (pruning).
    pub fn kernel_mut(&mut self) -> Option<&mut Array2<f32>> {
        self.kernel.as_mut()
    }

    /// Bias, if built and enabled.
    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub(crate) fn build(
        &mut self,
        input: &FeatureShape,
        rng: &mut impl Rng,
    ) -> Result<FeatureShape> {
        let features = match *input {
            FeatureShape::Flat { features } => features,
            other => {
                return Err(CompressError::ShapeMismatch {
                    layer: self.name.clone(),
                    expected: "a flat feature vector".into(),
                    actual: other.to_string(),
                })
            }
        };
        match &self.kernel {
            Some(k) => {
                if k.dim().0 != features {
                    return Err(CompressError::ShapeMismatch {
                        layer: self.name.clone(),
                        expected: format!("({})", k.dim().0),
                        actual: input.to_string(),
                    });
                }
            }
            None => {
                self.kernel = Some(init::glorot_uniform(
                    (features, self.units),
                    features,
                    self.units,
                    rng,
                ));
                if self.use_bias {
                    self.bias = Some(Array1::zeros(self.units));
                }
            }
        }
        Ok(FeatureShape::flat(self.units))
    }

    pub(crate) fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| self.not_built())?;
        let mut z = x.dot(kernel);
        if let Some(bias) = &self.bias {
            z += bias;
        }
        self.activation.apply(&mut z.view_mut());
        Ok(z)
    }

    pub(crate) fn backward(
        &self,
        x: &Array2<f32>,
        grad_out: &Array2<f32>,
    ) -> Result<(Vec<Array1<f32>>, Array2<f32>)> {
        let kernel = self.kernel.as_ref().ok_or_else(|| self.not_built())?;
        let mut z = x.dot(kernel);
        if let Some(bias) = &self.bias {
            z += bias;
        }
        let grad_z = self.activation.backprop(&z, grad_out);
        let grad_kernel = x.t().dot(&grad_z);
        let grad_x = grad_z.dot(&kernel.t());

        let mut grads = vec![Array1::from_iter(grad_kernel.iter().copied())];
        if self.bias.is_some() {
            grads.push(grad_z.sum_axis(Axis(0)));
        }
        Ok((grads, grad_x))
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        let mut out = Vec::new();
        if let Some(k) = &self.kernel {
            out.push(k.as_slice().expect("contiguous"));
        }
        if let Some(b) = &self.bias {
            out.push(b.as_slice().expect("contiguous"));
        }
        out
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out = Vec::new();
        if let Some(k) = &mut self.kernel {
            out.push(k.as_slice_mut().expect("contiguous"));
        }
        if let Some(b) = &mut self.bias {
            out.push(b.as_slice_mut().expect("contiguous"));
        }
        out
    }

    pub(crate) fn apply_constraints(&mut self) {
        if let (Some(constraint), Some(kernel)) = (self.kernel_constraint, self.kernel.as_mut()) {
            constraint.apply(kernel);
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
