//! The closed set of layer kinds behind one dispatch surface

use super::{
    Activation, Conv2d, Dense, Feature, FeatureShape, FireModule, Flatten, GlobalAvgPool2d,
    MlpConv, SeparableConv2d, SparseConnConv2d, SparseConv2d,
};
use crate::error::{CompressError, Result};
use ndarray::{Array1, Array2, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tag identifying a layer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Fully-connected layer.
    Dense,
    /// Standard convolution.
    Conv2d,
    /// Depthwise-separable convolution.
    SeparableConv2d,
    /// Global average pooling.
    GlobalAvgPool2d,
    /// Flatten to a feature vector.
    Flatten,
    /// Fire module (squeeze + expand branches).
    FireModule,
    /// Per-pixel MLP surrogate.
    MlpConv,
    /// Convolution with a binary connectivity mask.
    SparseConnConv2d,
    /// P/Q/S factorized convolution.
    SparseConv2d,
}

/// Read-only view of a layer's configuration, used by the strategies to
/// inspect targets without matching on the enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Layer name.
    pub name: String,
    /// Layer kind.
    pub kind: LayerKind,
    /// Output width for dense layers.
    pub units: Option<usize>,
    /// Filter count for convolution-like layers.
    pub filters: Option<usize>,
    /// Kernel extent for convolution-like layers.
    pub kernel_size: Option<(usize, usize)>,
    /// Activation, where the layer has one.
    pub activation: Option<Activation>,
}

/// One node of the layer chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum Layer {
    /// Fully-connected layer.
    Dense(Dense),
    /// Standard convolution.
    Conv2d(Conv2d),
    /// Depthwise-separable convolution.
    SeparableConv2d(SeparableConv2d),
    /// Global average pooling.
    GlobalAvgPool2d(GlobalAvgPool2d),
    /// Flatten.
    Flatten(Flatten),
    /// Fire module.
    FireModule(FireModule),
    /// Per-pixel MLP surrogate.
    MlpConv(MlpConv),
    /// Masked convolution.
    SparseConnConv2d(SparseConnConv2d),
    /// P/Q/S factorized convolution.
    SparseConv2d(SparseConv2d),
}

impl Layer {
    /// Layer name.
    pub fn name(&self) -> &str {
        match self {
            Layer::Dense(l) => l.name(),
            Layer::Conv2d(l) => l.name(),
            Layer::SeparableConv2d(l) => l.name(),
            Layer::GlobalAvgPool2d(l) => l.name(),
            Layer::Flatten(l) => l.name(),
            Layer::FireModule(l) => l.name(),
            Layer::MlpConv(l) => l.name(),
            Layer::SparseConnConv2d(l) => l.name(),
            Layer::SparseConv2d(l) => l.name(),
        }
    }

    /// Layer kind tag.
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Dense(_) => LayerKind::Dense,
            Layer::Conv2d(_) => LayerKind::Conv2d,
            Layer::SeparableConv2d(_) => LayerKind::SeparableConv2d,
            Layer::GlobalAvgPool2d(_) => LayerKind::GlobalAvgPool2d,
            Layer::Flatten(_) => LayerKind::Flatten,
            Layer::FireModule(_) => LayerKind::FireModule,
            Layer::MlpConv(_) => LayerKind::MlpConv,
            Layer::SparseConnConv2d(_) => LayerKind::SparseConnConv2d,
            Layer::SparseConv2d(_) => LayerKind::SparseConv2d,
        }
    }

    /// Configuration view.
    pub fn config(&self) -> LayerConfig {
        let (units, filters, kernel_size, activation) = match self {
            Layer::Dense(l) => (Some(l.units), None, None, Some(l.activation)),
            Layer::Conv2d(l) => (
                None,
                Some(l.filters),
                Some(l.kernel_size),
                Some(l.activation),
            ),
            Layer::SeparableConv2d(l) => (
                None,
                Some(l.filters),
                Some(l.kernel_size),
                Some(l.activation),
            ),
            Layer::GlobalAvgPool2d(_) | Layer::Flatten(_) => (None, None, None, None),
            Layer::FireModule(l) => (None, Some(l.filters()), Some((3, 3)), None),
            Layer::MlpConv(l) => (
                None,
                Some(l.filters),
                Some(l.kernel_size),
                Some(l.activation),
            ),
            Layer::SparseConnConv2d(l) => (
                None,
                Some(l.filters),
                Some(l.kernel_size),
                Some(l.activation),
            ),
            Layer::SparseConv2d(l) => (
                None,
                Some(l.filters),
                Some(l.kernel_size),
                Some(l.activation),
            ),
        };
        LayerConfig {
            name: self.name().to_string(),
            kind: self.kind(),
            units,
            filters,
            kernel_size,
            activation,
        }
    }

    /// Build the layer against an incoming shape, materializing any absent
    /// weights, and return the outgoing shape.
    pub fn build(&mut self, input: &FeatureShape, rng: &mut impl Rng) -> Result<FeatureShape> {
        match self {
            Layer::Dense(l) => l.build(input, rng),
            Layer::Conv2d(l) => l.build(input, rng),
            Layer::SeparableConv2d(l) => l.build(input, rng),
            Layer::GlobalAvgPool2d(l) => l.build(input),
            Layer::Flatten(l) => l.build(input),
            Layer::FireModule(l) => l.build(input, rng),
            Layer::MlpConv(l) => l.build(input, rng),
            Layer::SparseConnConv2d(l) => l.build(input),
            Layer::SparseConv2d(l) => l.build(input),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: &Feature) -> Result<Feature> {
        match self {
            Layer::Dense(l) => Ok(Feature::Flat(l.forward(self.expect_flat(x)?)?)),
            Layer::Conv2d(l) => Ok(Feature::Map(l.forward(self.expect_map(x)?)?)),
            Layer::SeparableConv2d(l) => Ok(Feature::Map(l.forward(self.expect_map(x)?)?)),
            Layer::GlobalAvgPool2d(l) => Ok(Feature::Flat(l.forward(self.expect_map(x)?))),
            Layer::Flatten(l) => match x {
                Feature::Map(m) => Ok(Feature::Flat(l.forward(m))),
                Feature::Flat(f) => Ok(Feature::Flat(f.clone())),
            },
            Layer::FireModule(l) => Ok(Feature::Map(l.forward(self.expect_map(x)?)?)),
            Layer::MlpConv(l) => Ok(Feature::Map(l.forward(self.expect_map(x)?)?)),
            Layer::SparseConnConv2d(l) => Ok(Feature::Map(l.forward(self.expect_map(x)?))),
            Layer::SparseConv2d(l) => Ok(Feature::Map(l.forward(self.expect_map(x)?))),
        }
    }

    /// Backward pass: gradients for each trainable parameter (same order as
    /// [`Layer::params`]) and the gradient w.r.t. the layer input.
    pub fn backward(&self, x: &Feature, grad_out: &Feature) -> Result<(Vec<Array1<f32>>, Feature)> {
        match self {
            Layer::Dense(l) => {
                let (g, gx) =
                    l.backward(self.expect_flat(x)?, self.expect_flat(grad_out)?)?;
                Ok((g, Feature::Flat(gx)))
            }
            Layer::Conv2d(l) => {
                let (g, gx) = l.backward(self.expect_map(x)?, self.expect_map(grad_out)?)?;
                Ok((g, Feature::Map(gx)))
            }
            Layer::SeparableConv2d(l) => {
                let (g, gx) = l.backward(self.expect_map(x)?, self.expect_map(grad_out)?)?;
                Ok((g, Feature::Map(gx)))
            }
            Layer::GlobalAvgPool2d(l) => {
                let gx = l.backward(self.expect_map(x)?, self.expect_flat(grad_out)?);
                Ok((Vec::new(), Feature::Map(gx)))
            }
            Layer::Flatten(l) => match x {
                Feature::Map(m) => {
                    let gx = l.backward(m, self.expect_flat(grad_out)?);
                    Ok((Vec::new(), Feature::Map(gx)))
                }
                Feature::Flat(_) => Ok((Vec::new(), grad_out.clone())),
            },
            Layer::FireModule(l) => {
                let (g, gx) = l.backward(self.expect_map(x)?, self.expect_map(grad_out)?)?;
                Ok((g, Feature::Map(gx)))
            }
            Layer::MlpConv(l) => {
                let (g, gx) = l.backward(self.expect_map(x)?, self.expect_map(grad_out)?)?;
                Ok((g, Feature::Map(gx)))
            }
            Layer::SparseConnConv2d(l) => {
                let (g, gx) = l.backward(self.expect_map(x)?, self.expect_map(grad_out)?);
                Ok((g, Feature::Map(gx)))
            }
            Layer::SparseConv2d(l) => {
                let (g, gx) = l.backward(self.expect_map(x)?, self.expect_map(grad_out)?);
                Ok((g, Feature::Map(gx)))
            }
        }
    }

    /// Flat views of the trainable parameters.
    pub fn params(&self) -> Vec<&[f32]> {
        match self {
            Layer::Dense(l) => l.params(),
            Layer::Conv2d(l) => l.params(),
            Layer::SeparableConv2d(l) => l.params(),
            Layer::GlobalAvgPool2d(_) | Layer::Flatten(_) => Vec::new(),
            Layer::FireModule(l) => l.params(),
            Layer::MlpConv(l) => l.params(),
            Layer::SparseConnConv2d(l) => l.params(),
            Layer::SparseConv2d(l) => l.params(),
        }
    }

    /// Mutable flat views of the trainable parameters.
    pub fn params_mut(&mut self) -> Vec<&mut [f32]> {
        match self {
            Layer::Dense(l) => l.params_mut(),
            Layer::Conv2d(l) => l.params_mut(),
            Layer::SeparableConv2d(l) => l.params_mut(),
            Layer::GlobalAvgPool2d(_) | Layer::Flatten(_) => Vec::new(),
            Layer::FireModule(l) => l.params_mut(),
            Layer::MlpConv(l) => l.params_mut(),
            Layer::SparseConnConv2d(l) => l.params_mut(),
            Layer::SparseConv2d(l) => l.params_mut(),
        }
    }

    /// Re-apply weight constraints after an update.
    pub fn apply_constraints(&mut self) {
        if let Layer::Dense(l) = self {
            l.apply_constraints();
        }
    }

    /// Trainable parameter count.
    pub fn trainable_weight_count(&self) -> usize {
        match self {
            Layer::Dense(l) => l.trainable_weight_count(),
            Layer::Conv2d(l) => l.trainable_weight_count(),
            Layer::SeparableConv2d(l) => l.trainable_weight_count(),
            Layer::GlobalAvgPool2d(_) | Layer::Flatten(_) => 0,
            Layer::FireModule(l) => l.trainable_weight_count(),
            Layer::MlpConv(l) => l.trainable_weight_count(),
            Layer::SparseConnConv2d(l) => l.trainable_weight_count(),
            Layer::SparseConv2d(l) => l.trainable_weight_count(),
        }
    }

    fn expect_flat<'a>(&self, x: &'a Feature) -> Result<&'a Array2<f32>> {
        x.as_flat().ok_or_else(|| CompressError::ShapeMismatch {
            layer: self.name().to_string(),
            expected: "a flat feature vector".into(),
            actual: x.shape().to_string(),
        })
    }

    fn expect_map<'a>(&self, x: &'a Feature) -> Result<&'a Array4<f32>> {
        x.as_map().ok_or_else(|| CompressError::ShapeMismatch {
            layer: self.name().to_string(),
            expected: "a feature map".into(),
            actual: x.shape().to_string(),
        })
    }
}

impl From<Dense> for Layer {
    fn from(l: Dense) -> Self {
        Layer::Dense(l)
    }
}

impl From<Conv2d> for Layer {
    fn from(l: Conv2d) -> Self {
        Layer::Conv2d(l)
    }
}

impl From<SeparableConv2d> for Layer {
    fn from(l: SeparableConv2d) -> Self {
        Layer::SeparableConv2d(l)
    }
}

impl From<GlobalAvgPool2d> for Layer {
    fn from(l: GlobalAvgPool2d) -> Self {
        Layer::GlobalAvgPool2d(l)
    }
}

impl From<Flatten> for Layer {
    fn from(l: Flatten) -> Self {
        Layer::Flatten(l)
    }
}

impl From<FireModule> for Layer {
    fn from(l: FireModule) -> Self {
        Layer::FireModule(l)
    }
}

impl From<MlpConv> for Layer {
    fn from(l: MlpConv) -> Self {
        Layer::MlpConv(l)
    }
}

impl From<SparseConnConv2d> for Layer {
    fn from(l: SparseConnConv2d) -> Self {
        Layer::SparseConnConv2d(l)
    }
}

impl From<SparseConv2d> for Layer {
    fn from(l: SparseConv2d) -> Self {
        Layer::SparseConv2d(l)
    }
}
