//! Layer and model machinery
//!
//! A model is a linear chain of named layers. Feature tensors flowing between
//! layers are either flat `(batch, features)` matrices or NHWC
//! `(batch, height, width, channels)` maps; layers declare which they accept
//! and produce. Layers are built lazily: constructing a [`Model`] walks the
//! chain, materializes any absent weights against the incoming shape, and
//! rejects weights that do not match it.

mod activation;
mod conv;
mod dense;
mod fire;
mod layer;
mod mlp_conv;
mod model;
mod pool;
mod separable;
mod sparse_conn;
mod sparse_conv;

pub use activation::Activation;
pub use conv::{conv2d_backward, conv2d_forward, Conv2d, Padding};
pub use dense::{BinaryWeightConstraint, Dense};
pub use fire::FireModule;
pub use layer::{Layer, LayerConfig, LayerKind};
pub use mlp_conv::MlpConv;
pub use model::Model;
pub use pool::{Flatten, GlobalAvgPool2d};
pub use separable::SeparableConv2d;
pub use sparse_conn::SparseConnConv2d;
pub use sparse_conv::SparseConv2d;

use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};

/// Per-sample shape of a feature tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureShape {
    /// Flat feature vector of the given width.
    Flat {
        /// Number of features.
        features: usize,
    },
    /// NHWC feature map (without the batch axis).
    Map {
        /// Height.
        height: usize,
        /// Width.
        width: usize,
        /// Channels.
        channels: usize,
    },
}

impl FeatureShape {
    /// Flat shape constructor.
    pub fn flat(features: usize) -> Self {
        FeatureShape::Flat { features }
    }

    /// Map shape constructor.
    pub fn map(height: usize, width: usize, channels: usize) -> Self {
        FeatureShape::Map {
            height,
            width,
            channels,
        }
    }
}

impl std::fmt::Display for FeatureShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureShape::Flat { features } => write!(f, "({features})"),
            FeatureShape::Map {
                height,
                width,
                channels,
            } => write!(f, "({height}, {width}, {channels})"),
        }
    }
}

/// A batched feature tensor flowing through the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Feature {
    /// `(batch, features)`
    Flat(Array2<f32>),
    /// `(batch, height, width, channels)`
    Map(Array4<f32>),
}

impl Feature {
    /// Batch size.
    pub fn batch(&self) -> usize {
        match self {
            Feature::Flat(a) => a.dim().0,
            Feature::Map(a) => a.dim().0,
        }
    }

    /// Per-sample shape.
    pub fn shape(&self) -> FeatureShape {
        match self {
            Feature::Flat(a) => FeatureShape::flat(a.dim().1),
            Feature::Map(a) => {
                let (_, h, w, c) = a.dim();
                FeatureShape::map(h, w, c)
            }
        }
    }

    /// Borrow as a flat matrix, if this is a flat feature.
    pub fn as_flat(&self) -> Option<&Array2<f32>> {
        match self {
            Feature::Flat(a) => Some(a),
            Feature::Map(_) => None,
        }
    }

    /// Borrow as an NHWC map, if this is a map feature.
    pub fn as_map(&self) -> Option<&Array4<f32>> {
        match self {
            Feature::Map(a) => Some(a),
            Feature::Flat(_) => None,
        }
    }

    /// Total number of scalar elements.
    pub fn len(&self) -> usize {
        match self {
            Feature::Flat(a) => a.len(),
            Feature::Map(a) => a.len(),
        }
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};

    #[test]
    fn test_feature_shape_display() {
        assert_eq!(FeatureShape::flat(8).to_string(), "(8)");
        assert_eq!(FeatureShape::map(4, 5, 3).to_string(), "(4, 5, 3)");
    }

    #[test]
    fn test_feature_accessors() {
        let flat = Feature::Flat(Array2::zeros((2, 8)));
        assert_eq!(flat.batch(), 2);
        assert_eq!(flat.shape(), FeatureShape::flat(8));
        assert!(flat.as_flat().is_some());
        assert!(flat.as_map().is_none());

        let map = Feature::Map(Array4::zeros((2, 4, 4, 3)));
        assert_eq!(map.batch(), 2);
        assert_eq!(map.shape(), FeatureShape::map(4, 4, 3));
        assert_eq!(map.len(), 2 * 4 * 4 * 3);
    }
}
