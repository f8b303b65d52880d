//! Compression techniques over a model's layer chain
//!
//! Every technique follows the same contract: find a target layer, compute or
//! learn replacement weights, splice the transformed layer(s) back into the
//! chain, optionally fine-tune, and report the weight-count delta. The
//! [`CompressionSession`] holds the shared state; [`Technique`] is the closed
//! set of strategies, each variant carrying its own parameters.

mod conv_svd;
mod dense_sparse;
mod dense_svd;
mod dense_svd_learned;
mod edit;
mod fire;
mod head;
mod mlp;
mod separable;
mod session;
mod sparse_connections;
mod sparse_convolution;
mod surrogate;
mod threshold;

pub use edit::{EditAction, EditQueue, EditRecord};
pub use session::{CompressionSession, SessionConfig};
pub use sparse_connections::ProgressiveConnectionsHook;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which layer family a technique targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerTarget {
    /// Dense (fully-connected) layers.
    Dense,
    /// Convolution layers.
    Conv,
}

/// A compression technique with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "snake_case")]
pub enum Technique {
    /// Zero every dense-kernel weight below a magnitude threshold, in place.
    ThresholdPruning {
        /// Magnitude below which weights are zeroed.
        threshold: f32,
    },

    /// Delete the dense/flatten head and classify straight off a global
    /// average pool. Scans the whole chain; the target name is ignored.
    ReplaceDenseWithGlobalAvgPool,

    /// Closed-form low-rank split of a dense kernel via truncated SVD.
    DenseSvd {
        /// Singular values kept; must be below `min(M, N)` to save weights.
        units: usize,
    },

    /// Low-rank split of a dense kernel with factors learned by gradient
    /// descent instead of the closed form.
    DenseSvdLearned {
        /// Inner width of the factor pair.
        units: usize,
        /// Gradient steps for the fit.
        iterations: usize,
    },

    /// Dense basis plus binary sparse code factorization of a dense kernel.
    DenseSparseDict {
        /// Dictionary size (inner width).
        units: usize,
        /// Gradient steps for the fit.
        iterations: usize,
    },

    /// Replace a convolution by two stacked convolutions fitted to its
    /// input/output mapping.
    ConvSvd {
        /// Filter count of the intermediate convolution.
        units: usize,
        /// Passes over the dataset while fitting the surrogate.
        iterations: usize,
    },

    /// Replace a convolution by a depthwise-separable convolution.
    DepthwiseSeparable {
        /// Passes over the dataset while fitting the surrogate.
        iterations: usize,
    },

    /// Replace a convolution by a fire module (1x1 squeeze, parallel 1x1 and
    /// 3x3 expands).
    FireSubstitution {
        /// Passes over the dataset while fitting the surrogate.
        iterations: usize,
    },

    /// Replace a convolution by a per-pixel two-layer MLP.
    MlpSubstitution {
        /// Passes over the dataset while fitting the surrogate.
        iterations: usize,
    },

    /// Sparsify a convolution's channel-to-filter connections, growing the
    /// active set each epoch until a target fraction is reached.
    SparseConnections {
        /// Training epochs with the progressive-connections hook.
        epochs: usize,
        /// Fraction of connections active at the end.
        target_fraction: f32,
        /// Fraction of all connections activated per epoch.
        connections_per_epoch: f32,
    },

    /// Replace a convolution by the P/Q/S structured factorized convolution.
    SparseConvolution {
        /// Number of spatial bases.
        bases: usize,
        /// Gradient steps per factor fit and surrogate passes.
        iterations: usize,
    },
}

/// Fieldless tag for a [`Technique`], used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechniqueKind {
    /// See [`Technique::ThresholdPruning`].
    ThresholdPruning,
    /// See [`Technique::ReplaceDenseWithGlobalAvgPool`].
    ReplaceDenseWithGlobalAvgPool,
    /// See [`Technique::DenseSvd`].
    DenseSvd,
    /// See [`Technique::DenseSvdLearned`].
    DenseSvdLearned,
    /// See [`Technique::DenseSparseDict`].
    DenseSparseDict,
    /// See [`Technique::ConvSvd`].
    ConvSvd,
    /// See [`Technique::DepthwiseSeparable`].
    DepthwiseSeparable,
    /// See [`Technique::FireSubstitution`].
    FireSubstitution,
    /// See [`Technique::MlpSubstitution`].
    MlpSubstitution,
    /// See [`Technique::SparseConnections`].
    SparseConnections,
    /// See [`Technique::SparseConvolution`].
    SparseConvolution,
}

impl TechniqueKind {
    /// All known techniques, the explicit registry replacing name-based
    /// class lookup.
    pub fn all() -> &'static [TechniqueKind] {
        &[
            TechniqueKind::ThresholdPruning,
            TechniqueKind::ReplaceDenseWithGlobalAvgPool,
            TechniqueKind::DenseSvd,
            TechniqueKind::DenseSvdLearned,
            TechniqueKind::DenseSparseDict,
            TechniqueKind::ConvSvd,
            TechniqueKind::DepthwiseSeparable,
            TechniqueKind::FireSubstitution,
            TechniqueKind::MlpSubstitution,
            TechniqueKind::SparseConnections,
            TechniqueKind::SparseConvolution,
        ]
    }

    /// Stable identifier, matching the serialized form.
    pub fn display_name(&self) -> &'static str {
        match self {
            TechniqueKind::ThresholdPruning => "threshold_pruning",
            TechniqueKind::ReplaceDenseWithGlobalAvgPool => "replace_dense_with_global_avg_pool",
            TechniqueKind::DenseSvd => "dense_svd",
            TechniqueKind::DenseSvdLearned => "dense_svd_learned",
            TechniqueKind::DenseSparseDict => "dense_sparse_dict",
            TechniqueKind::ConvSvd => "conv_svd",
            TechniqueKind::DepthwiseSeparable => "depthwise_separable",
            TechniqueKind::FireSubstitution => "fire_substitution",
            TechniqueKind::MlpSubstitution => "mlp_substitution",
            TechniqueKind::SparseConnections => "sparse_connections",
            TechniqueKind::SparseConvolution => "sparse_convolution",
        }
    }

    /// The layer family this technique targets.
    pub fn target_layer(&self) -> LayerTarget {
        match self {
            TechniqueKind::ThresholdPruning
            | TechniqueKind::ReplaceDenseWithGlobalAvgPool
            | TechniqueKind::DenseSvd
            | TechniqueKind::DenseSvdLearned
            | TechniqueKind::DenseSparseDict => LayerTarget::Dense,
            _ => LayerTarget::Conv,
        }
    }
}

impl FromStr for TechniqueKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TechniqueKind::all()
            .iter()
            .find(|k| k.display_name() == s)
            .copied()
            .ok_or_else(|| format!("unknown technique: {s}"))
    }
}

impl Technique {
    /// This technique's registry tag.
    pub fn kind(&self) -> TechniqueKind {
        match self {
            Technique::ThresholdPruning { .. } => TechniqueKind::ThresholdPruning,
            Technique::ReplaceDenseWithGlobalAvgPool => {
                TechniqueKind::ReplaceDenseWithGlobalAvgPool
            }
            Technique::DenseSvd { .. } => TechniqueKind::DenseSvd,
            Technique::DenseSvdLearned { .. } => TechniqueKind::DenseSvdLearned,
            Technique::DenseSparseDict { .. } => TechniqueKind::DenseSparseDict,
            Technique::ConvSvd { .. } => TechniqueKind::ConvSvd,
            Technique::DepthwiseSeparable { .. } => TechniqueKind::DepthwiseSeparable,
            Technique::FireSubstitution { .. } => TechniqueKind::FireSubstitution,
            Technique::MlpSubstitution { .. } => TechniqueKind::MlpSubstitution,
            Technique::SparseConnections { .. } => TechniqueKind::SparseConnections,
            Technique::SparseConvolution { .. } => TechniqueKind::SparseConvolution,
        }
    }

    /// A technique with its default parameters.
    pub fn default_for(kind: TechniqueKind) -> Technique {
        match kind {
            TechniqueKind::ThresholdPruning => Technique::ThresholdPruning { threshold: 1e-4 },
            TechniqueKind::ReplaceDenseWithGlobalAvgPool => {
                Technique::ReplaceDenseWithGlobalAvgPool
            }
            TechniqueKind::DenseSvd => Technique::DenseSvd { units: 32 },
            TechniqueKind::DenseSvdLearned => Technique::DenseSvdLearned {
                units: 32,
                iterations: 1000,
            },
            TechniqueKind::DenseSparseDict => Technique::DenseSparseDict {
                units: 16,
                iterations: 1000,
            },
            TechniqueKind::ConvSvd => Technique::ConvSvd {
                units: 32,
                iterations: 5,
            },
            TechniqueKind::DepthwiseSeparable => Technique::DepthwiseSeparable { iterations: 5 },
            TechniqueKind::FireSubstitution => Technique::FireSubstitution { iterations: 5 },
            TechniqueKind::MlpSubstitution => Technique::MlpSubstitution { iterations: 5 },
            TechniqueKind::SparseConnections => Technique::SparseConnections {
                epochs: 20,
                target_fraction: 0.75,
                connections_per_epoch: 0.1,
            },
            TechniqueKind::SparseConvolution => Technique::SparseConvolution {
                bases: 2,
                iterations: 100,
            },
        }
    }
}
