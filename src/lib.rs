//! Comprimir: layer-graph compression for neural networks
//!
//! Compression techniques that operate on a trained model's layer chain:
//!
//! - **Pruning**: magnitude thresholding of dense kernels
//! - **Low-rank factorization**: closed-form (SVD) and learned dense splits,
//!   plus a binary sparse-dictionary variant
//! - **Layer substitution**: stacked-conv, depthwise-separable, fire-module,
//!   per-pixel-MLP and structured P/Q/S surrogates regressed onto a target
//!   convolution's input/output mapping
//! - **Progressive sparsification**: channel-to-filter connection masks grown
//!   epoch by epoch during training
//!
//! A [`CompressionSession`] owns the model for the duration of one
//! compression: it looks the target layer up by name, queues structural
//! edits, rebuilds the chain, optionally fine-tunes, and reports the
//! weight-count delta.
//!
//! # Example
//!
//! ```
//! use comprimir::compress::{CompressionSession, SessionConfig, Technique};
//! use comprimir::nn::{Activation, Dense, FeatureShape, Model};
//! use comprimir::optim::Adam;
//! use comprimir::train::MseLoss;
//! use ndarray::Array2;
//!
//! let model = Model::new(
//!     FeatureShape::flat(8),
//!     vec![Dense::with_weights(
//!         "dense_0",
//!         Array2::from_elem((8, 8), 0.1),
//!         None,
//!         Activation::Relu,
//!     )
//!     .into()],
//! )
//! .unwrap();
//!
//! let mut session = CompressionSession::new(
//!     model,
//!     Box::new(Adam::default_params()),
//!     Box::new(MseLoss),
//!     None,
//!     SessionConfig::new().with_fine_tune(false),
//! );
//! session
//!     .compress_layer(&Technique::DenseSvd { units: 2 }, "dense_0")
//!     .unwrap();
//! let (before, after) = session.get_weights_diff();
//! assert!(after.unwrap() < before);
//! ```

pub mod compress;
pub mod error;
pub mod factor;
pub mod init;
pub mod nn;
pub mod optim;
pub mod train;

pub use compress::{CompressionSession, EditAction, SessionConfig, Technique, TechniqueKind};
pub use error::{CompressError, Result};
pub use nn::{Activation, Feature, FeatureShape, Layer, Model};
pub use train::{Batch, Dataset};
