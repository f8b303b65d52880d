//! Training support: datasets, losses, metrics, and the fine-tune loop

mod batch;
mod fit;
mod hook;
mod loss;
mod metrics;

pub use batch::{Batch, Dataset};
pub use fit::{fit, train_batch, FitConfig, FitReport};
pub use hook::EpochHook;
pub use loss::{CrossEntropyLoss, LossFn, MaeLoss, MseLoss};
pub use metrics::Metric;
