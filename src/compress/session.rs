//! The compression session: base contract shared by all strategies

use super::edit::{EditAction, EditQueue};
use super::Technique;
use crate::error::{CompressError, Result};
use crate::nn::Model;
use crate::optim::Optimizer;
use crate::train::{fit, Dataset, FitConfig, FitReport, LossFn, Metric};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Session-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Whether structural strategies fine-tune the rebuilt model.
    pub fine_tune: bool,
    /// Fine-tuning epochs.
    pub tuning_epochs: usize,
    /// Metrics tracked while fine-tuning.
    pub metrics: Vec<Metric>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fine_tune: true,
            tuning_epochs: 10,
            metrics: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable fine-tuning.
    pub fn with_fine_tune(mut self, fine_tune: bool) -> Self {
        self.fine_tune = fine_tune;
        self
    }

    /// Set the fine-tuning epoch count.
    pub fn with_tuning_epochs(mut self, epochs: usize) -> Self {
        self.tuning_epochs = epochs;
        self
    }

    /// Track a metric during fine-tuning.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }
}

/// One compression session over one model.
///
/// Owns the model for the duration of the session; structural strategies
/// replace it wholesale through [`CompressionSession::update_model`], and the
/// pre-compression model is discarded (there is no undo). A session is meant
/// for a single `compress_layer` call: repeated calls accumulate edits
/// against stale indices and are not supported.
pub struct CompressionSession {
    pub(crate) model: Model,
    pub(crate) optimizer: Box<dyn Optimizer>,
    pub(crate) loss: Box<dyn LossFn>,
    pub(crate) dataset: Option<Dataset>,
    pub(crate) config: SessionConfig,
    pub(crate) edits: EditQueue,
    pub(crate) weights_before: usize,
    pub(crate) weights_after: Option<usize>,
}

impl CompressionSession {
    /// Open a session over `model`. The optimizer and loss drive fine-tuning
    /// and the sparsification fits; the dataset feeds the surrogate
    /// regressions and fine-tuning and may be omitted for purely in-place
    /// techniques.
    pub fn new(
        model: Model,
        optimizer: Box<dyn Optimizer>,
        loss: Box<dyn LossFn>,
        dataset: Option<Dataset>,
        config: SessionConfig,
    ) -> Self {
        let weights_before = model.trainable_weight_count();
        Self {
            model,
            optimizer,
            loss,
            dataset,
            config,
            edits: EditQueue::new(),
            weights_before,
            weights_after: None,
        }
    }

    /// Number of trainable weights in the current model.
    pub fn count_trainable_weights(&self) -> usize {
        self.model.trainable_weight_count()
    }

    /// Index of the layer with the given name. First match wins; duplicate
    /// names are a caller error.
    pub fn find_layer(&self, layer_name: &str) -> Result<usize> {
        self.model.index_of(layer_name)
    }

    /// Queue a structural edit (last writer wins per index).
    pub fn queue_edit(&mut self, index: usize, action: EditAction) {
        self.edits.queue(index, action);
    }

    /// Apply all queued edits and rebuild the chain.
    ///
    /// On success the queue is drained and the session's model replaced. On
    /// failure the model may reference stale shapes and the session must not
    /// be reused; in-place weight mutations from earlier non-structural
    /// steps are not rolled back.
    pub fn update_model(&mut self) -> Result<()> {
        info!("updating the model");
        let mut layers = self.model.layers().to_vec();
        self.edits.apply(&mut layers)?;
        match Model::new(self.model.input_shape(), layers) {
            Ok(rebuilt) => {
                self.model = rebuilt;
                self.edits.clear();
                info!("model updated");
                Ok(())
            }
            Err(err) => {
                error!("the input and the weights of a layer do not match");
                Err(err)
            }
        }
    }

    /// Fine-tune the whole model over the dataset with the session's
    /// optimizer and loss, if fine-tuning is enabled.
    pub fn fine_tune(&mut self) -> Result<Option<FitReport>> {
        if !self.config.fine_tune {
            return Ok(None);
        }
        info!(epochs = self.config.tuning_epochs, "fine-tuning the optimized model");
        let Self {
            model,
            optimizer,
            loss,
            dataset,
            config,
            ..
        } = self;
        let dataset = dataset.as_ref().ok_or(CompressError::EmptyDataset)?;
        let fit_config = FitConfig {
            epochs: config.tuning_epochs,
            metrics: config.metrics.clone(),
        };
        fit(
            model,
            dataset,
            optimizer.as_mut(),
            loss.as_ref(),
            &fit_config,
            &mut [],
        )
        .map(Some)
    }

    /// Trainable weight counts recorded for this session: the count at
    /// session start and the count the strategy reported, `None` until a
    /// strategy sets it.
    pub fn get_weights_diff(&self) -> (usize, Option<usize>) {
        (self.weights_before, self.weights_after)
    }

    /// The current model (original, or compressed once a strategy ran).
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Consume the session, returning its model.
    pub fn into_model(self) -> Model {
        self.model
    }

    /// Apply a compression technique to the named layer.
    ///
    /// The head-replacement technique scans the whole chain and ignores
    /// `layer_name`.
    pub fn compress_layer(&mut self, technique: &Technique, layer_name: &str) -> Result<()> {
        info!(
            technique = technique.kind().display_name(),
            layer = layer_name,
            "compressing layer"
        );
        match technique {
            Technique::ThresholdPruning { threshold } => {
                super::threshold::compress(self, layer_name, *threshold)
            }
            Technique::ReplaceDenseWithGlobalAvgPool => super::head::compress(self),
            Technique::DenseSvd { units } => super::dense_svd::compress(self, layer_name, *units),
            Technique::DenseSvdLearned { units, iterations } => {
                super::dense_svd_learned::compress(self, layer_name, *units, *iterations)
            }
            Technique::DenseSparseDict { units, iterations } => {
                super::dense_sparse::compress(self, layer_name, *units, *iterations)
            }
            Technique::ConvSvd { units, iterations } => {
                super::conv_svd::compress(self, layer_name, *units, *iterations)
            }
            Technique::DepthwiseSeparable { iterations } => {
                super::separable::compress(self, layer_name, *iterations)
            }
            Technique::FireSubstitution { iterations } => {
                super::fire::compress(self, layer_name, *iterations)
            }
            Technique::MlpSubstitution { iterations } => {
                super::mlp::compress(self, layer_name, *iterations)
            }
            Technique::SparseConnections {
                epochs,
                target_fraction,
                connections_per_epoch,
            } => super::sparse_connections::compress(
                self,
                layer_name,
                *epochs,
                *target_fraction,
                *connections_per_epoch,
            ),
            Technique::SparseConvolution { bases, iterations } => {
                super::sparse_convolution::compress(self, layer_name, *bases, *iterations)
            }
        }
    }

    pub(crate) fn dataset(&self) -> Result<&Dataset> {
        match &self.dataset {
            Some(dataset) if !dataset.is_empty() => Ok(dataset),
            _ => Err(CompressError::EmptyDataset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Activation, Dense, Feature, FeatureShape};
    use crate::optim::Sgd;
    use crate::train::MseLoss;
    use ndarray::arr2;

    fn session() -> CompressionSession {
        let model = Model::new(
            FeatureShape::flat(2),
            vec![
                Dense::with_weights("d1", arr2(&[[1.0, 0.0], [0.0, 1.0]]), None, Activation::Linear)
                    .into(),
                Dense::with_weights("d2", arr2(&[[1.0], [1.0]]), None, Activation::Linear).into(),
            ],
        )
        .unwrap();
        CompressionSession::new(
            model,
            Box::new(Sgd::new(0.01, 0.0)),
            Box::new(MseLoss),
            None,
            SessionConfig::new().with_fine_tune(false),
        )
    }

    #[test]
    fn test_find_layer_is_idempotent() {
        let session = session();
        assert_eq!(session.find_layer("d2").unwrap(), 1);
        assert_eq!(session.find_layer("d2").unwrap(), 1);
    }

    #[test]
    fn test_find_layer_missing() {
        let session = session();
        assert!(matches!(
            session.find_layer("missing"),
            Err(CompressError::LayerNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_update_is_identity() {
        let mut session = session();
        let before: Vec<String> = session
            .model()
            .layers()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        let count_before = session.count_trainable_weights();
        session.update_model().unwrap();
        let after: Vec<String> = session
            .model()
            .layers()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(before, after);
        assert_eq!(session.count_trainable_weights(), count_before);
        let y = session
            .model()
            .forward(&Feature::Flat(arr2(&[[1.0, 2.0]])))
            .unwrap();
        assert_eq!(y.as_flat().unwrap()[[0, 0]], 3.0);
    }

    #[test]
    fn test_weights_diff_unset_until_compression() {
        let session = session();
        let (before, after) = session.get_weights_diff();
        assert_eq!(before, 6);
        assert!(after.is_none());
    }

    #[test]
    fn test_failed_update_propagates_shape_mismatch() {
        let mut session = session();
        // Replace d1 with a dense expecting the wrong input width.
        session.queue_edit(
            0,
            EditAction::Replace(
                Dense::with_weights("bad", arr2(&[[1.0]]), None, Activation::Linear).into(),
            ),
        );
        assert!(matches!(
            session.update_model(),
            Err(CompressError::ShapeMismatch { .. })
        ));
    }
}
