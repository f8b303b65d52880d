//! Whole-model training loop
//!
//! Forward-traces the chain, threads the loss gradient back through every
//! layer, and applies per-slot optimizer updates. Used both for fine-tuning a
//! rebuilt model and (through [`train_batch`]) for the surrogate regressions.

use crate::error::{CompressError, Result};
use crate::nn::{Feature, Model};
use crate::optim::Optimizer;
use crate::train::{Batch, Dataset, EpochHook, LossFn, Metric};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Configuration for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    /// Number of full passes over the dataset.
    pub epochs: usize,
    /// Metrics tracked alongside the loss.
    pub metrics: Vec<Metric>,
}

impl FitConfig {
    /// Config for a plain run of `epochs` passes.
    pub fn new(epochs: usize) -> Self {
        Self {
            epochs,
            metrics: Vec::new(),
        }
    }

    /// Track a metric during the run.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }
}

/// Summary of a completed training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Epochs actually run.
    pub epochs_run: usize,
    /// Mean loss of the final epoch.
    pub final_loss: f32,
    /// Best (lowest) epoch loss seen.
    pub best_loss: f32,
    /// Mean loss per epoch.
    pub epoch_losses: Vec<f32>,
    /// Final-epoch value per configured metric.
    pub metric_values: Vec<f32>,
    /// Wall-clock duration of the run in seconds.
    pub elapsed_secs: f64,
}

/// One optimizer step on a single `(input, target)` pair. Returns the loss.
///
/// Slot indices are assigned per layer parameter in chain order, so repeated
/// calls against the same model reuse the optimizer state correctly.
pub fn train_batch(
    model: &mut Model,
    inputs: &Feature,
    targets: &Feature,
    optimizer: &mut dyn Optimizer,
    loss: &dyn LossFn,
) -> Result<f32> {
    let trace = model.forward_trace(inputs)?;
    let predictions = trace.last().expect("trace is non-empty");
    let loss_value = loss.loss(predictions, targets);

    // Backward sweep: collect parameter gradients for every layer.
    let mut grad = loss.grad(predictions, targets);
    let mut layer_grads = vec![Vec::new(); model.len()];
    for idx in (0..model.len()).rev() {
        let (param_grads, grad_in) = model.layer(idx).backward(&trace[idx], &grad)?;
        layer_grads[idx] = param_grads;
        grad = grad_in;
    }

    // Update pass: per-slot optimizer updates, then constraints.
    let mut slot = 0;
    for idx in 0..model.len() {
        let grads = &layer_grads[idx];
        let layer = model.layer_mut(idx);
        for (param, grad) in layer.params_mut().into_iter().zip(grads.iter()) {
            let grad = grad.as_slice().expect("contiguous");
            optimizer.update(slot, param, grad);
            slot += 1;
        }
        layer.apply_constraints();
    }
    Ok(loss_value)
}

/// Train `model` on `dataset` for the configured number of epochs, invoking
/// every hook at each epoch boundary.
pub fn fit(
    model: &mut Model,
    dataset: &Dataset,
    optimizer: &mut dyn Optimizer,
    loss: &dyn LossFn,
    config: &FitConfig,
    hooks: &mut [&mut dyn EpochHook],
) -> Result<FitReport> {
    if dataset.is_empty() {
        return Err(CompressError::EmptyDataset);
    }
    let start = Instant::now();
    let mut epoch_losses = Vec::with_capacity(config.epochs);
    let mut metric_values = vec![0.0; config.metrics.len()];

    for epoch in 0..config.epochs {
        let mut total_loss = 0.0;
        let mut metric_sums = vec![0.0; config.metrics.len()];
        for batch in dataset.iter() {
            let Batch { inputs, targets } = batch;
            total_loss += train_batch(model, inputs, targets, optimizer, loss)?;
            if !config.metrics.is_empty() {
                let predictions = model.forward(inputs)?;
                for (sum, metric) in metric_sums.iter_mut().zip(&config.metrics) {
                    *sum += metric.compute(&predictions, targets);
                }
            }
        }
        let avg_loss = total_loss / dataset.len() as f32;
        epoch_losses.push(avg_loss);
        for (value, sum) in metric_values.iter_mut().zip(&metric_sums) {
            *value = sum / dataset.len() as f32;
        }
        info!(epoch, loss = avg_loss, "epoch finished");

        for hook in hooks.iter_mut() {
            hook.on_epoch_end(epoch, model);
        }
    }

    let final_loss = epoch_losses.last().copied().unwrap_or(0.0);
    let best_loss = epoch_losses.iter().copied().fold(f32::INFINITY, f32::min);
    Ok(FitReport {
        epochs_run: config.epochs,
        final_loss,
        best_loss,
        epoch_losses,
        metric_values,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Activation, Dense, FeatureShape};
    use crate::optim::Sgd;
    use crate::train::MseLoss;
    use ndarray::arr2;

    fn regression_setup() -> (Model, Dataset) {
        let model = Model::new(
            FeatureShape::flat(1),
            vec![Dense::with_weights("d", arr2(&[[0.0]]), None, Activation::Linear).into()],
        )
        .unwrap();
        // Learn y = 2x.
        let batches = vec![Batch::new(
            Feature::Flat(arr2(&[[1.0], [2.0], [-1.0]])),
            Feature::Flat(arr2(&[[2.0], [4.0], [-2.0]])),
        )];
        (model, Dataset::from_batches(batches))
    }

    #[test]
    fn test_fit_reduces_loss() {
        let (mut model, dataset) = regression_setup();
        let mut opt = Sgd::new(0.05, 0.0);
        let report = fit(
            &mut model,
            &dataset,
            &mut opt,
            &MseLoss,
            &FitConfig::new(200),
            &mut [],
        )
        .unwrap();
        assert!(report.final_loss < 1e-3);
        assert!(report.final_loss <= report.epoch_losses[0]);
        assert_eq!(report.epochs_run, 200);
    }

    #[test]
    fn test_fit_learns_the_slope() {
        let (mut model, dataset) = regression_setup();
        let mut opt = Sgd::new(0.05, 0.0);
        fit(
            &mut model,
            &dataset,
            &mut opt,
            &MseLoss,
            &FitConfig::new(300),
            &mut [],
        )
        .unwrap();
        let y = model
            .forward(&Feature::Flat(arr2(&[[3.0]])))
            .unwrap();
        assert!((y.as_flat().unwrap()[[0, 0]] - 6.0).abs() < 0.05);
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let (mut model, _) = regression_setup();
        let mut opt = Sgd::new(0.05, 0.0);
        let err = fit(
            &mut model,
            &Dataset::default(),
            &mut opt,
            &MseLoss,
            &FitConfig::new(1),
            &mut [],
        )
        .unwrap_err();
        assert!(matches!(err, CompressError::EmptyDataset));
    }

    #[test]
    fn test_hooks_run_every_epoch() {
        struct Counter(usize);
        impl EpochHook for Counter {
            fn on_epoch_end(&mut self, _epoch: usize, _model: &mut Model) {
                self.0 += 1;
            }
        }
        let (mut model, dataset) = regression_setup();
        let mut opt = Sgd::new(0.05, 0.0);
        let mut counter = Counter(0);
        fit(
            &mut model,
            &dataset,
            &mut opt,
            &MseLoss,
            &FitConfig::new(5),
            &mut [&mut counter],
        )
        .unwrap();
        assert_eq!(counter.0, 5);
    }
}
