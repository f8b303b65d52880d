//! Shared capture-and-regress protocol for the convolution substitutions
//!
//! Two capture models share the original model's input: one produces the
//! tensor flowing *into* the target layer, one the target layer's own output
//! (the regression target). The surrogate chain is trained on mean absolute
//! error against the captured outputs, one optimizer step per batch, for a
//! fixed number of passes over the dataset. Convergence is not checked; the
//! final loss is logged for the caller to judge.

use crate::error::Result;
use crate::nn::{Layer, Model};
use crate::optim::Adam;
use crate::train::{train_batch, Dataset, MaeLoss};
use tracing::info;

/// Build a surrogate chain whose input is the tensor flowing into
/// `model.layers()[target_idx]`.
pub(crate) fn surrogate_model(
    model: &Model,
    target_idx: usize,
    layers: Vec<Layer>,
) -> Result<Model> {
    let input_shape = model.prefix(target_idx)?.output_shape();
    Model::new(input_shape, layers)
}

/// Regress `surrogate` onto the target layer's input/output mapping.
/// Returns the last batch loss.
pub(crate) fn fit_surrogate(
    model: &Model,
    target_idx: usize,
    surrogate: &mut Model,
    dataset: &Dataset,
    iterations: usize,
) -> Result<f32> {
    let capture_input = model.prefix(target_idx)?;
    let capture_output = model.prefix(target_idx + 1)?;
    let mut optimizer = Adam::default_params();
    let mut last_loss = 0.0;

    for iteration in 1..=iterations {
        for batch in dataset.iter() {
            let x_in = capture_input.forward(&batch.inputs)?;
            let target = capture_output.forward(&batch.inputs)?;
            last_loss = train_batch(surrogate, &x_in, &target, &mut optimizer, &MaeLoss)?;
        }
        info!(iteration, loss = last_loss, "surrogate fit");
    }
    Ok(last_loss)
}
