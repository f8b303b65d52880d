//! Depthwise-separable substitution for a convolution layer

use super::edit::EditAction;
use super::session::CompressionSession;
use super::surrogate::{fit_surrogate, surrogate_model};
use crate::error::{CompressError, Result};
use crate::nn::{Activation, Layer, Padding, SeparableConv2d};
use tracing::info;

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    iterations: usize,
) -> Result<()> {
    // The count is re-captured at strategy start so the diff reflects the
    // model as this strategy found it.
    session.weights_before = session.count_trainable_weights();
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Conv2d(conv) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "separable substitution targets a convolution layer".to_string(),
        });
    };
    let filters = conv.filters();
    let kernel_size = conv.kernel_size;

    let mut surrogate = surrogate_model(
        &session.model,
        idx,
        vec![SeparableConv2d::new(
            format!("{layer_name}/DepthwiseSeparableLayer"),
            filters,
            kernel_size,
            Activation::Linear,
            Padding::Valid,
        )
        .into()],
    )?;
    fit_surrogate(
        &session.model,
        idx,
        &mut surrogate,
        session.dataset()?,
        iterations,
    )?;

    let replacement = surrogate
        .into_layers()
        .pop()
        .expect("surrogate has one layer");
    session.queue_edit(idx, EditAction::Replace(replacement));
    session.update_model()?;
    session.fine_tune()?;
    session.weights_after = Some(session.count_trainable_weights());
    info!("finished compression");
    Ok(())
}
