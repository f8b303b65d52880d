//! Per-pixel MLP substitution for a convolution layer

use super::edit::EditAction;
use super::session::CompressionSession;
use super::surrogate::{fit_surrogate, surrogate_model};
use crate::error::{CompressError, Result};
use crate::nn::{Layer, MlpConv};
use tracing::info;

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    iterations: usize,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Conv2d(conv) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "MLP substitution targets a convolution layer".to_string(),
        });
    };
    let filters = conv.filters();
    let kernel_size = conv.kernel_size;
    let activation = conv.activation;

    let mut surrogate = surrogate_model(
        &session.model,
        idx,
        vec![MlpConv::new(
            format!("{layer_name}/MLPConv"),
            filters,
            kernel_size,
            activation,
        )
        .into()],
    )?;
    info!("learning MLP filter");
    fit_surrogate(
        &session.model,
        idx,
        &mut surrogate,
        session.dataset()?,
        iterations,
    )?;
    info!("finished learning filter");

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
