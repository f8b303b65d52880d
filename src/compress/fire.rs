//! Fire-module substitution for a convolution layer
//!
//! The module squeezes to `filters / 4` channels with a 1x1 convolution and
//! expands through parallel 1x1 and 3x3 branches of `filters / 2` each, so
//! the concatenated output restores the original filter count.

use super::edit::EditAction;
use super::session::CompressionSession;
use super::surrogate::{fit_surrogate, surrogate_model};
use crate::error::{CompressError, Result};
use crate::nn::{FireModule, Layer};
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
            reason: "fire substitution targets a convolution layer".to_string(),
        });
    };
    let filters = conv.filters();

    info!("creating fire module");
    let mut surrogate = surrogate_model(
        &session.model,
        idx,
        vec![FireModule::new(
            format!("{layer_name}/FireLayer"),
            filters / 4,
            filters / 2,
            filters / 2,
        )
        .into()],
    )?;
    info!("training fire module");
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
