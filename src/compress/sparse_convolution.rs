//! Structured sparse convolution substitution via P/Q/S factorization
//!
//! Fits the channel-mix and spatial factors against the target kernel, builds
//! the three-stage contraction layer from them, regresses it onto the target
//! layer's input/output mapping, and splices it in. This strategy reports no
//! weight delta; `get_weights_diff` keeps `None` for the after-count.

use super::edit::EditAction;
use super::session::CompressionSession;
use super::surrogate::{fit_surrogate, surrogate_model};
use crate::error::{CompressError, Result};
use crate::factor::fit_pqs;
use crate::nn::{Layer, SparseConv2d};
use tracing::info;

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    bases: usize,
    iterations: usize,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Conv2d(conv) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "structured factorization targets a convolution layer".to_string(),
        });
    };
    let kernel = conv
        .kernel()
        .ok_or_else(|| CompressError::NotBuilt {
            layer: layer_name.to_string(),
        })?
        .clone();
    let filters = conv.filters();
    let kernel_size = conv.kernel_size;
    let activation = conv.activation;

    info!("searching for matrices P, Q and S");
    let factors = fit_pqs(&kernel, bases, iterations, &mut rand::thread_rng());

    info!("creating model with sparse convolution layer");
    let mut surrogate = surrogate_model(
        &session.model,
        idx,
        vec![SparseConv2d::from_factors(
            format!("{layer_name}/SparseConv2D"),
            kernel_size,
            filters,
            bases,
            factors.p,
            factors.q,
            factors.s,
            activation,
        )
        .into()],
    )?;
    info!("starting training");
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
    info!("finished compression");
    Ok(())
}
