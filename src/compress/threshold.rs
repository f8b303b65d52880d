//! Threshold pruning of a dense kernel
//!
//! Zeroes every kernel weight whose magnitude falls below the threshold, in
//! place; the bias is untouched and the chain is not rebuilt.

use super::session::CompressionSession;
use crate::error::{CompressError, Result};
use crate::nn::Layer;
use tracing::{debug, info};

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    threshold: f32,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Dense(dense) = session.model.layer_mut(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "threshold pruning targets a dense layer".to_string(),
        });
    };
    let kernel = dense.kernel_mut().ok_or_else(|| CompressError::NotBuilt {
        layer: layer_name.to_string(),
    })?;

    let mut pruned = 0usize;
    for w in kernel.iter_mut() {
        if w.abs() < threshold {
            *w = 0.0;
            pruned += 1;
        }
    }
    info!(pruned, "pruned weights");

    let zeroes = kernel.iter().filter(|w| **w == 0.0).count();
    debug!(zeroes, "weights with value 0.0");
    session.weights_after = Some(session.weights_before - zeroes);
    info!("finished compression");
    Ok(())
}
