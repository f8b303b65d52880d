//! Learned low-rank dense factorization
//!
//! Structurally identical to the closed-form SVD split, but the two factors
//! are learned by Adam from Gaussian starts, minimizing the L2 distance to
//! the original kernel for a fixed iteration count.

use super::dense_svd::splice_factor_pair;
use super::session::CompressionSession;
use crate::error::{CompressError, Result};
use crate::factor::fit_factor_pair;
use crate::nn::{Activation, Dense, Layer};
use tracing::info;

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    units: usize,
    iterations: usize,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Dense(dense) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "learned factorization targets a dense layer".to_string(),
        });
    };
    let kernel = dense
        .kernel()
        .ok_or_else(|| CompressError::NotBuilt {
            layer: layer_name.to_string(),
        })?
        .clone();
    let bias = dense.bias().cloned();
    let activation = dense.activation();

    let fit = fit_factor_pair(&kernel, units, iterations, &mut rand::thread_rng());
    info!(loss = fit.final_loss, "factor fit finished");
    let inserted_size = fit.left.len();
    let moved_size = fit.right.len();

    splice_factor_pair(
        session,
        idx,
        Dense::with_weights(
            format!("{layer_name}/InsertedDense"),
            fit.left,
            None,
            Activation::Linear,
        ),
        Dense::with_weights(
            format!("{layer_name}/MovedDense"),
            fit.right,
            bias,
            activation,
        ),
    );
    session.update_model()?;
    session.fine_tune()?;

    let delta = kernel.len() as i64 - (inserted_size + moved_size) as i64;
    session.weights_after = Some((session.weights_before as i64 - delta).max(0) as usize);
    info!("finished compression");
    Ok(())
}
