//! Closed-form low-rank dense factorization
//!
//! Splits a dense kernel `W (M, N)` by truncated SVD into a bias-free linear
//! layer `U_k (M, units)` inserted before the target and a replacement layer
//! `diag(S_k) · Vt_k (units, N)` that keeps the original bias and
//! activation. Lossless at full rank; the truncation residual is logged.

use super::edit::EditAction;
use super::session::CompressionSession;
use crate::error::{CompressError, Result};
use crate::factor::truncated_factors;
use crate::nn::{Activation, Dense, Layer};
use tracing::info;

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    units: usize,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Dense(dense) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "SVD factorization targets a dense layer".to_string(),
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

    let (u_k, n_k, loss) = truncated_factors(&kernel, units);
    info!(loss, "new weights L2 reconstruction loss");
    let inserted_size = u_k.len();
    let moved_size = n_k.len();

    splice_factor_pair(
        session,
        idx,
        Dense::with_weights(
            format!("{layer_name}/InsertedDense"),
            u_k,
            None,
            Activation::Linear,
        ),
        Dense::with_weights(format!("{layer_name}/MovedDense"), n_k, bias, activation),
    );
    session.update_model()?;
    session.fine_tune()?;

    let delta = kernel.len() as i64 - (inserted_size + moved_size) as i64;
    session.weights_after = Some((session.weights_before as i64 - delta).max(0) as usize);
    info!("finished compression");
    Ok(())
}

/// Queue the shared insert+replace splice of the dense factorizations: the
/// replacement is queued first so the insertion, applied first, shifts the
/// target under it.
pub(crate) fn splice_factor_pair(
    session: &mut CompressionSession,
    idx: usize,
    inserted: Dense,
    replacement: Dense,
) {
    session.queue_edit(idx + 1, EditAction::Replace(replacement.into()));
    session.queue_edit(idx, EditAction::Insert(inserted.into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{SessionConfig, Technique};
    use crate::nn::{Feature, FeatureShape, Model};
    use crate::optim::Sgd;
    use crate::train::MseLoss;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dense_chain_session() -> CompressionSession {
        let mut rng = StdRng::seed_from_u64(8);
        let w1: Array2<f32> = crate::init::random_normal((8, 8), &mut rng);
        let w2: Array2<f32> = crate::init::random_normal((8, 4), &mut rng);
        let model = Model::new(
            FeatureShape::flat(8),
            vec![
                Dense::with_weights("dense_0", w1, None, Activation::Relu).into(),
                Dense::with_weights("dense_1", w2, None, Activation::Linear).into(),
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
    fn test_splice_shapes_and_names() {
        let mut session = dense_chain_session();
        session
            .compress_layer(&Technique::DenseSvd { units: 4 }, "dense_0")
            .unwrap();
        let model = session.model();
        assert_eq!(model.len(), 3);
        assert_eq!(model.layer(0).name(), "dense_0/InsertedDense");
        assert_eq!(model.layer(1).name(), "dense_0/MovedDense");
        assert_eq!(model.layer(2).name(), "dense_1");

        let Layer::Dense(inserted) = model.layer(0) else {
            panic!()
        };
        let Layer::Dense(moved) = model.layer(1) else {
            panic!()
        };
        assert_eq!(inserted.kernel().unwrap().dim(), (8, 4));
        assert!(inserted.bias().is_none());
        assert_eq!(moved.kernel().unwrap().dim(), (4, 8));
    }

    #[test]
    fn test_full_rank_preserves_function() {
        let mut session = dense_chain_session();
        let x = Feature::Flat(Array2::from_shape_fn((2, 8), |(i, j)| {
            (i as f32 + 1.0) * 0.1 - j as f32 * 0.05
        }));
        let y_before = session.model().forward(&x).unwrap();
        session
            .compress_layer(&Technique::DenseSvd { units: 8 }, "dense_0")
            .unwrap();
        let y_after = session.model().forward(&x).unwrap();
        for (a, b) in y_before
            .as_flat()
            .unwrap()
            .iter()
            .zip(y_after.as_flat().unwrap().iter())
        {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_weight_delta_at_full_and_low_rank() {
        // Full rank: 64 -> 32 + 32, no net change.
        let mut session = dense_chain_session();
        let before = session.get_weights_diff().0;
        session
            .compress_layer(&Technique::DenseSvd { units: 4 }, "dense_0")
            .unwrap();
        let (_, after) = session.get_weights_diff();
        assert_eq!(after.unwrap(), before);

        // Low rank strictly reduces.
        let mut session = dense_chain_session();
        session
            .compress_layer(&Technique::DenseSvd { units: 2 }, "dense_0")
            .unwrap();
        let (before, after) = session.get_weights_diff();
        assert!(after.unwrap() < before);
    }

    #[test]
    fn test_non_dense_target_rejected() {
        let model = Model::new(
            FeatureShape::map(4, 4, 1),
            vec![crate::nn::Flatten::new("flatten_only").into()],
        )
        .unwrap();
        let mut session = CompressionSession::new(
            model,
            Box::new(Sgd::new(0.01, 0.0)),
            Box::new(MseLoss),
            None,
            SessionConfig::new().with_fine_tune(false),
        );
        let err = session
            .compress_layer(&Technique::DenseSvd { units: 2 }, "flatten_only")
            .unwrap_err();
        assert!(matches!(err, CompressError::InvalidTarget { .. }));
    }
}
