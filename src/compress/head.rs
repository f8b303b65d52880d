//! Replace the dense head with a global average pool
//!
//! Scans every layer whose name matches the dense/fully-connected/flatten
//! pattern between the last convolution and the classifier: the non-final
//! matches are deleted, the classifier is replaced by a freshly initialized
//! one sized to the last convolution's filter count, and a global average
//! pool is spliced in front of it. The classifier re-initialization makes
//! fine-tuning mandatory for a usable model.

use super::edit::EditAction;
use super::session::CompressionSession;
use crate::error::{CompressError, Result};
use crate::nn::{Activation, Dense, GlobalAvgPool2d, Layer};
use regex::Regex;
use tracing::info;

pub(crate) fn compress(session: &mut CompressionSession) -> Result<()> {
    info!("searching for all dense layers");
    let pattern = Regex::new(r"dense|fc|flatten").expect("hardcoded pattern is valid");

    let mut filters: Option<usize> = None;
    let mut removed_weights = 0usize;
    let mut classifier: Option<(usize, usize)> = None;
    let mut edits: Vec<(usize, EditAction)> = Vec::new();

    for (idx, layer) in session.model.layers().iter().enumerate() {
        let config = layer.config();
        let lname = config.name.to_lowercase();
        if pattern.is_match(&lname) {
            if lname.contains("softmax") {
                let num_classes = config.units.ok_or_else(|| CompressError::InvalidTarget {
                    layer: config.name.clone(),
                    reason: "the classifier must be a dense layer".to_string(),
                })?;
                let Layer::Dense(dense) = layer else {
                    return Err(CompressError::InvalidTarget {
                        layer: config.name.clone(),
                        reason: "the classifier must be a dense layer".to_string(),
                    });
                };
                let kernel_size = dense
                    .kernel()
                    .map(|k| k.len())
                    .ok_or_else(|| CompressError::NotBuilt {
                        layer: config.name.clone(),
                    })?;
                classifier = Some((num_classes, kernel_size));
                edits.push((
                    idx,
                    EditAction::Replace(
                        Dense::new("softmax", num_classes, Activation::Softmax).into(),
                    ),
                ));
            } else {
                removed_weights += layer.trainable_weight_count();
                edits.push((idx, EditAction::Delete));
            }
        } else if let Some(f) = config.filters {
            filters = Some(f);
        }
    }

    let (num_classes, old_classifier_size) =
        classifier.ok_or_else(|| CompressError::InvalidTarget {
            layer: "softmax".to_string(),
            reason: "no classifier layer matched the dense-head pattern".to_string(),
        })?;
    let filters = filters.ok_or_else(|| CompressError::InvalidTarget {
        layer: "softmax".to_string(),
        reason: "no convolution precedes the dense head".to_string(),
    })?;
    if session.model.len() < 2 {
        return Err(CompressError::InvalidTarget {
            layer: "softmax".to_string(),
            reason: "the chain is too short to hold a pooled head".to_string(),
        });
    }

    let pool_index = session.model.len() - 2;
    for (idx, action) in edits {
        session.queue_edit(idx, action);
    }
    // Last writer wins: this overwrites any delete queued at the pool index.
    session.queue_edit(
        pool_index,
        EditAction::Replace(GlobalAvgPool2d::new("global_avg_pool").into()),
    );
    info!(changes = session.edits.len(), "number of changes required");

    session.update_model()?;
    session.fine_tune()?;

    let delta = removed_weights as i64 + old_classifier_size as i64
        - (num_classes * filters) as i64;
    session.weights_after = Some((session.weights_before as i64 - delta).max(0) as usize);
    info!("finished compression");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{SessionConfig, Technique};
    use crate::nn::{Conv2d, FeatureShape, Flatten, LayerKind, Model, Padding};
    use crate::optim::Sgd;
    use crate::train::MseLoss;

    fn conv_head_session() -> CompressionSession {
        let model = Model::new(
            FeatureShape::map(6, 6, 1),
            vec![
                Conv2d::new("conv_0", 4, (3, 3), Activation::Relu, Padding::Valid).into(),
                Flatten::new("flatten_0").into(),
                Dense::new("dense_fc", 10, Activation::Relu).into(),
                Dense::new("dense_softmax", 3, Activation::Softmax).into(),
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
    fn test_head_is_replaced_with_pool() {
        let mut session = conv_head_session();
        session
            .compress_layer(&Technique::ReplaceDenseWithGlobalAvgPool, "")
            .unwrap();
        let kinds: Vec<LayerKind> = session.model().layers().iter().map(Layer::kind).collect();
        assert_eq!(
            kinds,
            [LayerKind::Conv2d, LayerKind::GlobalAvgPool2d, LayerKind::Dense]
        );
        // The fresh classifier takes the conv filter count as input.
        let Layer::Dense(classifier) = session.model().layer(2) else {
            panic!("classifier missing");
        };
        assert_eq!(classifier.kernel().unwrap().dim(), (4, 3));
    }

    #[test]
    fn test_weight_accounting() {
        let mut session = conv_head_session();
        let before = session.get_weights_diff().0;
        // Removed: flatten (0) + dense_fc (16*4*10 + 10); classifier shrink:
        // 10*3 -> 4*3 kernel.
        session
            .compress_layer(&Technique::ReplaceDenseWithGlobalAvgPool, "")
            .unwrap();
        let (_, after) = session.get_weights_diff();
        let expected = before as i64 - (64 * 10 + 10) as i64 - (10 * 3 - 4 * 3) as i64;
        assert_eq!(after.unwrap() as i64, expected);
    }

    #[test]
    fn test_fails_without_preceding_conv() {
        let model = Model::new(
            FeatureShape::flat(8),
            vec![
                Dense::new("dense_fc", 10, Activation::Relu).into(),
                Dense::new("dense_softmax", 3, Activation::Softmax).into(),
            ],
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
            .compress_layer(&Technique::ReplaceDenseWithGlobalAvgPool, "")
            .unwrap_err();
        assert!(matches!(err, CompressError::InvalidTarget { .. }));
    }
}
