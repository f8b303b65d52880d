//! Two-convolution substitution for a convolution layer
//!
//! The surrogate stacks a same-padded convolution with `units` filters and a
//! valid convolution restoring the original filter count, regressed onto the
//! target layer's input/output mapping and spliced in as an insert+replace
//! pair.

use super::edit::EditAction;
use super::session::CompressionSession;
use super::surrogate::{fit_surrogate, surrogate_model};
use crate::error::{CompressError, Result};
use crate::nn::{Activation, Conv2d, Layer, Padding};
use tracing::info;

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    units: usize,
    iterations: usize,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Conv2d(conv) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "convolution substitution targets a convolution layer".to_string(),
        });
    };
    let filters = conv.filters();
    let kernel_size = conv.kernel_size;

    let mut surrogate = surrogate_model(
        &session.model,
        idx,
        vec![
            Conv2d::new(
                format!("{layer_name}/SVDConv1"),
                units,
                kernel_size,
                Activation::Relu,
                Padding::Same,
            )
            .into(),
            Conv2d::new(
                format!("{layer_name}/SVDConv2"),
                filters,
                kernel_size,
                Activation::Relu,
                Padding::Valid,
            )
            .into(),
        ],
    )?;
    fit_surrogate(
        &session.model,
        idx,
        &mut surrogate,
        session.dataset()?,
        iterations,
    )?;

    let mut layers = surrogate.into_layers();
    let conv2 = layers.pop().expect("surrogate has two layers");
    let conv1 = layers.pop().expect("surrogate has two layers");
    session.queue_edit(idx + 1, EditAction::Replace(conv2));
    session.queue_edit(idx, EditAction::Insert(conv1));

    session.update_model()?;
    session.fine_tune()?;
    session.weights_after = Some(session.count_trainable_weights());
    info!("finished compression");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{SessionConfig, Technique};
    use crate::nn::{Feature, FeatureShape, Model};
    use crate::optim::Sgd;
    use crate::train::{Batch, Dataset, MseLoss};
    use ndarray::{Array1, Array2, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conv_session() -> CompressionSession {
        let mut rng = StdRng::seed_from_u64(41);
        let kernel: Array4<f32> = crate::init::random_normal((3, 3, 1, 2), &mut rng);
        let model = Model::new(
            FeatureShape::map(6, 6, 1),
            vec![Conv2d::with_weights(
                "conv_0",
                kernel,
                Array1::zeros(2),
                Activation::Relu,
                Padding::Valid,
            )
            .into()],
        )
        .unwrap();
        let x: Array4<f32> = crate::init::random_normal((2, 6, 6, 1), &mut rng);
        let dataset = Dataset::from_batches(vec![Batch::new(
            Feature::Map(x),
            Feature::Flat(Array2::zeros((2, 1))),
        )]);
        CompressionSession::new(
            model,
            Box::new(Sgd::new(0.01, 0.0)),
            Box::new(MseLoss),
            Some(dataset),
            SessionConfig::new().with_fine_tune(false),
        )
    }

    #[test]
    fn test_splice_and_shapes() {
        let mut session = conv_session();
        session
            .compress_layer(
                &Technique::ConvSvd {
                    units: 3,
                    iterations: 1,
                },
                "conv_0",
            )
            .unwrap();
        let model = session.model();
        assert_eq!(model.len(), 2);
        assert_eq!(model.layer(0).name(), "conv_0/SVDConv1");
        assert_eq!(model.layer(1).name(), "conv_0/SVDConv2");
        // Same + valid keeps the original output shape.
        assert_eq!(model.output_shape(), FeatureShape::map(4, 4, 2));
        assert!(session.get_weights_diff().1.is_some());
    }

    #[test]
    fn test_missing_dataset_is_an_error() {
        let mut session = conv_session();
        session.dataset = None;
        let err = session
            .compress_layer(
                &Technique::ConvSvd {
                    units: 3,
                    iterations: 1,
                },
                "conv_0",
            )
            .unwrap_err();
        assert!(matches!(err, CompressError::EmptyDataset));
    }
}
