//! Progressive channel-to-filter sparsification of a convolution
//!
//! The target convolution is rebuilt as a mask-carrying convolution that
//! starts with roughly 1% of its channel-to-filter connections active, then
//! trains while an epoch hook randomly activates more connections until a
//! target fraction is reached. The saving is the kernel area times the
//! connections still inactive at the end.

use super::session::CompressionSession;
use crate::error::{CompressError, Result};
use crate::nn::{Layer, Model, SparseConnConv2d};
use crate::train::{fit, EpochHook, FitConfig};
use ndarray::Array2;
use rand::seq::SliceRandom;
use tracing::info;

/// Epoch hook that grows a [`SparseConnConv2d`] mask toward a target
/// fraction, activating at most a fixed share of all connections per epoch
/// and never overshooting the target.
pub struct ProgressiveConnectionsHook {
    layer_index: usize,
    target_fraction: f32,
    connections_per_epoch: f32,
}

impl ProgressiveConnectionsHook {
    /// Hook for the layer at `layer_index`.
    pub fn new(layer_index: usize, target_fraction: f32, connections_per_epoch: f32) -> Self {
        Self {
            layer_index,
            target_fraction,
            connections_per_epoch,
        }
    }
}

impl EpochHook for ProgressiveConnectionsHook {
    fn on_epoch_end(&mut self, _epoch: usize, model: &mut Model) {
        info!("updating sparse connections");
        let Layer::SparseConnConv2d(layer) = model.layer_mut(self.layer_index) else {
            return;
        };
        let total = layer.total_connections();
        let fraction = layer.active_fraction();
        if fraction >= self.target_fraction {
            return;
        }
        let select = (total as f32 * self.connections_per_epoch) as usize;
        let remaining = (total as f32 * (self.target_fraction - fraction)) as usize;
        let added = layer.add_random_connections(select.min(remaining), &mut rand::thread_rng());
        info!(
            added,
            active = layer.active_connections(),
            total,
            "activated connections"
        );
    }

    fn name(&self) -> &'static str {
        "ProgressiveConnectionsHook"
    }
}

pub(crate) fn compress(
    session: &mut CompressionSession,
    layer_name: &str,
    epochs: usize,
    target_fraction: f32,
    connections_per_epoch: f32,
) -> Result<()> {
    info!(layer = layer_name, "searching for layer");
    let idx = session.find_layer(layer_name)?;
    let Layer::Conv2d(conv) = session.model.layer(idx) else {
        return Err(CompressError::InvalidTarget {
            layer: layer_name.to_string(),
            reason: "connection sparsification targets a convolution layer".to_string(),
        });
    };
    let kernel = conv
        .kernel()
        .ok_or_else(|| CompressError::NotBuilt {
            layer: layer_name.to_string(),
        })?
        .clone();
    let bias = conv
        .bias()
        .ok_or_else(|| CompressError::NotBuilt {
            layer: layer_name.to_string(),
        })?
        .clone();
    let (kh, kw, channels, filters) = kernel.dim();
    let (activation, padding) = (conv.activation, conv.padding);

    // Seed roughly 1% of the connections.
    let total = filters * channels;
    let mut mask = Array2::<u8>::zeros((filters, channels));
    let mut all: Vec<(usize, usize)> = mask.indexed_iter().map(|(pos, _)| pos).collect();
    all.shuffle(&mut rand::thread_rng());
    for &(f, c) in all.iter().take(total.div_ceil(100)) {
        mask[[f, c]] = 1;
    }

    info!("creating model with sparse connections layer");
    let sparse_name = format!("{layer_name}/SparseConnectionsConv");
    let sparse_layer = SparseConnConv2d::from_weights(
        sparse_name.clone(),
        kernel,
        bias,
        mask,
        activation,
        padding,
    );
    let mut layers = session.model.layers().to_vec();
    layers[idx] = sparse_layer.into();
    session.model = Model::new(session.model.input_shape(), layers)?;

    // Sparsification training with the progressive hook.
    let layer_idx = session.find_layer(&sparse_name)?;
    let mut hook =
        ProgressiveConnectionsHook::new(layer_idx, target_fraction, connections_per_epoch);
    {
        let CompressionSession {
            model,
            optimizer,
            loss,
            dataset,
            ..
        } = session;
        let dataset = dataset.as_ref().ok_or(CompressError::EmptyDataset)?;
        fit(
            model,
            dataset,
            optimizer.as_mut(),
            loss.as_ref(),
            &FitConfig::new(epochs),
            &mut [&mut hook],
        )?;
    }

    let Layer::SparseConnConv2d(layer) = session.model.layer(layer_idx) else {
        return Err(CompressError::LayerNotFound { name: sparse_name });
    };
    let inactive = layer.total_connections() - layer.active_connections();
    info!(
        active = layer.active_connections(),
        "compressed model connections"
    );
    session.weights_after = Some(
        (session.weights_before as i64 - (kh * kw * inactive) as i64).max(0) as usize,
    );

    session.fine_tune()?;
    info!("finished compression");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{SessionConfig, Technique};
    use crate::nn::{Activation, Conv2d, Feature, FeatureShape, Padding};
    use crate::optim::Sgd;
    use crate::train::{Batch, Dataset, MseLoss};
    use ndarray::{Array1, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conv_session() -> CompressionSession {
        let mut rng = StdRng::seed_from_u64(59);
        let kernel: Array4<f32> = crate::init::random_normal((3, 3, 4, 8), &mut rng);
        let model = Model::new(
            FeatureShape::map(6, 6, 4),
            vec![Conv2d::with_weights(
                "conv_0",
                kernel,
                Array1::zeros(8),
                Activation::Relu,
                Padding::Valid,
            )
            .into()],
        )
        .unwrap();
        let x: Array4<f32> = crate::init::random_normal((2, 6, 6, 4), &mut rng);
        let y: Array4<f32> = Array4::zeros((2, 4, 4, 8));
        let dataset =
            Dataset::from_batches(vec![Batch::new(Feature::Map(x), Feature::Map(y))]);
        CompressionSession::new(
            model,
            Box::new(Sgd::new(0.001, 0.0)),
            Box::new(MseLoss),
            Some(dataset),
            SessionConfig::new().with_fine_tune(false),
        )
    }

    #[test]
    fn test_progressive_growth_is_monotone_and_capped() {
        let mut session = conv_session();
        session
            .compress_layer(
                &Technique::SparseConnections {
                    epochs: 6,
                    target_fraction: 0.5,
                    connections_per_epoch: 0.1,
                },
                "conv_0",
            )
            .unwrap();
        let Layer::SparseConnConv2d(layer) = session.model().layer(0) else {
            panic!("sparse layer missing");
        };
        let fraction = layer.active_fraction();
        assert!(fraction > 0.01);
        assert!(fraction <= 0.5 + f32::EPSILON);
    }

    #[test]
    fn test_weight_saving_counts_inactive_kernel_area() {
        let mut session = conv_session();
        let before = session.get_weights_diff().0;
        session
            .compress_layer(
                &Technique::SparseConnections {
                    epochs: 2,
                    target_fraction: 0.25,
                    connections_per_epoch: 0.1,
                },
                "conv_0",
            )
            .unwrap();
        let Layer::SparseConnConv2d(layer) = session.model().layer(0) else {
            panic!()
        };
        let inactive = layer.total_connections() - layer.active_connections();
        let (_, after) = session.get_weights_diff();
        assert_eq!(after.unwrap(), before - 9 * inactive);
    }

    #[test]
    fn test_hook_never_overshoots_target() {
        let mut model = Model::new(
            FeatureShape::map(5, 5, 4),
            vec![SparseConnConv2d::from_weights(
                "sparse",
                Array4::zeros((3, 3, 4, 8)),
                Array1::zeros(8),
                Array2::zeros((8, 4)),
                Activation::Linear,
                Padding::Valid,
            )
            .into()],
        )
        .unwrap();
        let mut hook = ProgressiveConnectionsHook::new(0, 0.75, 0.1);
        let mut previous = 0.0;
        for epoch in 0..20 {
            hook.on_epoch_end(epoch, &mut model);
            let Layer::SparseConnConv2d(layer) = model.layer(0) else {
                panic!()
            };
            let fraction = layer.active_fraction();
            assert!(fraction >= previous, "fraction decreased");
            assert!(fraction <= 0.75 + f32::EPSILON, "target overshot");
            previous = fraction;
        }
        assert!(previous >= 0.7);
    }
}
