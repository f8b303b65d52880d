//! Sparse dictionary factorization of a dense kernel
//!
//! Learns a Gaussian basis and a binary code whose product approximates the
//! kernel; the code layer keeps the binary constraint so fine-tune updates
//! are re-rounded. The reported saving counts the code's post-fit non-zeros
//! plus the full basis, an optimistic figure since the constraint keeps
//! re-rounding rather than guaranteeing monotone sparsity.

use super::dense_svd::splice_factor_pair;
use super::session::CompressionSession;
use crate::error::{CompressError, Result};
use crate::factor::fit_binary_dict;
use crate::nn::{Activation, BinaryWeightConstraint, Dense, Layer};
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
            reason: "sparse dictionary factorization targets a dense layer".to_string(),
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

    let fit = fit_binary_dict(&kernel, units, iterations, &mut rand::thread_rng());
    info!(loss = fit.final_loss, "dictionary fit finished");
    let basis_size = fit.left.len();

    splice_factor_pair(
        session,
        idx,
        Dense::with_weights(
            format!("{layer_name}/BasisDictLayer"),
            fit.left,
            None,
            Activation::Linear,
        ),
        Dense::with_weights(
            format!("{layer_name}/SparseCodeLayer"),
            fit.right,
            bias,
            activation,
        )
        .with_constraint(BinaryWeightConstraint::new(units as f32)),
    );
    session.update_model()?;

    let code_idx = session.find_layer(&format!("{layer_name}/SparseCodeLayer"))?;
    let code_nonzeroes = count_nonzeroes(session, code_idx)?;
    info!(
        zeroes = count_zeroes(session, code_idx)?,
        "sparse code zeroes before fine-tuning"
    );
    let basis_idx = session.find_layer(&format!("{layer_name}/BasisDictLayer"))?;
    info!(
        zeroes = count_zeroes(session, basis_idx)?,
        "basis zeroes before fine-tuning"
    );

    session.fine_tune()?;

    info!(
        zeroes = count_zeroes(session, code_idx)?,
        "sparse code zeroes after fine-tuning"
    );
    info!(
        zeroes = count_zeroes(session, basis_idx)?,
        "basis zeroes after fine-tuning"
    );

    let delta = kernel.len() as i64 - (code_nonzeroes + basis_size) as i64;
    session.weights_after = Some((session.weights_before as i64 - delta).max(0) as usize);
    info!("finished compression");
    Ok(())
}

fn count_zeroes(session: &CompressionSession, idx: usize) -> Result<usize> {
    dense_kernel(session, idx).map(|k| k.iter().filter(|w| **w == 0.0).count())
}

fn count_nonzeroes(session: &CompressionSession, idx: usize) -> Result<usize> {
    dense_kernel(session, idx).map(|k| k.iter().filter(|w| **w != 0.0).count())
}

fn dense_kernel<'a>(
    session: &'a CompressionSession,
    idx: usize,
) -> Result<&'a ndarray::Array2<f32>> {
    let layer = session.model.layer(idx);
    let Layer::Dense(dense) = layer else {
        return Err(CompressError::InvalidTarget {
            layer: layer.name().to_string(),
            reason: "expected a dense layer".to_string(),
        });
    };
    dense.kernel().ok_or_else(|| CompressError::NotBuilt {
        layer: layer.name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{SessionConfig, Technique};
    use crate::nn::{FeatureShape, Model};
    use crate::optim::Sgd;
    use crate::train::MseLoss;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn session() -> CompressionSession {
        let mut rng = StdRng::seed_from_u64(29);
        let w: Array2<f32> = crate::init::random_normal((6, 5), &mut rng);
        let model = Model::new(
            FeatureShape::flat(6),
            vec![Dense::with_weights("dense_0", w, None, Activation::Relu).into()],
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
    fn test_splice_names_and_binary_code() {
        let mut session = session();
        session
            .compress_layer(
                &Technique::DenseSparseDict {
                    units: 3,
                    iterations: 100,
                },
                "dense_0",
            )
            .unwrap();
        let model = session.model();
        assert_eq!(model.len(), 2);
        assert_eq!(model.layer(0).name(), "dense_0/BasisDictLayer");
        assert_eq!(model.layer(1).name(), "dense_0/SparseCodeLayer");

        let Layer::Dense(code) = model.layer(1) else {
            panic!()
        };
        assert!(code
            .kernel()
            .unwrap()
            .iter()
            .all(|&v| v.fract() == 0.0 && v >= 0.0));
    }

    #[test]
    fn test_reported_saving_counts_nonzeroes() {
        let mut session = session();
        let before = session.get_weights_diff().0;
        session
            .compress_layer(
                &Technique::DenseSparseDict {
                    units: 3,
                    iterations: 100,
                },
                "dense_0",
            )
            .unwrap();
        let (_, after) = session.get_weights_diff();
        let model = session.model();
        let Layer::Dense(code) = model.layer(1) else {
            panic!()
        };
        let nonzeroes = code.kernel().unwrap().iter().filter(|w| **w != 0.0).count();
        let basis_size = 6 * 3;
        let expected = before as i64 - (30 - (nonzeroes + basis_size) as i64);
        assert_eq!(after.unwrap() as i64, expected.max(0));
    }
}
