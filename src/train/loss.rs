//! Loss functions
//!
//! Each loss reports a scalar and hands back the explicit gradient w.r.t. the
//! predictions; the model's backward sweep threads that gradient through the
//! chain.

use crate::nn::Feature;
use ndarray::Zip;

/// Trait for loss functions.
pub trait LossFn {
    /// Scalar loss for a prediction/target pair.
    fn loss(&self, predictions: &Feature, targets: &Feature) -> f32;

    /// Gradient of the loss w.r.t. the predictions.
    fn grad(&self, predictions: &Feature, targets: &Feature) -> Feature;

    /// Name of the loss function.
    fn name(&self) -> &'static str;
}

fn for_each_pair(
    predictions: &Feature,
    targets: &Feature,
    mut f: impl FnMut(f32, f32),
) {
    match (predictions, targets) {
        (Feature::Flat(p), Feature::Flat(t)) => {
            assert_eq!(p.dim(), t.dim(), "predictions and targets must match");
            Zip::from(p).and(t).for_each(|&pv, &tv| f(pv, tv));
        }
        (Feature::Map(p), Feature::Map(t)) => {
            assert_eq!(p.dim(), t.dim(), "predictions and targets must match");
            Zip::from(p).and(t).for_each(|&pv, &tv| f(pv, tv));
        }
        _ => panic!("predictions and targets must have the same feature kind"),
    }
}

fn map_pair(predictions: &Feature, targets: &Feature, f: impl Fn(f32, f32) -> f32) -> Feature {
    match (predictions, targets) {
        (Feature::Flat(p), Feature::Flat(t)) => {
            assert_eq!(p.dim(), t.dim(), "predictions and targets must match");
            let mut out = p.clone();
            out.zip_mut_with(t, |pv, &tv| *pv = f(*pv, tv));
            Feature::Flat(out)
        }
        (Feature::Map(p), Feature::Map(t)) => {
            assert_eq!(p.dim(), t.dim(), "predictions and targets must match");
            let mut out = p.clone();
            out.zip_mut_with(t, |pv, &tv| *pv = f(*pv, tv));
            Feature::Map(out)
        }
        _ => panic!("predictions and targets must have the same feature kind"),
    }
}

/// Mean squared error: `mean((pred - target)^2)`.
pub struct MseLoss;

impl LossFn for MseLoss {
    fn loss(&self, predictions: &Feature, targets: &Feature) -> f32 {
        let mut sum = 0.0;
        for_each_pair(predictions, targets, |p, t| sum += (p - t) * (p - t));
        sum / predictions.len() as f32
    }

    fn grad(&self, predictions: &Feature, targets: &Feature) -> Feature {
        let n = predictions.len() as f32;
        map_pair(predictions, targets, move |p, t| 2.0 * (p - t) / n)
    }

    fn name(&self) -> &'static str {
        "mse"
    }
}

/// Mean absolute error: `mean(|pred - target|)`. The regression loss used by
/// the surrogate fits.
pub struct MaeLoss;

impl LossFn for MaeLoss {
    fn loss(&self, predictions: &Feature, targets: &Feature) -> f32 {
        let mut sum = 0.0;
        for_each_pair(predictions, targets, |p, t| sum += (p - t).abs());
        sum / predictions.len() as f32
    }

    fn grad(&self, predictions: &Feature, targets: &Feature) -> Feature {
        let n = predictions.len() as f32;
        map_pair(predictions, targets, move |p, t| {
            let d = p - t;
            if d == 0.0 {
                0.0
            } else {
                d.signum() / n
            }
        })
    }

    fn name(&self) -> &'static str {
        "mae"
    }
}

/// Cross-entropy over probability outputs (e.g. a softmax classifier head)
/// against one-hot targets: `-mean_batch(sum(target * ln(pred)))`.
pub struct CrossEntropyLoss;

const PROB_FLOOR: f32 = 1e-7;

impl LossFn for CrossEntropyLoss {
    fn loss(&self, predictions: &Feature, targets: &Feature) -> f32 {
        let batch = predictions.batch() as f32;
        let mut sum = 0.0;
        for_each_pair(predictions, targets, |p, t| {
            if t != 0.0 {
                sum -= t * p.max(PROB_FLOOR).ln();
            }
        });
        sum / batch
    }

    fn grad(&self, predictions: &Feature, targets: &Feature) -> Feature {
        let batch = predictions.batch() as f32;
        map_pair(predictions, targets, move |p, t| {
            if t != 0.0 {
                -t / (p.max(PROB_FLOOR) * batch)
            } else {
                0.0
            }
        })
    }

    fn name(&self) -> &'static str {
        "cross_entropy"
    }
}
