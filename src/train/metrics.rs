//! Evaluation metrics tracked during fine-tuning

use crate::nn::Feature;
use serde::{Deserialize, Serialize};

/// Metric computed over predictions and targets during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Fraction of rows whose argmax matches the target argmax.
    Accuracy,
}

impl Metric {
    /// Compute the metric for one batch. Only flat (classifier) outputs are
    /// meaningful; map outputs score 0.
    pub fn compute(&self, predictions: &Feature, targets: &Feature) -> f32 {
        match self {
            Metric::Accuracy => match (predictions, targets) {
                (Feature::Flat(p), Feature::Flat(t)) => {
                    let rows = p.dim().0;
                    if rows == 0 {
                        return 0.0;
                    }
                    let mut hits = 0usize;
                    for (p_row, t_row) in p.outer_iter().zip(t.outer_iter()) {
                        if argmax(p_row.iter()) == argmax(t_row.iter()) {
                            hits += 1;
                        }
                    }
                    hits as f32 / rows as f32
                }
                _ => 0.0,
            },
        }
    }

    /// Display name, matching the serialized form.
    pub fn display_name(&self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
        }
    }
}

fn argmax<'a>(values: impl Iterator<Item = &'a f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}
