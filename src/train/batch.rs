//! Batches and the re-iterable in-memory dataset

use crate::nn::Feature;

/// A training batch containing inputs and targets.
#[derive(Clone)]
pub struct Batch {
    /// Input features.
    pub inputs: Feature,
    /// Target labels/values.
    pub targets: Feature,
}

impl Batch {
    /// Create a new batch.
    pub fn new(inputs: Feature, targets: Feature) -> Self {
        Self { inputs, targets }
    }

    /// Number of examples in the batch.
    pub fn size(&self) -> usize {
        self.inputs.batch()
    }
}

/// A finite sequence of batches supporting repeated full passes.
///
/// Compression fits and fine-tuning iterate the dataset once per epoch; the
/// dataset must therefore be re-iterable without exhaustion, which an owned
/// batch list gives for free.
#[derive(Clone, Default)]
pub struct Dataset {
    batches: Vec<Batch>,
}

impl Dataset {
    /// Dataset over an owned batch list.
    pub fn from_batches(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    /// Iterate one full pass over the batches.
    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether the dataset holds no batches.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn batch(n: usize) -> Batch {
        Batch::new(
            Feature::Flat(Array2::zeros((n, 3))),
            Feature::Flat(Array2::zeros((n, 2))),
        )
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(batch(4).size(), 4);
    }

    #[test]
    fn test_dataset_is_reiterable() {
        let ds = Dataset::from_batches(vec![batch(2), batch(2)]);
        assert_eq!(ds.len(), 2);
        let first_pass = ds.iter().count();
        let second_pass = ds.iter().count();
        assert_eq!(first_pass, second_pass);
    }
}
