//! The layer chain

use super::{Feature, FeatureShape, Layer};
use crate::error::{CompressError, Result};
use serde::{Deserialize, Serialize};

/// An ordered chain of named layers with a fixed input shape.
///
/// Construction *builds* the chain: every layer materializes absent weights
/// against the shape flowing into it and validates weights it already has.
/// Rebuilding after structural edits therefore re-executes the graph and
/// surfaces any shape conflict as [`CompressError::ShapeMismatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    input_shape: FeatureShape,
    layers: Vec<Layer>,
    output_shape: FeatureShape,
}

impl Model {
    /// Build a model from an input shape and a layer chain.
    pub fn new(input_shape: FeatureShape, mut layers: Vec<Layer>) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let mut shape = input_shape;
        for layer in &mut layers {
            shape = layer.build(&shape, &mut rng)?;
        }
        Ok(Self {
            input_shape,
            layers,
            output_shape: shape,
        })
    }

    /// Input shape.
    pub fn input_shape(&self) -> FeatureShape {
        self.input_shape
    }

    /// Output shape of the terminal layer.
    pub fn output_shape(&self) -> FeatureShape {
        self.output_shape
    }

    /// The layer chain.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Layer at `index`.
    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    /// Mutable layer at `index`. Weight edits through this accessor are
    /// in-place; they do not re-run shape inference.
    pub fn layer_mut(&mut self, index: usize) -> &mut Layer {
        &mut self.layers[index]
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Consume the model, returning its layers.
    pub fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    /// Index of the first layer with the given name.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.name() == name)
            .ok_or_else(|| CompressError::LayerNotFound {
                name: name.to_string(),
            })
    }

    /// Sum of trainable parameter counts across all layers.
    pub fn trainable_weight_count(&self) -> usize {
        self.layers.iter().map(Layer::trainable_weight_count).sum()
    }

    /// Feed `x` through the whole chain.
    pub fn forward(&self, x: &Feature) -> Result<Feature> {
        let mut out = x.clone();
        for layer in &self.layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    /// Feed `x` through the chain, keeping the input to every layer.
    /// Returns `len() + 1` features; the last one is the model output.
    pub fn forward_trace(&self, x: &Feature) -> Result<Vec<Feature>> {
        let mut trace = Vec::with_capacity(self.layers.len() + 1);
        trace.push(x.clone());
        for layer in &self.layers {
            let next = layer.forward(trace.last().expect("trace is non-empty"))?;
            trace.push(next);
        }
        Ok(trace)
    }

    /// Clone of the sub-chain `layers[..end]` as its own model, sharing this
    /// model's input shape. Used to capture the tensors flowing into and out
    /// of a compression target.
    pub fn prefix(&self, end: usize) -> Result<Model> {
        Model::new(self.input_shape, self.layers[..end].to_vec())
    }

    /// Serialize the model (shapes, configs, and weights) to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize a model previously written by [`Model::to_json`].
    pub fn from_json(json: &str) -> serde_json::Result<Model> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Activation, Dense};
    use ndarray::{arr2, Array2};

    fn two_layer_model() -> Model {
        Model::new(
            FeatureShape::flat(2),
            vec![
                Dense::with_weights("d1", arr2(&[[1.0, 0.0], [0.0, 1.0]]), None, Activation::Linear)
                    .into(),
                Dense::with_weights("d2", arr2(&[[2.0], [3.0]]), None, Activation::Linear).into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_forward_chain() {
        let model = two_layer_model();
        let y = model
            .forward(&Feature::Flat(arr2(&[[1.0, 1.0]])))
            .unwrap();
        assert_eq!(y.as_flat().unwrap()[[0, 0]], 5.0);
        assert_eq!(model.output_shape(), FeatureShape::flat(1));
    }

    #[test]
    fn test_index_of_and_missing_layer() {
        let model = two_layer_model();
        assert_eq!(model.index_of("d2").unwrap(), 1);
        assert!(matches!(
            model.index_of("nope"),
            Err(CompressError::LayerNotFound { .. })
        ));
    }

    #[test]
    fn test_forward_trace_lengths() {
        let model = two_layer_model();
        let trace = model
            .forward_trace(&Feature::Flat(Array2::zeros((3, 2))))
            .unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[2].as_flat().unwrap().dim(), (3, 1));
    }

    #[test]
    fn test_shape_mismatch_on_bad_chain() {
        let result = Model::new(
            FeatureShape::flat(3),
            vec![Dense::with_weights(
                "d1",
                arr2(&[[1.0], [1.0]]),
                None,
                Activation::Linear,
            )
            .into()],
        );
        assert!(matches!(result, Err(CompressError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_json_round_trip() {
        let model = two_layer_model();
        let json = model.to_json().unwrap();
        let restored = Model::from_json(&json).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.index_of("d1").unwrap(), 0);
        let y = restored
            .forward(&Feature::Flat(arr2(&[[1.0, 1.0]])))
            .unwrap();
        assert_eq!(y.as_flat().unwrap()[[0, 0]], 5.0);
    }

    #[test]
    fn test_trainable_weight_count() {
        let model = two_layer_model();
        assert_eq!(model.trainable_weight_count(), 4 + 2);
    }
}
