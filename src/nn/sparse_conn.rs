//! Convolution with a binary channel-to-filter connectivity mask
//!
//! Each `(filter, channel)` pair is either connected or not; the kernel slice
//! for a disconnected pair is excluded from the convolution and receives no
//! gradient. Connections are activated progressively by an epoch hook during
//! sparsification training.

use super::conv::{activate_map, backprop_map, conv2d_backward, conv2d_forward};
use super::{Activation, FeatureShape, Padding};
use crate::error::{CompressError, Result};
use ndarray::{Array1, Array2, Array4};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Stride-1 convolution whose channel-to-filter connections are gated by a
/// binary mask of shape `(filters, channels)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseConnConv2d {
    pub(crate) name: String,
    pub(crate) filters: usize,
    pub(crate) kernel_size: (usize, usize),
    pub(crate) padding: Padding,
    pub(crate) activation: Activation,
    /// `(kh, kw, channels, filters)`
    pub(crate) kernel: Array4<f32>,
    pub(crate) bias: Array1<f32>,
    /// `(filters, channels)`, entries in {0, 1}
    pub(crate) connections: Array2<u8>,
}

impl SparseConnConv2d {
    /// Build from an existing convolution's weights and a connection mask.
    pub fn from_weights(
        name: impl Into<String>,
        kernel: Array4<f32>,
        bias: Array1<f32>,
        connections: Array2<u8>,
        activation: Activation,
        padding: Padding,
    ) -> Self {
        let (kh, kw, _, filters) = kernel.dim();
        Self {
            name: name.into(),
            filters,
            kernel_size: (kh, kw),
            padding,
            activation,
            kernel,
            bias,
            connections,
        }
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filter count.
    pub fn filters(&self) -> usize {
        self.filters
    }

    /// The connection mask `(filters, channels)`.
    pub fn connections(&self) -> &Array2<u8> {
        &self.connections
    }

    /// Replace the connection mask.
    pub fn set_connections(&mut self, connections: Array2<u8>) {
        self.connections = connections;
    }

    /// Number of active connections.
    pub fn active_connections(&self) -> usize {
        self.connections.iter().filter(|&&v| v != 0).count()
    }

    /// Total `(filter, channel)` pairs.
    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    /// Fraction of connections currently active.
    pub fn active_fraction(&self) -> f32 {
        self.active_connections() as f32 / self.total_connections() as f32
    }

    /// Activate up to `count` randomly chosen inactive connections. Returns
    /// how many were activated.
    pub fn add_random_connections(&mut self, count: usize, rng: &mut impl Rng) -> usize {
        let mut inactive: Vec<(usize, usize)> = self
            .connections
            .indexed_iter()
            .filter(|(_, &v)| v == 0)
            .map(|(idx, _)| idx)
            .collect();
        inactive.shuffle(rng);
        let take = count.min(inactive.len());
        for &(f, c) in inactive.iter().take(take) {
            self.connections[[f, c]] = 1;
        }
        take
    }

    fn masked_kernel(&self) -> Array4<f32> {
        let mut masked = self.kernel.clone();
        let (kh, kw, channels, filters) = masked.dim();
        for f in 0..filters {
            for c in 0..channels {
                if self.connections[[f, c]] == 0 {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            masked[[ky, kx, c, f]] = 0.0;
                        }
                    }
                }
            }
        }
        masked
    }

    pub(crate) fn build(&mut self, input: &FeatureShape) -> Result<FeatureShape> {
        let (h, w, c) = match *input {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => (height, width, channels),
            other => {
                return Err(CompressError::ShapeMismatch {
                    layer: self.name.clone(),
                    expected: "a feature map".into(),
                    actual: other.to_string(),
                })
            }
        };
        if self.kernel.dim().2 != c {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("{} input channels", self.kernel.dim().2),
                actual: input.to_string(),
            });
        }
        if self.connections.dim() != (self.filters, c) {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("connection mask ({}, {c})", self.filters),
                actual: format!(
                    "connection mask ({}, {})",
                    self.connections.dim().0,
                    self.connections.dim().1
                ),
            });
        }
        let (kh, kw) = self.kernel_size;
        if h < kh || w < kw {
            return Err(CompressError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("spatial extent >= ({kh}, {kw})"),
                actual: input.to_string(),
            });
        }
        Ok(FeatureShape::map(
            self.padding.out_extent(h, kh),
            self.padding.out_extent(w, kw),
            self.filters,
        ))
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let masked = self.masked_kernel();
        let mut z = conv2d_forward(x, &masked, Some(&self.bias), self.padding);
        activate_map(self.activation, &mut z);
        z
    }

    pub(crate) fn backward(
        &self,
        x: &Array4<f32>,
        grad_out: &Array4<f32>,
    ) -> (Vec<Array1<f32>>, Array4<f32>) {
        let masked = self.masked_kernel();
        let z = conv2d_forward(x, &masked, Some(&self.bias), self.padding);
        let grad_z = backprop_map(self.activation, &z, grad_out);
        let (mut gk, gb, gx) = conv2d_backward(x, &masked, self.padding, &grad_z);

        // Gradients only flow into active connections.
        let (kh, kw, channels, filters) = gk.dim();
        for f in 0..filters {
            for c in 0..channels {
                if self.connections[[f, c]] == 0 {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            gk[[ky, kx, c, f]] = 0.0;
                        }
                    }
                }
            }
        }
        (vec![Array1::from_iter(gk.iter().copied()), gb], gx)
    }

    pub(crate) fn params(&self) -> Vec<&[f32]> {
        vec![
            self.kernel.as_slice().expect("contiguous"),
            self.bias.as_slice().expect("contiguous"),
        ]
    }

    pub(crate) fn params_mut(&mut self) -> Vec<&mut [f32]> {
        vec![
            self.kernel.as_slice_mut().expect("contiguous"),
            self.bias.as_slice_mut().expect("contiguous"),
        ]
    }

    pub(crate) fn trainable_weight_count(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }
}
