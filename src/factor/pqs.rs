//! Sequential P / (Q, S) fits for the structured sparse convolution
//!
//! Stage one fits a channel-mixing matrix P so that the original kernel is
//! approximated by mixing a frozen Gaussian tensor R across channels. Stage
//! two fits a spatial basis Q and a basis-to-filter map S against R itself.
//! Both stages run Adam for a fixed iteration count.

use crate::init;
use crate::optim::{Adam, Optimizer};
use ndarray::{Array2, Array3, Array4};
use rand::Rng;
use tracing::debug;

/// Fitted factors for a [`crate::nn::SparseConv2d`] layer.
pub struct PqsFactors {
    /// Channel mix `(channels, channels)`.
    pub p: Array2<f32>,
    /// Spatial bases `(channels, kh, kw, bases)`.
    pub q: Array4<f32>,
    /// Basis-to-filter map `(channels, bases, filters)`.
    pub s: Array3<f32>,
}

/// Fit P, Q and S against a convolution kernel `(kh, kw, channels, filters)`.
pub fn fit_pqs(
    kernel: &Array4<f32>,
    bases: usize,
    iterations: usize,
    rng: &mut impl Rng,
) -> PqsFactors {
    let (kh, kw, channels, filters) = kernel.dim();
    let r: Array4<f32> = init::random_normal((kh, kw, channels, filters), rng);

    // Stage one: kernel[u, v, i, j] ≈ sum_c R[u, v, c, j] * P[c, i].
    let mut p = init::identity(channels);
    let mut optimizer = Adam::default_params();
    for iter in 0..iterations {
        let mut grad_p = Array2::<f32>::zeros((channels, channels));
        let mut loss = 0.0;
        for u in 0..kh {
            for v in 0..kw {
                for i in 0..channels {
                    for j in 0..filters {
                        let mut pred = 0.0;
                        for c in 0..channels {
                            pred += r[[u, v, c, j]] * p[[c, i]];
                        }
                        let residual = pred - kernel[[u, v, i, j]];
                        loss += 0.5 * residual * residual;
                        for c in 0..channels {
                            grad_p[[c, i]] += residual * r[[u, v, c, j]];
                        }
                    }
                }
            }
        }
        optimizer.update(
            0,
            p.as_slice_mut().expect("contiguous"),
            grad_p.as_slice().expect("contiguous"),
        );
        if iter % 10 == 0 {
            debug!(iteration = iter, loss, "channel basis fit");
        }
    }

    // Stage two: R[u, v, i, j] ≈ sum_k S[i, k, j] * Q[i, u, v, k], from a
    // zero S and a Q seeded with ones on the spatial diagonal.
    let mut s = Array3::<f32>::zeros((channels, bases, filters));
    let mut q = Array4::<f32>::zeros((channels, kh, kw, bases));
    for d in 0..kh.min(kw) {
        for i in 0..channels {
            for k in 0..bases {
                q[[i, d, d, k]] = 1.0;
            }
        }
    }
    let mut optimizer = Adam::default_params();
    for iter in 0..iterations {
        let mut grad_s = Array3::<f32>::zeros(s.raw_dim());
        let mut grad_q = Array4::<f32>::zeros(q.raw_dim());
        let mut loss = 0.0;
        for u in 0..kh {
            for v in 0..kw {
                for i in 0..channels {
                    for j in 0..filters {
                        let mut pred = 0.0;
                        for k in 0..bases {
                            pred += s[[i, k, j]] * q[[i, u, v, k]];
                        }
                        let residual = pred - r[[u, v, i, j]];
                        loss += 0.5 * residual * residual;
                        for k in 0..bases {
                            grad_s[[i, k, j]] += residual * q[[i, u, v, k]];
                            grad_q[[i, u, v, k]] += residual * s[[i, k, j]];
                        }
                    }
                }
            }
        }
        optimizer.update(
            0,
            s.as_slice_mut().expect("contiguous"),
            grad_s.as_slice().expect("contiguous"),
        );
        optimizer.update(
            1,
            q.as_slice_mut().expect("contiguous"),
            grad_q.as_slice().expect("contiguous"),
        );
        if iter % 10 == 0 {
            debug!(iteration = iter, loss, "spatial factor fit");
        }
    }

    debug!(
        p_shape = ?p.dim(),
        q_shape = ?q.dim(),
        s_shape = ?s.dim(),
        "fitted P/Q/S factors"
    );
    PqsFactors { p, q, s }
}
