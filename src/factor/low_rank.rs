//! Learned low-rank and sparse-dictionary matrix fits
//!
//! Both fits minimize the L2 distance `0.5 * ||W - L·R||^2` between the
//! target matrix and a factor product by plain gradient descent with Adam,
//! for a fixed iteration count. No stopping criterion beyond the iteration
//! count; a poor final residual is logged, never an error.

use crate::init;
use crate::nn::BinaryWeightConstraint;
use crate::optim::{Adam, Optimizer};
use ndarray::Array2;
use rand::Rng;
use tracing::debug;

/// Result of a two-factor fit.
pub struct FactorFit {
    /// Left factor `(m, units)`.
    pub left: Array2<f32>,
    /// Right factor `(units, n)`.
    pub right: Array2<f32>,
    /// Final L2 loss `0.5 * sum((target - left·right)^2)`.
    pub final_loss: f32,
}

fn l2_loss(diff: &Array2<f32>) -> f32 {
    0.5 * diff.iter().map(|d| d * d).sum::<f32>()
}

/// Fit `left (m, units) · right (units, n) ≈ target` from Gaussian starts.
pub fn fit_factor_pair(
    target: &Array2<f32>,
    units: usize,
    iterations: usize,
    rng: &mut impl Rng,
) -> FactorFit {
    let (m, n) = target.dim();
    let mut left: Array2<f32> = init::random_normal((m, units), rng);
    let mut right: Array2<f32> = init::random_normal((units, n), rng);
    let mut optimizer = Adam::default_params();
    let mut final_loss = 0.0;

    for i in 0..iterations {
        let pred = left.dot(&right);
        let residual = &pred - target;
        final_loss = l2_loss(&residual);

        let grad_left = residual.dot(&right.t());
        let grad_right = left.t().dot(&residual);
        optimizer.update(
            0,
            left.as_slice_mut().expect("contiguous"),
            grad_left.as_slice().expect("contiguous"),
        );
        optimizer.update(
            1,
            right.as_slice_mut().expect("contiguous"),
            grad_right.as_slice().expect("contiguous"),
        );
        if i % 100 == 0 {
            debug!(iteration = i, loss = final_loss, "factor fit");
        }
    }

    FactorFit {
        left,
        right,
        final_loss,
    }
}

/// Fit a Gaussian basis and a binary code, `basis (m, units) · code (units, n)
/// ≈ target`, rounding the code to {0, 1} (after a per-column norm clip)
/// after every update.
pub fn fit_binary_dict(
    target: &Array2<f32>,
    units: usize,
    iterations: usize,
    rng: &mut impl Rng,
) -> FactorFit {
    let (m, n) = target.dim();
    let mut basis: Array2<f32> = init::random_normal((m, units), rng);
    let mut code: Array2<f32> = init::random_binary((units, n), rng);
    let constraint = BinaryWeightConstraint::new(units as f32);
    let mut optimizer = Adam::default_params();
    let mut final_loss = 0.0;

    for i in 0..iterations {
        let pred = basis.dot(&code);
        let residual = &pred - target;
        final_loss = l2_loss(&residual);

        let grad_basis = residual.dot(&code.t());
        let grad_code = basis.t().dot(&residual);
        optimizer.update(
            0,
            basis.as_slice_mut().expect("contiguous"),
            grad_basis.as_slice().expect("contiguous"),
        );
        optimizer.update(
            1,
            code.as_slice_mut().expect("contiguous"),
            grad_code.as_slice().expect("contiguous"),
        );
        constraint.apply(&mut code);
        if i % 100 == 0 {
            debug!(iteration = i, loss = final_loss, "binary dictionary fit");
        }
    }

    FactorFit {
        left: basis,
        right: code,
        final_loss,
    }
}
