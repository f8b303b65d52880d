//! Singular value decomposition
//!
//! One-sided Jacobi in f64: rotations orthogonalize column pairs until all
//! mutual inner products vanish, after which the column norms are the
//! singular values. Exact (to rounding) at full rank, which the closed-form
//! dense factorization relies on.

use ndarray::{Array1, Array2};

const MAX_SWEEPS: usize = 100;
const TOLERANCE: f64 = 1e-12;

/// Compute the SVD of `a` `(m, n)`.
///
/// Returns `(u, s, vt)` with `u` `(m, r)`, `s` descending `(r)`, `vt`
/// `(r, n)` and `r = min(m, n)`, such that `a ≈ u · diag(s) · vt`.
pub fn svd(a: &Array2<f32>) -> (Array2<f32>, Array1<f32>, Array2<f32>) {
    let (m, n) = a.dim();
    if m >= n {
        let (u, s, vt) = jacobi(&a.mapv(f64::from));
        (
            u.mapv(|v| v as f32),
            Array1::from_iter(s.iter().map(|&v| v as f32)),
            vt.mapv(|v| v as f32),
        )
    } else {
        // svd(A^T) = (V, S, U^T); swap the factors back.
        let (u, s, vt) = jacobi(&a.t().to_owned().mapv(f64::from));
        (
            vt.t().to_owned().mapv(|v| v as f32),
            Array1::from_iter(s.iter().map(|&v| v as f32)),
            u.t().to_owned().mapv(|v| v as f32),
        )
    }
}

/// Truncate the SVD of `w` to `units` singular values, returning the inserted
/// factor `u_k` `(m, units)`, the replacement factor
/// `n_k = diag(s_k) · vt_k` `(units, n)`, and the L2 reconstruction loss
/// `0.5 * sum((w - u_k · n_k)^2)`.
pub fn truncated_factors(w: &Array2<f32>, units: usize) -> (Array2<f32>, Array2<f32>, f32) {
    let (u, s, vt) = svd(w);
    let k = units.min(s.len());
    let u_k = u.slice(ndarray::s![.., ..k]).to_owned();
    let mut n_k = vt.slice(ndarray::s![..k, ..]).to_owned();
    for (mut row, &sv) in n_k.outer_iter_mut().zip(s.iter().take(k)) {
        row.mapv_inplace(|v| v * sv);
    }
    let recon = u_k.dot(&n_k);
    let loss = w
        .iter()
        .zip(recon.iter())
        .map(|(&a, &b)| {
            let d = f64::from(a) - f64::from(b);
            d * d
        })
        .sum::<f64>()
        * 0.5;
    (u_k, n_k, loss as f32)
}

/// One-sided Jacobi for `m >= n`.
fn jacobi(a: &Array2<f64>) -> (Array2<f64>, Vec<f64>, Array2<f64>) {
    let (m, n) = a.dim();
    let mut b = a.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n.saturating_sub(1) {
            for q in p + 1..n {
                let mut alpha = 0.0;
                let mut beta = 0.0;
                let mut gamma = 0.0;
                for i in 0..m {
                    let bp = b[[i, p]];
                    let bq = b[[i, q]];
                    alpha += bp * bp;
                    beta += bq * bq;
                    gamma += bp * bq;
                }
                if gamma.abs() <= TOLERANCE * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                for i in 0..m {
                    let bp = b[[i, p]];
                    let bq = b[[i, q]];
                    b[[i, p]] = c * bp - s * bq;
                    b[[i, q]] = s * bp + c * bq;
                }
                for i in 0..n {
                    let vp = v[[i, p]];
                    let vq = v[[i, q]];
                    v[[i, p]] = c * vp - s * vq;
                    v[[i, q]] = s * vp + c * vq;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    // Column norms are the singular values; order them descending.
    let mut norms: Vec<(usize, f64)> = (0..n)
        .map(|j| {
            let norm = (0..m).map(|i| b[[i, j]] * b[[i, j]]).sum::<f64>().sqrt();
            (j, norm)
        })
        .collect();
    norms.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("norms are finite"));

    let mut u = Array2::<f64>::zeros((m, n));
    let mut s = Vec::with_capacity(n);
    let mut vt = Array2::<f64>::zeros((n, n));
    for (out_j, &(j, norm)) in norms.iter().enumerate() {
        s.push(norm);
        if norm > 0.0 {
            for i in 0..m {
                u[[i, out_j]] = b[[i, j]] / norm;
            }
        }
        for i in 0..n {
            vt[[out_j, i]] = v[[i, j]];
        }
    }
    (u, s, vt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_matrix(m: usize, n: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        crate::init::random_normal((m, n), &mut rng)
    }

    fn reconstruct(u: &Array2<f32>, s: &Array1<f32>, vt: &Array2<f32>) -> Array2<f32> {
        let mut sv = vt.clone();
        for (mut row, &sval) in sv.outer_iter_mut().zip(s.iter()) {
            row.mapv_inplace(|v| v * sval);
        }
        u.dot(&sv)
    }

    #[test]
    fn test_diagonal_matrix() {
        let a = arr2(&[[3.0, 0.0], [0.0, 2.0]]);
        let (u, s, vt) = svd(&a);
        assert_abs_diff_eq!(s[0], 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(s[1], 2.0, epsilon = 1e-5);
        let recon = reconstruct(&u, &s, &vt);
        for (a, b) in a.iter().zip(recon.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_reconstruction_tall_and_wide() {
        for (m, n) in [(8, 5), (5, 8), (6, 6)] {
            let a = random_matrix(m, n, 42);
            let (u, s, vt) = svd(&a);
            assert_eq!(u.dim(), (m, m.min(n)));
            assert_eq!(vt.dim(), (m.min(n), n));
            let recon = reconstruct(&u, &s, &vt);
            for (av, rv) in a.iter().zip(recon.iter()) {
                assert_abs_diff_eq!(av, rv, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_singular_values_descending_and_nonnegative() {
        let a = random_matrix(10, 7, 7);
        let (_, s, _) = svd(&a);
        for pair in s.as_slice().unwrap().windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert!(s.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_full_rank_truncation_is_lossless() {
        let a = random_matrix(8, 8, 3);
        let (_, _, loss) = truncated_factors(&a, 8);
        assert!(loss < 1e-8, "full-rank loss was {loss}");
    }

    #[test]
    fn test_truncation_loss_decreases_with_rank() {
        let a = random_matrix(8, 8, 3);
        let (_, _, loss_2) = truncated_factors(&a, 2);
        let (_, _, loss_6) = truncated_factors(&a, 6);
        assert!(loss_6 <= loss_2);
    }

    #[test]
    fn test_truncated_shapes() {
        let a = random_matrix(8, 6, 5);
        let (u_k, n_k, _) = truncated_factors(&a, 3);
        assert_eq!(u_k.dim(), (8, 3));
        assert_eq!(n_k.dim(), (3, 6));
    }
}
