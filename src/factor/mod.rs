//! Numeric factorization: SVD and the gradient-descent matrix fits

mod low_rank;
mod pqs;
mod svd;

pub use low_rank::{fit_binary_dict, fit_factor_pair, FactorFit};
pub use pqs::{fit_pqs, PqsFactors};
pub use svd::{svd, truncated_factors};
