//! # Parameter uncertainties
//!
//! Covariance estimates from the Gauss-Newton Hessian `JᵀJ` at a solution.
//! [`covariance`] scales `(JᵀJ)⁻¹` by the reduced chi-square of the fit;
//! [`crb`] gives the Cramér-Rao bound when the pixel noise is known.

use nalgebra::DMatrix;
use ndarray::Array2;
use std::collections::BTreeMap;

use crate::error::{ReconError, Result};

/// Estimate the parameter covariance from a fit.
///
/// For a least-squares fit the covariance is estimated as
///   `covar = redchi · inv(JᵀJ)`
/// with `redchi = cost / (N − n)` for `N` data points and `n` parameters.
/// A rank-deficient `JᵀJ` is inverted with the pseudo-inverse.
///
/// # Arguments
///
/// * `jtj` - `JᵀJ` of the weighted Jacobian at the solution
/// * `data_cost` - Weighted sum of squared residuals at the solution
/// * `data_points` - Number of pixels that contribute to the cost
pub fn covariance(jtj: &Array2<f64>, data_cost: f64, data_points: usize) -> Result<Array2<f64>> {
    let n = jtj.nrows();
    if data_points <= n {
        return Err(ReconError::InvalidInput(format!(
            "{} data points cannot constrain {} parameters",
            data_points, n
        )));
    }
    let redchi = data_cost / (data_points - n) as f64;
    Ok(invert(jtj)? * redchi)
}

/// Cramér-Rao lower bound on the parameter covariance for pixel noise `sigma`.
///
/// `jtj` must come from a Jacobian weighted the same way as the cost; with
/// unit weights the bound is `σ² · inv(JᵀJ)`.
pub fn crb(jtj: &Array2<f64>, sigma: f64) -> Result<Array2<f64>> {
    if !(sigma > 0.0 && sigma.is_finite()) {
        return Err(ReconError::InvalidInput(format!(
            "Noise level must be positive, got {}",
            sigma
        )));
    }
    Ok(invert(jtj)? * (sigma * sigma))
}

/// Square roots of the covariance diagonal, keyed by parameter name.
pub fn standard_errors(names: &[String], covariance: &Array2<f64>) -> BTreeMap<String, f64> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), covariance[[i, i]].max(0.0).sqrt()))
        .collect()
}

/// Calculate the correlation matrix from a covariance matrix.
///
/// Entries with a zero variance on either side are reported as zero.
pub fn correlation(covariance: &Array2<f64>) -> Array2<f64> {
    let n = covariance.nrows();
    Array2::from_shape_fn((n, n), |(i, j)| {
        let denom = (covariance[[i, i]] * covariance[[j, j]]).sqrt();
        if denom > 0.0 {
            covariance[[i, j]] / denom
        } else {
            0.0
        }
    })
}

fn invert(jtj: &Array2<f64>) -> Result<Array2<f64>> {
    let n = jtj.nrows();
    if jtj.ncols() != n {
        return Err(ReconError::ShapeMismatch(format!(
            "JᵀJ must be square, got {:?}",
            jtj.dim()
        )));
    }
    let m = DMatrix::from_fn(n, n, |i, j| jtj[[i, j]]);
    let inverse = match m.clone().cholesky() {
        Some(cholesky) => cholesky.inverse(),
        None => {
            let eps = m.amax() * n as f64 * f64::EPSILON;
            m.pseudo_inverse(eps)
                .map_err(|e| ReconError::SingularSystem(e.to_string()))?
        }
    };
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(ReconError::SingularSystem(
            "JᵀJ inverse is not finite".to_string(),
        ));
    }
    Ok(Array2::from_shape_fn((n, n), |(i, j)| inverse[(i, j)]))
}
