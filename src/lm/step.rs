//! Step calculation for the Levenberg-Marquardt algorithm.
//!
//! The step solves the damped normal equations
//! `(JᵀJ + ½·diag(h) + λD) δ = Jᵀr − ½·g`, where `g` and `h` are the gradient
//! and Hessian diagonal of the regularization term and `D` is the damping
//! scaling. Cholesky is tried first and SVD is the fallback for
//! semi-definite systems.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};

use super::config::DampingScaling;
use crate::error::{ReconError, Result};

/// Floor applied to the Marquardt scaling so a zero column still gets damped.
const MIN_SCALE: f64 = 1e-12;

/// Result of a Levenberg-Marquardt step calculation.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// The calculated step vector
    pub step: Array1<f64>,

    /// The reduction in cost predicted by the quadratic model
    pub predicted_reduction: f64,

    /// The damping parameter used to calculate the step
    pub lambda: f64,
}

/// Linear system of one iteration, before damping.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// `JᵀJ` plus half the regularization curvature
    pub hessian: Array2<f64>,
    /// `Jᵀr` minus half the regularization gradient
    pub gradient: Array1<f64>,
}

impl NormalEquations {
    /// Assemble the system from the data term and the regularization
    /// derivatives.
    ///
    /// # Arguments
    ///
    /// * `jtj` - `JᵀJ` for the weighted Jacobian
    /// * `jtr` - `Jᵀr` for the weighted residual
    /// * `reg_gradient` - Gradient of the regularization term
    /// * `reg_curvature` - Hessian diagonal of the regularization term
    pub fn new(
        jtj: Array2<f64>,
        jtr: Array1<f64>,
        reg_gradient: &Array1<f64>,
        reg_curvature: &Array1<f64>,
    ) -> Result<Self> {
        let n = jtr.len();
        if jtj.dim() != (n, n) || reg_gradient.len() != n || reg_curvature.len() != n {
            return Err(ReconError::ShapeMismatch(format!(
                "Normal equations of size {} with JᵀJ {:?}",
                n,
                jtj.dim()
            )));
        }
        let mut hessian = jtj;
        for i in 0..n {
            hessian[[i, i]] += 0.5 * reg_curvature[i];
        }
        let gradient = jtr - &(reg_gradient * 0.5);
        Ok(Self { hessian, gradient })
    }

    /// Number of unknowns.
    pub fn len(&self) -> usize {
        self.gradient.len()
    }

    /// Whether the system has no unknowns.
    pub fn is_empty(&self) -> bool {
        self.gradient.is_empty()
    }

    /// Largest absolute component of the descent direction.
    pub fn max_gradient(&self) -> f64 {
        self.gradient.iter().fold(0.0, |acc: f64, g| acc.max(g.abs()))
    }
}

/// Handles step calculation for the Levenberg-Marquardt algorithm.
pub struct LmStep;

impl LmStep {
    /// Calculates the damped step.
    ///
    /// # Arguments
    ///
    /// * `system` - The undamped normal equations
    /// * `lambda` - The damping parameter
    /// * `scaling` - How the damping term is scaled
    ///
    /// # Returns
    ///
    /// * The step, or `SingularSystem` if neither factorization yields a
    ///   finite solution
    pub fn calculate_step(
        system: &NormalEquations,
        lambda: f64,
        scaling: DampingScaling,
    ) -> Result<StepResult> {
        let n = system.len();
        let mut a = DMatrix::from_fn(n, n, |i, j| system.hessian[[i, j]]);
        for i in 0..n {
            let scale = match scaling {
                DampingScaling::Marquardt => system.hessian[[i, i]].max(MIN_SCALE),
                DampingScaling::Identity => 1.0,
            };
            a[(i, i)] += lambda * scale;
        }
        let b = DVector::from_iterator(n, system.gradient.iter().copied());

        let solution = match a.clone().cholesky() {
            Some(cholesky) => cholesky.solve(&b),
            None => Self::solve_svd(a, &b)?,
        };
        if solution.iter().any(|v| !v.is_finite()) {
            return Err(ReconError::SingularSystem(format!(
                "non-finite step for lambda {:.3e}",
                lambda
            )));
        }

        let step = Array1::from_iter(solution.iter().copied());
        let predicted_reduction = Self::predicted_reduction(system, &step);
        Ok(StepResult {
            step,
            predicted_reduction,
            lambda,
        })
    }

    fn solve_svd(a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let n = a.nrows();
        let svd = a.svd(true, true);
        let max_singular = svd.singular_values.max();
        if !(max_singular > 0.0) {
            return Err(ReconError::SingularSystem(format!(
                "{}x{} system has no nonzero singular value",
                n, n
            )));
        }
        let eps = max_singular * n as f64 * f64::EPSILON;
        svd.solve(b, eps)
            .map_err(|e| ReconError::SingularSystem(e.to_string()))
    }

    /// Reduction predicted by the undamped quadratic model,
    /// `2·δᵀb − δᵀAδ`.
    fn predicted_reduction(system: &NormalEquations, step: &Array1<f64>) -> f64 {
        2.0 * step.dot(&system.gradient) - step.dot(&system.hessian.dot(step))
    }
}
