//! Configuration options for the Levenberg-Marquardt fit.
//!
//! This module defines the tolerances, damping schedule, Jacobian strategy
//! and regularization used by [`LevenbergMarquardt`](super::LevenbergMarquardt).
//! Configurations serialize to JSON so a fit can be reproduced from a file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cost::Regularization;
use crate::error::{ReconError, Result};

/// Method for calculating the Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum JacobianMethod {
    /// Forward differences, one scratch render of the affected region per
    /// parameter
    #[default]
    FiniteDifference,

    /// Closed-form component derivatives where available, finite differences
    /// otherwise
    Analytic,

    /// A user-supplied Jacobian function (see
    /// [`LevenbergMarquardt::with_jacobian_fn`](super::LevenbergMarquardt::with_jacobian_fn))
    Custom,
}

/// Scaling matrix `D` in the damped normal equations `(JᵀJ + λD)δ = Jᵀr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DampingScaling {
    /// `D = diag(JᵀJ)` (Marquardt), invariant to parameter units
    #[default]
    Marquardt,

    /// `D = I` (Levenberg)
    Identity,
}

/// Configuration options for the Levenberg-Marquardt fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Maximum number of accepted iterations. Default: 100
    pub max_iterations: usize,

    /// Relative cost-decrease tolerance. Default: 1e-10
    pub ftol: f64,

    /// Number of consecutive accepted steps below `ftol` needed to converge.
    /// Default: 2
    pub run_length: usize,

    /// Relative step-size tolerance. Default: 1e-9
    pub xtol: f64,

    /// Tolerance on the largest gradient component. Default: 0 (disabled)
    pub gtol: f64,

    /// Initial value for the damping parameter. Default: 1e-3
    pub initial_lambda: f64,

    /// Factor by which to increase lambda after a rejected step. Default: 10.0
    pub lambda_up_factor: f64,

    /// Factor by which to decrease lambda after an accepted step. Default: 0.1
    pub lambda_down_factor: f64,

    /// Minimum value for lambda. Default: 1e-12
    pub min_lambda: f64,

    /// Maximum value for lambda. Default: 1e12
    pub max_lambda: f64,

    /// Consecutive rejected steps tolerated within one iteration. Default: 12
    pub max_rejections: usize,

    /// Relative finite-difference step. Default: 1e-6
    pub fd_step: f64,

    /// Jacobian strategy. Default: FiniteDifference
    pub jacobian: JacobianMethod,

    /// Damping scaling. Default: Marquardt
    pub damping: DampingScaling,

    /// Penalty added to the data cost. Default: None
    pub regularization: Regularization,

    /// Compute Jacobian columns concurrently. Default: true
    pub parallel: bool,

    /// Wall-clock limit checked between iterations. Default: none
    pub time_limit: Option<Duration>,

    /// Re-render the full frame every this many accepted iterations to clear
    /// accumulated patch drift (0 disables). Default: 0
    pub refresh_every: usize,

    /// Estimate parameter uncertainties at the solution. Default: true
    pub compute_uncertainties: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            run_length: 2,
            xtol: 1e-9,
            gtol: 0.0,
            initial_lambda: 1e-3,
            lambda_up_factor: 10.0,
            lambda_down_factor: 0.1,
            min_lambda: 1e-12,
            max_lambda: 1e12,
            max_rejections: 12,
            fd_step: 1e-6,
            jacobian: JacobianMethod::default(),
            damping: DampingScaling::default(),
            regularization: Regularization::None,
            parallel: true,
            time_limit: None,
            refresh_every: 0,
            compute_uncertainties: true,
        }
    }
}

impl FitConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// use reconfit_rs::lm::FitConfig;
    ///
    /// let config = FitConfig::from_json(r#"{"max_iterations": 20, "ftol": 1e-6}"#).unwrap();
    /// assert_eq!(config.max_iterations, 20);
    /// assert_eq!(config.lambda_up_factor, 10.0);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that the settings describe a usable damping schedule.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ftol", self.ftol),
            ("xtol", self.xtol),
            ("initial_lambda", self.initial_lambda),
            ("min_lambda", self.min_lambda),
            ("max_lambda", self.max_lambda),
            ("fd_step", self.fd_step),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ReconError::InvalidInput(format!(
                    "{} must be finite and positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.gtol >= 0.0) {
            return Err(ReconError::InvalidInput(format!(
                "gtol must be non-negative, got {}",
                self.gtol
            )));
        }
        if !(self.lambda_up_factor > 1.0) {
            return Err(ReconError::InvalidInput(format!(
                "lambda_up_factor must exceed 1, got {}",
                self.lambda_up_factor
            )));
        }
        if !(self.lambda_down_factor > 0.0 && self.lambda_down_factor < 1.0) {
            return Err(ReconError::InvalidInput(format!(
                "lambda_down_factor must lie in (0, 1), got {}",
                self.lambda_down_factor
            )));
        }
        if self.min_lambda > self.max_lambda {
            return Err(ReconError::InvalidInput(format!(
                "min_lambda {} exceeds max_lambda {}",
                self.min_lambda, self.max_lambda
            )));
        }
        if self.run_length == 0 || self.max_rejections == 0 {
            return Err(ReconError::InvalidInput(
                "run_length and max_rejections must be at least 1".to_string(),
            ));
        }
        self.regularization.validate()
    }
}
