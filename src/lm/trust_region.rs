//! Damping schedule for the Levenberg-Marquardt algorithm.
//!
//! Lambda shrinks after every accepted step and grows after every rejected
//! one, staying within `[lambda_min, lambda_max]`.

use super::config::FitConfig;

/// Damping state of the Levenberg-Marquardt loop.
#[derive(Debug, Clone)]
pub struct TrustRegion {
    /// Current value of the damping parameter
    pub lambda: f64,

    /// Minimum allowed value for the damping parameter
    pub lambda_min: f64,

    /// Maximum allowed value for the damping parameter
    pub lambda_max: f64,

    /// Factor to increase lambda by when a step is rejected
    pub lambda_increase_factor: f64,

    /// Factor to decrease lambda by when a step is accepted
    pub lambda_decrease_factor: f64,
}

impl Default for TrustRegion {
    fn default() -> Self {
        Self::from_config(&FitConfig::default())
    }
}

impl TrustRegion {
    /// Damping schedule described by a fit configuration.
    pub fn from_config(config: &FitConfig) -> Self {
        Self {
            lambda: config
                .initial_lambda
                .clamp(config.min_lambda, config.max_lambda),
            lambda_min: config.min_lambda,
            lambda_max: config.max_lambda,
            lambda_increase_factor: config.lambda_up_factor,
            lambda_decrease_factor: config.lambda_down_factor,
        }
    }

    /// Relax damping after an accepted step.
    pub fn accept(&mut self) {
        self.lambda = (self.lambda * self.lambda_decrease_factor).max(self.lambda_min);
    }

    /// Tighten damping after a rejected step.
    ///
    /// Returns `false` when lambda was already at its ceiling, meaning no
    /// further increase is possible.
    pub fn reject(&mut self) -> bool {
        if self.lambda >= self.lambda_max {
            return false;
        }
        self.lambda = (self.lambda * self.lambda_increase_factor).min(self.lambda_max);
        true
    }

    /// Ratio of actual to predicted cost reduction, for diagnostics.
    ///
    /// # Arguments
    ///
    /// * `current_cost` - The cost before the step
    /// * `new_cost` - The cost after the step
    /// * `predicted_reduction` - The reduction predicted by the linear model
    pub fn gain_ratio(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;

        if predicted_reduction.abs() < 1e-300 {
            if actual_reduction.abs() < 1e-300 {
                1.0
            } else {
                0.0
            }
        } else {
            actual_reduction / predicted_reduction
        }
    }
}
