//! Implementation of the Levenberg-Marquardt fit loop.
//!
//! Each iteration builds the sparse Jacobian at the current parameters,
//! solves the damped normal equations, projects the step onto the bounds and
//! applies it through the state's patch path. A step is accepted when the
//! patched cost decreases; otherwise the parameters are reverted and the
//! damping is raised.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::{DampingScaling, FitConfig, JacobianMethod};
use super::convergence::{ConvergenceCriteria, ConvergenceReason, FailureReason, FitStatus};
use super::jacobian::{self, Jacobian, JacobianFn};
use super::step::{LmStep, NormalEquations};
use super::trust_region::TrustRegion;
use crate::cost::Regularization;
use crate::error::{ReconError, Result};
use crate::model::RenderStats;
use crate::state::ImageState;
use crate::uncertainty;

/// Result of a Levenberg-Marquardt fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Every model parameter after the fit, in store order
    pub parameters: Vec<(String, f64)>,

    /// Parameters that were optimized
    pub varied: Vec<String>,

    /// Cost before the first step
    pub initial_cost: f64,

    /// Cost at the solution, recomputed from a full render
    pub final_cost: f64,

    /// How the fit ended
    pub status: FitStatus,

    /// Number of accepted steps
    pub iterations_used: usize,

    /// Cost after each accepted step, starting with the initial cost
    pub cost_history: Vec<f64>,

    /// Damping parameter at termination
    pub lambda: f64,

    /// Standard errors of the varied parameters (if computed)
    pub standard_errors: Option<BTreeMap<String, f64>>,

    /// Covariance of the varied parameters in `varied` order (if computed)
    pub covariance: Option<Array2<f64>>,

    /// Renders performed during the fit
    pub renders: RenderStats,

    /// Wall-clock time spent
    pub elapsed: Duration,
}

impl FitResult {
    /// Value of a parameter after the fit.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a result written by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit Result:")?;
        writeln!(f, "  Status: {}", self.status)?;
        writeln!(f, "  Initial cost: {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final cost: {:.6e}", self.final_cost)?;
        writeln!(f, "  Iterations: {}", self.iterations_used)?;
        writeln!(f, "  Lambda: {:.3e}", self.lambda)?;
        writeln!(
            f,
            "  Renders: {} full, {} patch ({} pixels)",
            self.renders.full_renders, self.renders.patch_renders, self.renders.patched_pixels
        )?;
        writeln!(f, "  Parameters:")?;
        for name in &self.varied {
            let value = self.value(name).unwrap_or(f64::NAN);
            match self.standard_errors.as_ref().and_then(|e| e.get(name)) {
                Some(err) => writeln!(f, "    {:<16} {:>14.6e} +/- {:.3e}", name, value, err)?,
                None => writeln!(f, "    {:<16} {:>14.6e}", name, value)?,
            }
        }
        Ok(())
    }
}

/// The Levenberg-Marquardt optimizer.
#[derive(Clone, Default)]
pub struct LevenbergMarquardt {
    /// Configuration options
    config: FitConfig,

    /// Jacobian used when `config.jacobian` is `Custom`
    jacobian_fn: Option<Arc<JacobianFn>>,
}

impl fmt::Debug for LevenbergMarquardt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevenbergMarquardt")
            .field("config", &self.config)
            .field("jacobian_fn", &self.jacobian_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl LevenbergMarquardt {
    /// Create a new optimizer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new optimizer with the given configuration.
    pub fn with_config(config: FitConfig) -> Self {
        Self {
            config,
            jacobian_fn: None,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Set the maximum number of accepted iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Set the relative cost tolerance.
    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.config.ftol = ftol;
        self
    }

    /// Set the relative step tolerance.
    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.config.xtol = xtol;
        self
    }

    /// Set the gradient tolerance.
    pub fn with_gtol(mut self, gtol: f64) -> Self {
        self.config.gtol = gtol;
        self
    }

    /// Set the initial damping.
    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.config.initial_lambda = lambda;
        self
    }

    /// Set the damping scaling.
    pub fn with_damping(mut self, damping: DampingScaling) -> Self {
        self.config.damping = damping;
        self
    }

    /// Choose how the Jacobian is computed.
    pub fn with_jacobian(mut self, method: JacobianMethod) -> Self {
        self.config.jacobian = method;
        self
    }

    /// Supply a Jacobian function; switches the method to `Custom`.
    pub fn with_jacobian_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ImageState<'_>, &[String]) -> Result<Jacobian> + Send + Sync + 'static,
    {
        self.config.jacobian = JacobianMethod::Custom;
        self.jacobian_fn = Some(Arc::new(f));
        self
    }

    /// Enable or disable concurrent Jacobian columns.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Stop after a wall-clock budget.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.config.time_limit = Some(limit);
        self
    }

    /// Fit every varying parameter of the model.
    pub fn fit(&self, state: &mut ImageState<'_>) -> Result<FitResult> {
        let names = state.store().varying_names();
        self.fit_subset(state, &names)
    }

    /// Fit only `names`, holding all other parameters fixed.
    ///
    /// # Arguments
    ///
    /// * `state` - Model and data; updated in place with the best parameters
    /// * `names` - Parameters to optimize
    ///
    /// # Returns
    ///
    /// * The fit result. Numerical failures are reported in
    ///   [`FitResult::status`]; `Err` is reserved for invalid input.
    ///
    /// A regularization set in the configuration replaces the one held by
    /// the state's evaluator.
    pub fn fit_subset(&self, state: &mut ImageState<'_>, names: &[String]) -> Result<FitResult> {
        self.config.validate()?;
        self.validate_names(state, names)?;
        if self.config.regularization != Regularization::None {
            state.set_regularization(self.config.regularization.clone())?;
        }

        let start = Instant::now();
        let stats_before = state.model().stats();
        state.refresh()?;
        let initial_cost = state.cost();
        if !initial_cost.is_finite() {
            return Err(ReconError::InvalidInput(format!(
                "Initial cost is not finite ({})",
                initial_cost
            )));
        }

        let mut trust = TrustRegion::from_config(&self.config);
        let mut criteria = ConvergenceCriteria::new(
            self.config.ftol,
            self.config.xtol,
            self.config.gtol,
            self.config.run_length,
        );
        let mut history = vec![initial_cost];
        let mut iterations = 0;

        let status = loop {
            if iterations >= self.config.max_iterations {
                break FitStatus::MaxIterationsReached;
            }
            if let Some(limit) = self.config.time_limit {
                if start.elapsed() >= limit {
                    tracing::debug!(?limit, "Time limit reached");
                    break FitStatus::MaxIterationsReached;
                }
            }

            let jac = self.jacobian(state, names)?;
            let residual = state.residuals()?;
            let (reg_gradient, reg_curvature) = state
                .evaluator()
                .regularization()
                .derivatives(state.store(), names)?;
            let system =
                NormalEquations::new(jac.jtj(), jac.jtr(&residual)?, &reg_gradient, &reg_curvature)?;
            if criteria.gradient_converged(system.max_gradient()) {
                break FitStatus::Converged(ConvergenceReason::Gradient);
            }

            match self.iterate(state, names, &system, &mut trust, &mut criteria)? {
                StepOutcome::Accepted { converged } => {
                    iterations += 1;
                    if self.config.refresh_every > 0 && iterations % self.config.refresh_every == 0 {
                        let drift = state.refresh()?;
                        tracing::trace!(drift, "Periodic full render");
                    }
                    history.push(state.cost());
                    tracing::debug!(
                        iteration = iterations,
                        cost = state.cost(),
                        lambda = trust.lambda,
                        "Accepted step"
                    );
                    if converged {
                        break FitStatus::Converged(ConvergenceReason::CostTolerance);
                    }
                }
                StepOutcome::Terminated(status) => break status,
            }
        };

        state.refresh()?;
        let final_cost = state.cost();

        let (covariance, standard_errors) = if self.config.compute_uncertainties {
            self.uncertainties(state, names)
        } else {
            (None, None)
        };

        let stats_after = state.model().stats();
        let result = FitResult {
            parameters: state
                .store()
                .iter()
                .map(|p| (p.name().to_string(), p.value()))
                .collect(),
            varied: names.to_vec(),
            initial_cost,
            final_cost,
            status,
            iterations_used: iterations,
            cost_history: history,
            lambda: trust.lambda,
            standard_errors,
            covariance,
            renders: RenderStats {
                full_renders: stats_after.full_renders - stats_before.full_renders,
                patch_renders: stats_after.patch_renders - stats_before.patch_renders,
                patched_pixels: stats_after.patched_pixels - stats_before.patched_pixels,
            },
            elapsed: start.elapsed(),
        };

        match &result.status {
            FitStatus::Failed(reason) => {
                tracing::warn!(error = %reason.to_error(), iterations, "Fit failed")
            }
            status => tracing::info!(
                %status,
                iterations,
                initial_cost,
                final_cost,
                "Fit finished"
            ),
        }
        Ok(result)
    }

    /// Propose steps at increasing damping until one lowers the cost.
    fn iterate(
        &self,
        state: &mut ImageState<'_>,
        names: &[String],
        system: &NormalEquations,
        trust: &mut TrustRegion,
        criteria: &mut ConvergenceCriteria,
    ) -> Result<StepOutcome> {
        let current = state.store().get_values(names)?;
        let lower: Array1<f64> = names
            .iter()
            .map(|n| state.store().bounds(n).map(|b| b.min))
            .collect::<Result<_>>()?;
        let upper: Array1<f64> = names
            .iter()
            .map(|n| state.store().bounds(n).map(|b| b.max))
            .collect::<Result<_>>()?;
        let param_norm = current.dot(&current).sqrt();
        let cost = state.cost();

        let mut rejections = 0;
        loop {
            let step = match LmStep::calculate_step(system, trust.lambda, self.config.damping) {
                Ok(step) => Some(step),
                Err(ReconError::SingularSystem(msg)) => {
                    tracing::warn!(lambda = trust.lambda, %msg, "Singular normal equations");
                    rejections += 1;
                    if !trust.reject() || rejections >= self.config.max_rejections {
                        return Ok(StepOutcome::Terminated(FitStatus::Failed(
                            FailureReason::SingularSystem(msg),
                        )));
                    }
                    None
                }
                Err(e) => return Err(e),
            };
            let Some(step) = step else {
                continue;
            };

            let mut proposal = &current + &step.step;
            for i in 0..proposal.len() {
                proposal[i] = proposal[i].clamp(lower[i], upper[i]);
            }
            let delta = &proposal - &current;
            let step_norm = delta.dot(&delta).sqrt();
            if criteria.step_converged(step_norm, param_norm) {
                return Ok(StepOutcome::Terminated(FitStatus::Converged(
                    ConvergenceReason::StepTolerance,
                )));
            }

            let update = state.set_values(names, &proposal)?;
            if update.cost.is_finite() && update.cost < cost {
                tracing::trace!(
                    gain = TrustRegion::gain_ratio(cost, update.cost, step.predicted_reduction),
                    region = ?update.region,
                    "Step lowered the cost"
                );
                trust.accept();
                let converged = criteria.record_accepted(cost, update.cost);
                return Ok(StepOutcome::Accepted { converged });
            }

            state.set_values(names, &current)?;
            rejections += 1;
            tracing::trace!(
                lambda = trust.lambda,
                rejections,
                proposed = update.cost,
                "Rejected step"
            );
            if !trust.reject() {
                return Ok(StepOutcome::Terminated(FitStatus::Converged(
                    ConvergenceReason::DampingCeiling,
                )));
            }
            if rejections >= self.config.max_rejections {
                return Ok(StepOutcome::Terminated(FitStatus::Failed(
                    FailureReason::Stalled {
                        rejections,
                        lambda: trust.lambda,
                    },
                )));
            }
        }
    }

    fn jacobian(&self, state: &mut ImageState<'_>, names: &[String]) -> Result<Jacobian> {
        state.warm_cache()?;
        match (self.config.jacobian, &self.jacobian_fn) {
            (JacobianMethod::Custom, Some(f)) => {
                let jac = (**f)(state, names)?;
                if jac.names() != names {
                    return Err(ReconError::ShapeMismatch(format!(
                        "Custom Jacobian columns {:?} do not match parameters {:?}",
                        jac.names(),
                        names
                    )));
                }
                Ok(jac)
            }
            (method, _) => jacobian::compute(
                state,
                names,
                method,
                self.config.fd_step,
                self.config.parallel,
            ),
        }
    }

    fn uncertainties(
        &self,
        state: &mut ImageState<'_>,
        names: &[String],
    ) -> (Option<Array2<f64>>, Option<BTreeMap<String, f64>>) {
        let estimate = self.jacobian(state, names).and_then(|jac| {
            uncertainty::covariance(&jac.jtj(), state.data_cost(), state.evaluator().pixel_count())
        });
        match estimate {
            Ok(covariance) => {
                let errors = uncertainty::standard_errors(names, &covariance);
                (Some(covariance), Some(errors))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not estimate parameter uncertainties");
                (None, None)
            }
        }
    }

    fn validate_names(&self, state: &ImageState<'_>, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Err(ReconError::InvalidInput(
                "No parameters selected for fitting".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(ReconError::DuplicateParameter(name.clone()));
            }
            let param = state
                .store()
                .parameter(name)
                .ok_or_else(|| ReconError::ParameterNotFound(name.clone()))?;
            param.check(param.value())?;
        }
        if self.config.jacobian == JacobianMethod::Custom && self.jacobian_fn.is_none() {
            return Err(ReconError::InvalidInput(
                "Custom Jacobian selected but no Jacobian function was supplied".to_string(),
            ));
        }
        Ok(())
    }
}

enum StepOutcome {
    Accepted { converged: bool },
    Terminated(FitStatus),
}
