//! Termination states and convergence tests for the fit loop.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::error::ReconError;

/// Why a fit was judged converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceReason {
    /// Relative cost improvement stayed below `ftol` for `run_length`
    /// consecutive accepted steps
    CostTolerance,
    /// The proposed step was smaller than `xtol` relative to the parameters
    StepTolerance,
    /// The largest gradient component fell below `gtol`
    Gradient,
    /// Damping reached `max_lambda` without finding an improving step
    DampingCeiling,
}

/// Why a fit failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The damped normal equations could not be solved
    SingularSystem(String),
    /// Every step within the rejection budget increased the cost
    Stalled { rejections: usize, lambda: f64 },
}

impl FailureReason {
    /// The matching library error.
    pub fn to_error(&self) -> ReconError {
        match self {
            FailureReason::SingularSystem(msg) => ReconError::SingularSystem(msg.clone()),
            FailureReason::Stalled { rejections, lambda } => ReconError::StalledOptimization {
                rejections: *rejections,
                lambda: *lambda,
            },
        }
    }
}

/// Final status of a fit.
///
/// `MaxIterationsReached` is a normal outcome: the parameters hold the best
/// values found so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged(ConvergenceReason),
    MaxIterationsReached,
    Failed(FailureReason),
}

impl FitStatus {
    /// Whether a convergence criterion was met.
    pub fn is_converged(&self) -> bool {
        matches!(self, FitStatus::Converged(_))
    }

    /// Whether the fit ended in a usable state (converged or out of iterations).
    pub fn is_success(&self) -> bool {
        !matches!(self, FitStatus::Failed(_))
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitStatus::Converged(ConvergenceReason::CostTolerance) => {
                write!(f, "Converged: small relative cost change")
            }
            FitStatus::Converged(ConvergenceReason::StepTolerance) => {
                write!(f, "Converged: small parameter step")
            }
            FitStatus::Converged(ConvergenceReason::Gradient) => {
                write!(f, "Converged: small gradient")
            }
            FitStatus::Converged(ConvergenceReason::DampingCeiling) => {
                write!(f, "Converged: damping ceiling reached")
            }
            FitStatus::MaxIterationsReached => write!(f, "Terminated: iteration or time limit"),
            FitStatus::Failed(reason) => write!(f, "Failed: {}", reason.to_error()),
        }
    }
}

/// Tracks the cost and step tests across accepted iterations.
#[derive(Debug, Clone)]
pub struct ConvergenceCriteria {
    /// Tolerance for relative change in the cost
    pub ftol: f64,

    /// Tolerance for relative step size
    pub xtol: f64,

    /// Tolerance for the largest gradient component
    pub gtol: f64,

    /// Consecutive small improvements required
    pub run_length: usize,

    recent: VecDeque<bool>,
}

impl ConvergenceCriteria {
    /// Creates a new set of criteria with an empty history.
    pub fn new(ftol: f64, xtol: f64, gtol: f64, run_length: usize) -> Self {
        Self {
            ftol,
            xtol,
            gtol,
            run_length: run_length.max(1),
            recent: VecDeque::new(),
        }
    }

    /// Record an accepted step from `previous` to `current` cost.
    ///
    /// Returns true once the last `run_length` accepted steps each improved
    /// the cost by less than `ftol` relative to the previous cost.
    pub fn record_accepted(&mut self, previous: f64, current: f64) -> bool {
        let improvement = (previous - current) / previous.abs().max(f64::MIN_POSITIVE);
        let small = current == 0.0 || improvement < self.ftol;
        self.recent.push_back(small);
        while self.recent.len() > self.run_length {
            self.recent.pop_front();
        }
        self.recent.len() == self.run_length && self.recent.iter().all(|&s| s)
    }

    /// Whether a step is negligible relative to the parameter magnitudes.
    pub fn step_converged(&self, step_norm: f64, param_norm: f64) -> bool {
        step_norm <= self.xtol * (param_norm + self.xtol)
    }

    /// Whether the largest gradient component is below `gtol`.
    pub fn gradient_converged(&self, max_gradient: f64) -> bool {
        self.gtol > 0.0 && max_gradient <= self.gtol
    }
}
