//! Levenberg-Marquardt fitting of an image model.
//!
//! The optimizer works on an [`ImageState`](crate::state::ImageState): every
//! tentative step is applied through the model's patch path, priced with the
//! incrementally updated cost and either kept or reverted.

pub mod algorithm;
pub mod config;
pub mod convergence;
pub mod jacobian;
pub mod step;
pub mod trust_region;

pub use algorithm::{FitResult, LevenbergMarquardt};
pub use config::{DampingScaling, FitConfig, JacobianMethod};
pub use convergence::{ConvergenceCriteria, ConvergenceReason, FailureReason, FitStatus};
pub use jacobian::{Jacobian, JacobianColumn, JacobianFn};
pub use step::{LmStep, NormalEquations, StepResult};
pub use trust_region::TrustRegion;
