//! # reconfit-rs
//!
//! `reconfit-rs` extracts physical parameters from an image by fitting a
//! forward model of the whole image to the data.
//!
//! The library provides:
//! - A parameter store with bounds, freezing and an undo stack
//! - Composable model components (illumination, background, particles, PSF)
//!   combined by a [`CompositionRule`]
//! - Incremental rendering: a parameter change re-renders only the image
//!   region it can affect, and the cost is patched from the same region
//! - A Levenberg-Marquardt optimizer built on those patches, with sparse
//!   finite-difference or analytic Jacobians
//! - Parameter uncertainties and particle add/remove checks
//!
//! ## Basic Usage
//!
//! ```
//! use reconfit_rs::components::{Background, GaussianPsf, Particle, ParticleSet, ParticleShape};
//! use reconfit_rs::{fit, FitConfig, ImageModel};
//!
//! let build = |x: f64| {
//!     let particles = ParticleSet::new(
//!         ParticleShape::Gaussian,
//!         vec![Particle::planar(8.0, x, 1.5, 1.0)],
//!     )?
//!     .planar();
//!     ImageModel::builder([1, 16, 16])
//!         .component(Background::constant(0.1))
//!         .component(particles)
//!         .component(GaussianPsf::planar(0.8, 2)?)
//!         .build()
//! };
//!
//! let observed = reconfit_rs::render(&mut build(8.0)?)?;
//! let mut model = build(7.6)?;
//! model.set_vary("psf-sy", false)?;
//! model.set_vary("psf-sx", false)?;
//! let result = fit(&mut model, observed, None, FitConfig::default())?;
//! assert!((result.value("p0-x").unwrap() - 8.0).abs() < 1e-4);
//! # Ok::<(), reconfit_rs::ReconError>(())
//! ```

pub mod error;

// Parameter system
pub mod parameters;

// Rendering
pub mod component;
pub mod components;
pub mod convolve;
pub mod evaluator;
pub mod model;
pub mod region;

// Incremental evaluation
pub mod cache;
pub mod cost;
pub mod state;

// Fitting
pub mod addsub;
pub mod lm;
pub mod uncertainty;

use ndarray::Array3;

// Re-exports for convenience
pub use component::{Category, Component, RenderContext};
pub use cost::{CostEvaluator, Regularization};
pub use error::{ReconError, Result};
pub use lm::{FitConfig, FitResult, FitStatus, LevenbergMarquardt};
pub use model::{CompositionRule, ImageModel, ImageModelBuilder};
pub use parameters::{Bounds, Parameter, ParameterStore};
pub use region::{Support, Tile};
pub use state::{ImageState, ParameterUpdate};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fit `model` to `observed` with optional per-pixel `weights`.
///
/// The model is left at the best parameters found. Regularization from the
/// configuration is applied to the cost.
///
/// # Arguments
///
/// * `model` - The model to fit; its varying parameters are optimized
/// * `observed` - Observed image with the model's shape
/// * `weights` - Non-negative per-pixel weights, or `None` for uniform
/// * `config` - Optimizer configuration
pub fn fit(
    model: &mut ImageModel,
    observed: Array3<f64>,
    weights: Option<Array3<f64>>,
    config: FitConfig,
) -> Result<FitResult> {
    let evaluator = CostEvaluator::new(observed, weights)?;
    let mut state = ImageState::new(model, evaluator)?;
    LevenbergMarquardt::with_config(config).fit(&mut state)
}

/// Render the model over its full frame.
pub fn render(model: &mut ImageModel) -> Result<Array3<f64>> {
    Ok(model.render()?.data.clone())
}
