//! Model component interface
//!
//! A component contributes one field (illumination, background, particles) or
//! the blur kernel (PSF) to the composite image. Components declare their
//! parameters once, at composition time, and afterwards only *read* values
//! through a [`RenderContext`]; the parameter store is the single owner of
//! all values.

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::components::ParticleSet;
use crate::error::Result;
use crate::evaluator::RegionEvaluator;
use crate::parameters::{Parameter, ParameterValues};
use crate::region::{Support, Tile};

/// Role a component plays in the composition rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Multiplicative field `I`
    Illumination,
    /// Additive level `B`
    Background,
    /// Particle field `P`
    Particles,
    /// Blur kernel `H`
    Psf,
}

/// Everything a component needs to render
#[derive(Clone, Copy)]
pub struct RenderContext<'a> {
    /// Parameter values (the store or a perturbed view of it)
    pub params: &'a dyn ParameterValues,
    /// Full image frame
    pub frame: Tile,
    /// Pixel sweep strategy
    pub evaluator: &'a dyn RegionEvaluator,
}

impl<'a> RenderContext<'a> {
    /// Bundle a context
    pub fn new(
        params: &'a dyn ParameterValues,
        frame: Tile,
        evaluator: &'a dyn RegionEvaluator,
    ) -> Self {
        Self {
            params,
            frame,
            evaluator,
        }
    }

    /// Read a parameter value
    pub fn value(&self, name: &str) -> Result<f64> {
        self.params.value(name)
    }
}

impl fmt::Debug for RenderContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("frame", &self.frame)
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

/// A contributor to the composite model image
///
/// Implementations must be pure functions of the parameter values they read:
/// rendering the same tile twice with the same values yields bit-identical
/// output, and rendering a sub-tile yields exactly the corresponding slice of
/// a larger render.
pub trait Component: Send + Sync + fmt::Debug {
    /// Short label used in logs
    fn label(&self) -> &str;

    /// Role of this component in the composition rule
    fn category(&self) -> Category;

    /// Parameters to declare in the store when the model is built
    fn initial_parameters(&self) -> Result<Vec<Parameter>>;

    /// Names of the parameters this component currently reads
    fn parameters(&self) -> Vec<String>;

    /// Parameters whose support may change when `name` changes
    fn coupled(&self, _name: &str) -> Vec<String> {
        self.parameters()
    }

    /// Region of the (pre-blur) field that `name` can influence
    fn support(&self, name: &str, ctx: &RenderContext<'_>) -> Result<Support>;

    /// Field values over `tile`
    ///
    /// PSF components have no field and return zeros; they act through
    /// [`kernel`](Self::kernel).
    fn render(&self, ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>>;

    /// Analytic derivative of the field with respect to `name` over `tile`
    ///
    /// `None` means the component has no closed form and the caller should
    /// fall back to finite differences.
    fn derivative(
        &self,
        _name: &str,
        _ctx: &RenderContext<'_>,
        _tile: &Tile,
    ) -> Option<Result<Array3<f64>>> {
        None
    }

    /// Blur kernel, for PSF components
    fn kernel(&self, _ctx: &RenderContext<'_>) -> Option<Result<Array3<f64>>> {
        None
    }

    /// Fixed kernel half-width, for PSF components
    fn kernel_half_width(&self) -> [usize; 3] {
        [0; 3]
    }

    /// Downcast to a particle collection
    fn as_particles(&self) -> Option<&ParticleSet> {
        None
    }

    /// Mutable downcast to a particle collection
    fn as_particles_mut(&mut self) -> Option<&mut ParticleSet> {
        None
    }
}
