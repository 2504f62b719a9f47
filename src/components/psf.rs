//! Gaussian point-spread function

use ndarray::Array3;

use crate::component::{Category, Component, RenderContext};
use crate::convolve::gaussian_kernel;
use crate::error::{ReconError, Result};
use crate::parameters::Parameter;
use crate::region::{Support, Tile};

const AXES: [&str; 3] = ["sz", "sy", "sx"];

/// Smallest allowed PSF width
pub const MIN_SIGMA: f64 = 0.05;

/// Separable Gaussian blur with a fixed kernel footprint
///
/// Only axes with a non-zero half-width carry a width parameter; the
/// footprint never changes during a fit, so the dilation applied to patch
/// regions is a constant of the model.
#[derive(Debug, Clone)]
pub struct GaussianPsf {
    prefix: String,
    sigma: [f64; 3],
    half_width: [usize; 3],
}

impl GaussianPsf {
    /// Create a PSF with initial widths `sigma` and the given half-width
    pub fn new(sigma: [f64; 3], half_width: [usize; 3]) -> Result<Self> {
        for axis in 0..3 {
            if half_width[axis] > 0 && !(sigma[axis] >= MIN_SIGMA) {
                return Err(ReconError::InvalidInput(format!(
                    "PSF width along axis {} must be at least {}, got {}",
                    axis, MIN_SIGMA, sigma[axis]
                )));
            }
        }
        Ok(Self {
            prefix: "psf-".to_string(),
            sigma,
            half_width,
        })
    }

    /// Planar PSF with equal widths along `y` and `x`
    pub fn planar(sigma: f64, half_width: usize) -> Result<Self> {
        Self::new([0.0, sigma, sigma], [0, half_width, half_width])
    }

    /// Use a different parameter-name prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn active_axes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..3).filter(move |&axis| self.half_width[axis] > 0)
    }

    fn name(&self, axis: usize) -> String {
        format!("{}{}", self.prefix, AXES[axis])
    }
}

impl Component for GaussianPsf {
    fn label(&self) -> &str {
        "psf"
    }

    fn category(&self) -> Category {
        Category::Psf
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        self.active_axes()
            .map(|axis| {
                Parameter::with_bounds(&self.name(axis), self.sigma[axis], MIN_SIGMA, f64::INFINITY)
            })
            .collect()
    }

    fn parameters(&self) -> Vec<String> {
        self.active_axes().map(|axis| self.name(axis)).collect()
    }

    fn support(&self, name: &str, _ctx: &RenderContext<'_>) -> Result<Support> {
        if self.parameters().iter().any(|n| n == name) {
            Ok(Support::Global)
        } else {
            Err(ReconError::ParameterNotFound(name.to_string()))
        }
    }

    fn render(&self, _ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>> {
        Ok(Array3::zeros(tile.dim()))
    }

    fn kernel(&self, ctx: &RenderContext<'_>) -> Option<Result<Array3<f64>>> {
        let mut sigma = [0.0; 3];
        for axis in self.active_axes() {
            match ctx.value(&self.name(axis)) {
                Ok(value) => sigma[axis] = value,
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(gaussian_kernel(sigma, self.half_width)))
    }

    fn kernel_half_width(&self) -> [usize; 3] {
        self.half_width
    }
}
