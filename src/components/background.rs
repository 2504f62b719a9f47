//! Additive background level with an optional planar gradient

use ndarray::Array3;

use crate::component::{Category, Component, RenderContext};
use crate::components::illumination::normalized;
use crate::error::{ReconError, Result};
use crate::parameters::Parameter;
use crate::region::{Support, Tile};

/// `B(z, y, x) = level + gy * v + gx * u` with `u, v` normalized to `[-1, 1]`
#[derive(Debug, Clone)]
pub struct Background {
    prefix: String,
    level: f64,
    gradient: Option<[f64; 2]>,
}

impl Background {
    /// A constant background
    pub fn constant(level: f64) -> Self {
        Self {
            prefix: "bkg-".to_string(),
            level,
            gradient: None,
        }
    }

    /// Add a planar `(y, x)` gradient with the given initial slopes
    pub fn with_gradient(mut self, gy: f64, gx: f64) -> Self {
        self.gradient = Some([gy, gx]);
        self
    }

    /// Use a different parameter-name prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Basis function for a parameter suffix
    fn basis(&self, suffix: &str, pixel: [usize; 3], frame: &Tile) -> f64 {
        let shape = frame.shape();
        match suffix {
            "gy" => normalized(pixel[1] - frame.lo[1], shape[1]),
            "gx" => normalized(pixel[2] - frame.lo[2], shape[2]),
            _ => 1.0,
        }
    }

    fn suffix<'n>(&self, name: &'n str) -> Option<&'n str> {
        let suffix = name.strip_prefix(&self.prefix)?;
        match suffix {
            "level" => Some(suffix),
            "gy" | "gx" if self.gradient.is_some() => Some(suffix),
            _ => None,
        }
    }
}

impl Component for Background {
    fn label(&self) -> &str {
        "background"
    }

    fn category(&self) -> Category {
        Category::Background
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        let mut params = vec![Parameter::new(&self.name("level"), self.level)];
        if let Some([gy, gx]) = self.gradient {
            params.push(Parameter::new(&self.name("gy"), gy));
            params.push(Parameter::new(&self.name("gx"), gx));
        }
        Ok(params)
    }

    fn parameters(&self) -> Vec<String> {
        let mut names = vec![self.name("level")];
        if self.gradient.is_some() {
            names.push(self.name("gy"));
            names.push(self.name("gx"));
        }
        names
    }

    fn support(&self, name: &str, _ctx: &RenderContext<'_>) -> Result<Support> {
        self.suffix(name)
            .map(|_| Support::Global)
            .ok_or_else(|| ReconError::ParameterNotFound(name.to_string()))
    }

    fn render(&self, ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>> {
        let level = ctx.value(&self.name("level"))?;
        let slopes = match self.gradient {
            Some(_) => Some([ctx.value(&self.name("gy"))?, ctx.value(&self.name("gx"))?]),
            None => None,
        };
        let frame = ctx.frame;

        ctx.evaluator.evaluate(tile, &|pixel| match slopes {
            Some([gy, gx]) => {
                level + gy * self.basis("gy", pixel, &frame) + gx * self.basis("gx", pixel, &frame)
            }
            None => level,
        })
    }

    fn derivative(
        &self,
        name: &str,
        ctx: &RenderContext<'_>,
        tile: &Tile,
    ) -> Option<Result<Array3<f64>>> {
        let suffix = self.suffix(name)?;
        let frame = ctx.frame;
        Some(
            ctx.evaluator
                .evaluate(tile, &|pixel| self.basis(suffix, pixel, &frame)),
        )
    }
}
