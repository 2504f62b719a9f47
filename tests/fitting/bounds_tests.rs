//! Bounded parameters: projected steps and the bound penalty

use ndarray::Array3;
use reconfit_rs::components::{Background, GaussianPsf, Particle, ParticleSet, ParticleShape};
use reconfit_rs::evaluator::SerialEvaluator;
use reconfit_rs::{
    Category, Component, FitConfig, ImageModel, Parameter, ReconError, Regularization,
    RenderContext, Result, Support, Tile,
};
use std::sync::Arc;

/// Flat additive level restricted to a range
#[derive(Debug)]
struct BoundedLevel {
    initial: f64,
    max: f64,
}

impl Component for BoundedLevel {
    fn label(&self) -> &str {
        "bounded level"
    }

    fn category(&self) -> Category {
        Category::Background
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        Ok(vec![Parameter::with_bounds(
            "level",
            self.initial,
            0.0,
            self.max,
        )?])
    }

    fn parameters(&self) -> Vec<String> {
        vec!["level".to_string()]
    }

    fn support(&self, name: &str, _ctx: &RenderContext<'_>) -> Result<Support> {
        if name == "level" {
            Ok(Support::Global)
        } else {
            Err(ReconError::ParameterNotFound(name.to_string()))
        }
    }

    fn render(&self, ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>> {
        Ok(Array3::from_elem(tile.dim(), ctx.value("level")?))
    }
}

fn particles() -> ParticleSet {
    ParticleSet::new(
        ParticleShape::Gaussian,
        vec![Particle::planar(8.0, 8.0, 1.5, 1.0)],
    )
    .unwrap()
    .planar()
}

/// Data with a level of 0.1
fn observed() -> Array3<f64> {
    let mut truth = ImageModel::builder([1, 16, 16])
        .component(Background::constant(0.1))
        .component(particles())
        .component(GaussianPsf::planar(0.8, 2).unwrap())
        .evaluator(Arc::new(SerialEvaluator))
        .build()
        .unwrap();
    reconfit_rs::render(&mut truth).unwrap()
}

/// Same scene, but the level may not exceed 0.05
fn bounded_model() -> ImageModel {
    let mut model = ImageModel::builder([1, 16, 16])
        .component(BoundedLevel {
            initial: 0.02,
            max: 0.05,
        })
        .component(particles())
        .component(GaussianPsf::planar(0.8, 2).unwrap())
        .evaluator(Arc::new(SerialEvaluator))
        .build()
        .unwrap();
    model.set_vary("psf-sy", false).unwrap();
    model.set_vary("psf-sx", false).unwrap();
    model
}

#[test]
fn test_steps_are_projected_onto_bounds() {
    let mut model = bounded_model();
    let result = reconfit_rs::fit(&mut model, observed(), None, FitConfig::default()).unwrap();

    let level = result.value("level").unwrap();
    assert!(level <= 0.05);
    assert!(level > 0.049);
    assert!(result.final_cost < result.initial_cost);
    assert!(model.store().bounds("level").unwrap().is_within_bounds(level));
}

#[test]
fn test_bound_penalty_keeps_values_inside() {
    let mut model = bounded_model();
    let config = FitConfig {
        regularization: Regularization::BoundPenalty { strength: 1e-6 },
        ..FitConfig::default()
    };
    let result = reconfit_rs::fit(&mut model, observed(), None, config).unwrap();

    let level = result.value("level").unwrap();
    assert!(level < 0.05);
    assert!(level > 0.02);
    assert!(result.final_cost.is_finite());
}

#[test]
fn test_out_of_bounds_start_is_rejected() {
    let result = ImageModel::builder([1, 16, 16])
        .component(BoundedLevel {
            initial: 0.1,
            max: 0.05,
        })
        .build();
    assert!(matches!(result, Err(ReconError::OutOfBounds { .. })));
}
