//! Patch renders must agree with full renders

use ndarray::Array3;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use reconfit_rs::components::{
    AxialJoin, Background, GaussianPsf, Particle, ParticleSet, ParticleShape, SeparableIllumination,
};
use reconfit_rs::evaluator::SerialEvaluator;
use reconfit_rs::{
    Category, CompositionRule, Component, CostEvaluator, ImageModel, ImageState, Parameter,
    ReconError, RenderContext, Result, Support, Tile,
};
use std::sync::Arc;

use crate::test_helpers::{
    max_relative_difference, planar_model, two_particles, volume_model, SHAPE,
};

/// Apply `steps` random updates through the patch path, checking each one
/// against a full render
fn check_random_patches(model: &mut ImageModel, names: &[&str], steps: usize, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    model.render_full().unwrap();

    for _ in 0..steps {
        let name = names[rng.gen_range(0..names.len())];
        let current = model.store().get(name).unwrap();
        let bounds = model.store().bounds(name).unwrap();
        let proposed = bounds.clamp(current + rng.gen_range(-0.4..0.4));

        let outcome = model.update(&[(name.to_string(), proposed)]).unwrap();
        assert!(outcome.region.len() <= model.frame().len());
        assert_eq!(outcome.old.dim(), outcome.region.dim());
        assert_eq!(outcome.new.dim(), outcome.region.dim());

        let patched = model.image().unwrap().data.clone();
        let full = model.render_full().unwrap().data.clone();
        let diff = max_relative_difference(&patched, &full);
        assert!(diff < 1e-12, "{} -> {}: patch differs by {}", name, proposed, diff);
    }
}

/// Drive a fit state through a long run of single and multi-parameter
/// updates without any full render in between, then compare the patched
/// image and cost with a fresh full render
fn check_long_patch_sequence(model: &mut ImageModel, names: &[&str], steps: usize, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let observed = model.render_full().unwrap().data.mapv(|v| v + 0.05);
    let evaluator = CostEvaluator::new(observed, None).unwrap();
    let mut state = ImageState::new(model, evaluator).unwrap();
    state.warm_cache().unwrap();

    for step in 0..steps {
        let count = rng.gen_range(1..=3);
        let mut updates = Vec::with_capacity(count);
        for name in names.choose_multiple(&mut rng, count) {
            let current = state.store().get(name).unwrap();
            let bounds = state.store().bounds(name).unwrap();
            updates.push((name.to_string(), bounds.clamp(current + rng.gen_range(-0.3..0.3))));
        }
        state.update(&updates).unwrap();
        if step % 10 == 9 {
            state.warm_cache().unwrap();
        }
    }
    assert_eq!(state.model().stats().full_renders, 1);

    let patched = state.image().unwrap().clone();
    let patched_cost = state.data_cost();
    let drift = state.refresh().unwrap();
    let full = state.image().unwrap();
    let diff = max_relative_difference(&patched, full);
    assert!(diff < 1e-12, "patched image differs by {}", diff);
    assert!(
        drift.abs() <= 1e-10 * patched_cost.max(1.0),
        "cost drift {} over {}",
        drift,
        patched_cost
    );
}

#[test]
fn test_long_update_sequences_stay_exact() {
    let names = [
        "p0-x", "p0-y", "p0-a", "p0-amp", "p1-x", "p1-y", "p1-a", "bkg-level", "ilm-0-1-0",
        "ilm-0-0-1", "psf-sx",
    ];
    for (rule, seed) in [
        (CompositionRule::Emission, 3),
        (CompositionRule::Exclusion, 5),
        (CompositionRule::Additive, 9),
    ] {
        let mut model = planar_model(two_particles(), rule);
        check_long_patch_sequence(&mut model, &names, 60, seed);
    }

    let mut model = volume_model();
    check_long_patch_sequence(
        &mut model,
        &["p0-z", "p0-x", "p1-y", "p1-a", "bkg-gy", "ilm-1-0-0", "psf-sz"],
        40,
        21,
    );
}

#[test]
fn test_emission_patches_match_full_render() {
    let mut model = planar_model(two_particles(), CompositionRule::Emission);
    check_random_patches(
        &mut model,
        &["p0-x", "p0-y", "p0-a", "p1-amp", "bkg-level", "ilm-0-1-0", "psf-sx"],
        25,
        7,
    );
}

#[test]
fn test_exclusion_patches_match_full_render() {
    let mut model = planar_model(two_particles(), CompositionRule::Exclusion);
    check_random_patches(
        &mut model,
        &["p0-x", "p1-y", "p1-a", "ilm-0-0-1", "psf-sy"],
        25,
        11,
    );
}

#[test]
fn test_additive_patches_match_full_render() {
    let mut model = planar_model(two_particles(), CompositionRule::Additive);
    check_random_patches(
        &mut model,
        &["p0-y", "p1-x", "p0-amp", "bkg-level", "ilm-0-0-0"],
        25,
        13,
    );
}

#[test]
fn test_volume_patches_match_full_render() {
    let mut model = volume_model();
    check_random_patches(
        &mut model,
        &["p0-z", "p0-x", "p1-a", "p1-amp", "bkg-gy", "ilm-1-0-0", "psf-sz"],
        20,
        17,
    );
}

#[test]
fn test_separable_illumination_patches_match_full_render() {
    let particles = ParticleSet::new(
        ParticleShape::Gaussian,
        vec![Particle {
            position: [1.5, 5.0, 6.0],
            radius: 1.4,
            amplitude: 1.0,
        }],
    )
    .unwrap();
    let mut model = ImageModel::builder([4, 14, 14])
        .component(SeparableIllumination::new([2, 2, 2], 1.0, AxialJoin::Product).unwrap())
        .component(Background::constant(0.1))
        .component(particles)
        .component(GaussianPsf::new([0.7, 1.0, 1.0], [1, 2, 2]).unwrap())
        .evaluator(Arc::new(SerialEvaluator))
        .build()
        .unwrap();
    check_random_patches(
        &mut model,
        &["p0-z", "p0-x", "ilm-xy-1-0", "ilm-xy-0-1", "ilm-z-1", "bkg-level"],
        20,
        23,
    );
}

#[test]
fn test_particle_patch_is_local() {
    let mut model = planar_model(two_particles(), CompositionRule::Emission);
    model.render_full().unwrap();
    let before = model.image().unwrap().data.clone();

    let outcome = model.update(&[("p0-x".to_string(), 10.5)]).unwrap();
    assert!(outcome.region.len() < model.frame().len());

    // Pixels outside the patched region keep their values
    let after = &model.image().unwrap().data;
    let region = outcome.region;
    for ((z, y, x), value) in after.indexed_iter() {
        let inside = (region.lo[0]..region.hi[0]).contains(&z)
            && (region.lo[1]..region.hi[1]).contains(&y)
            && (region.lo[2]..region.hi[2]).contains(&x);
        if !inside {
            assert_eq!(*value, before[[z, y, x]]);
        }
    }

    let stats = model.stats();
    assert_eq!(stats.full_renders, 1);
    assert_eq!(stats.patch_renders, 1);
}

#[test]
fn test_push_and_pop_restore_the_image() {
    let mut model = planar_model(two_particles(), CompositionRule::Emission);
    let original = model.render_full().unwrap().data.clone();

    model
        .push_update(&[("p1-x".to_string(), 19.0), ("bkg-level".to_string(), 0.3)])
        .unwrap();
    assert!(max_relative_difference(&original, &model.image().unwrap().data) > 1e-3);

    model.pop_update().unwrap().unwrap();
    assert_eq!(model.store().get("p1-x").unwrap(), 21.0);
    assert!(max_relative_difference(&original, &model.image().unwrap().data) < 1e-12);
}

#[test]
fn test_out_of_bounds_update_changes_nothing() {
    let mut model = planar_model(two_particles(), CompositionRule::Emission);
    let original = model.render_full().unwrap().data.clone();
    let version = model.store().version();

    let err = model.update(&[("p0-a".to_string(), -1.0)]).unwrap_err();
    assert!(matches!(err, ReconError::OutOfBounds { .. }));
    assert_eq!(model.store().version(), version);
    assert!(model.is_current());
    assert_eq!(model.image().unwrap().data, original);
}

#[test]
fn test_add_and_remove_particles() {
    let mut model = planar_model(two_particles(), CompositionRule::Emission);
    model.render_full().unwrap();
    let component = model.particle_component().unwrap();

    let (id, outcome) = model
        .add_particle(component, Particle::planar(16.0, 4.0, 1.4, 0.9))
        .unwrap();
    assert_eq!(id, 2);
    assert!(model.store().contains("p2-x"));
    assert!(outcome.region.len() < model.frame().len());
    let patched = model.image().unwrap().data.clone();
    let full = model.render_full().unwrap().data.clone();
    assert!(max_relative_difference(&patched, &full) < 1e-12);

    let (removed, _) = model.remove_particle(component, 0).unwrap();
    assert_eq!(removed.position, [0.0, 9.0, 10.0]);
    assert!(!model.store().contains("p0-x"));
    let patched = model.image().unwrap().data.clone();

    // Same picture as a model built without the removed particle
    let mut expected = planar_model(
        vec![
            Particle::planar(22.0, 21.0, 1.5, 0.8),
            Particle::planar(16.0, 4.0, 1.4, 0.9),
        ],
        CompositionRule::Emission,
    );
    let expected = expected.render_full().unwrap().data.clone();
    assert!(max_relative_difference(&patched, &expected) < 1e-12);

    assert!(model.remove_particle(component, 0).is_err());
}

#[test]
fn test_duplicate_names_are_rejected_at_build() {
    let result = ImageModel::builder(SHAPE)
        .component(Background::constant(0.1))
        .component(Background::constant(0.2))
        .build();
    assert!(matches!(result, Err(ReconError::DuplicateParameter(_))));

    // Distinct prefixes are fine
    let model = ImageModel::builder(SHAPE)
        .component(Background::constant(0.1))
        .component(Background::constant(0.2).with_prefix("bkg2-"))
        .build()
        .unwrap();
    assert_eq!(model.store().len(), 2);

    let result = ImageModel::builder(SHAPE)
        .component(GaussianPsf::planar(1.0, 2).unwrap())
        .component(GaussianPsf::planar(1.0, 2).unwrap().with_prefix("psf2-"))
        .build();
    assert!(result.is_err());
}

#[test]
fn test_synthesize_adds_noise() {
    let mut model = planar_model(two_particles(), CompositionRule::Emission);
    let clean = model.render_full().unwrap().data.clone();

    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let noisy = model.synthesize(0.05, &mut rng).unwrap();
    let n = clean.len() as f64;
    let variance = (&noisy - &clean).mapv(|v| v * v).sum() / n;
    assert!((variance.sqrt() - 0.05).abs() < 0.01);

    assert_eq!(model.synthesize(0.0, &mut rng).unwrap(), clean);
}

/// Flat level whose renderer refuses values above one half
#[derive(Debug)]
struct FragileLevel;

impl Component for FragileLevel {
    fn label(&self) -> &str {
        "fragile level"
    }

    fn category(&self) -> Category {
        Category::Background
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        Ok(vec![Parameter::with_bounds("level", 0.1, 0.0, 1.0)?])
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
        let level = ctx.value("level")?;
        if level > 0.5 {
            return Err(ReconError::InvalidInput(format!("level {} cannot be rendered", level)));
        }
        Ok(Array3::from_elem(tile.dim(), level))
    }
}

fn fragile_model() -> ImageModel {
    let particles = ParticleSet::new(
        ParticleShape::Gaussian,
        vec![Particle::planar(8.0, 8.0, 1.5, 1.0)],
    )
    .unwrap()
    .planar();
    ImageModel::builder([1, 16, 16])
        .component(FragileLevel)
        .component(particles)
        .component(GaussianPsf::planar(0.8, 2).unwrap())
        .evaluator(Arc::new(SerialEvaluator))
        .build()
        .unwrap()
}

#[test]
fn test_failed_patch_restores_parameters() {
    let mut model = fragile_model();
    let original = model.render_full().unwrap().data.clone();

    let err = model.update(&[("level".to_string(), 0.8)]).unwrap_err();
    assert!(matches!(err, ReconError::InvalidInput(_)));
    assert_eq!(model.store().get("level").unwrap(), 0.1);
    assert!(model.image().is_none());
    assert!(!model.cache().is_valid("level"));

    let err = model.update(&[("p0-x".to_string(), 9.0)]).unwrap_err();
    assert!(matches!(err, ReconError::InvalidInput(_)));
    assert_eq!(model.render_full().unwrap().data, original);

    model
        .push_update(&[("p0-x".to_string(), 9.0), ("level".to_string(), 0.9)])
        .unwrap_err();
    assert_eq!(model.store().get("p0-x").unwrap(), 8.0);
    assert_eq!(model.store().stack_depth(), 0);
    assert_eq!(model.render_full().unwrap().data, original);
}

#[test]
fn test_failed_patch_leaves_a_consistent_state() {
    let mut model = fragile_model();
    let observed = Array3::from_elem((1, 16, 16), 0.05);
    let evaluator = CostEvaluator::new(observed, None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();
    state.update_parameter("p0-x", 8.5).unwrap();
    let before = state.cost();

    assert!(state.update_parameter("level", 0.7).is_err());
    assert_eq!(state.store().get("level").unwrap(), 0.1);
    assert!(state.model().is_current());

    let recomputed = state.evaluator().data_cost(state.image().unwrap()).unwrap();
    assert!((state.data_cost() - recomputed).abs() <= 1e-12 * recomputed.max(1.0));
    assert!((state.cost() - before).abs() <= 1e-12 * before.max(1.0));

    // The state keeps patching after recovery
    state.update_parameter("level", 0.3).unwrap();
    let patched = state.data_cost();
    let drift = state.refresh().unwrap();
    assert!(drift.abs() <= 1e-12 * patched.max(1.0));
}
