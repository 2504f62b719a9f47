//! From a noisy image with a missing particle to a complete fit

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use reconfit_rs::addsub::{add_subtract, AddSubOptions};
use reconfit_rs::components::{Background, GaussianPsf, Particle, ParticleSet, ParticleShape};
use reconfit_rs::cost::CostEvaluator;
use reconfit_rs::evaluator::SerialEvaluator;
use reconfit_rs::{ImageModel, ImageState, LevenbergMarquardt};
use std::sync::Arc;

const SIGMA: f64 = 0.01;

fn scene(particles: Vec<Particle>) -> ImageModel {
    let set = ParticleSet::new(ParticleShape::Gaussian, particles)
        .unwrap()
        .planar();
    ImageModel::builder([1, 24, 24])
        .component(Background::constant(0.1))
        .component(set)
        .component(GaussianPsf::planar(0.8, 2).unwrap())
        .evaluator(Arc::new(SerialEvaluator))
        .build()
        .unwrap()
}

#[test]
fn test_missing_particle_is_found_and_fitted() {
    let mut truth = scene(vec![
        Particle::planar(6.0, 6.0, 1.5, 1.0),
        Particle::planar(17.0, 16.0, 1.5, 1.0),
    ]);
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let observed = truth.synthesize(SIGMA, &mut rng).unwrap();

    let mut model = scene(vec![Particle::planar(6.0, 6.0, 1.5, 1.0)]);
    model.set_vary("psf-sy", false).unwrap();
    model.set_vary("psf-sx", false).unwrap();
    let component = model.particle_component().unwrap();

    let evaluator = CostEvaluator::new(observed, None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();
    let initial_cost = state.cost();

    let options = AddSubOptions::default().with_noise(SIGMA);
    let report = add_subtract(&mut state, component, &options).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.removed, 0);

    let result = LevenbergMarquardt::new().fit(&mut state).unwrap();
    assert!(result.status.is_success(), "status: {}", result.status);
    // the fit reaches the noise floor
    assert!(initial_cost > 10.0 * result.final_cost);
    assert!(result.final_cost < 1.5 * 24.0 * 24.0 * SIGMA * SIGMA);

    let set = state.model().components()[component].as_particles().unwrap();
    let mut found: Vec<Particle> = set
        .particles(state.store())
        .unwrap()
        .into_iter()
        .map(|(_, p)| p)
        .collect();
    found.sort_by(|a, b| a.position[1].total_cmp(&b.position[1]));
    assert_eq!(found.len(), 2);
    for (particle, expected) in found.iter().zip([[6.0, 6.0], [17.0, 16.0]]) {
        assert!((particle.position[1] - expected[0]).abs() < 0.1);
        assert!((particle.position[2] - expected[1]).abs() < 0.1);
        assert!((particle.amplitude - 1.0).abs() < 0.1);
    }

    // Reduced chi-square near one for the right model
    let dof = (24 * 24 - result.varied.len()) as f64;
    let redchi = result.final_cost / dof / (SIGMA * SIGMA);
    assert!((redchi - 1.0).abs() < 0.25, "reduced chi-square {}", redchi);
}

#[test]
fn test_fit_leaves_a_correct_model() {
    let mut truth = scene(vec![Particle::planar(11.0, 12.0, 1.5, 1.0)]);
    let observed = reconfit_rs::render(&mut truth).unwrap();

    let mut model = scene(vec![Particle::planar(11.4, 11.7, 1.5, 1.1)]);
    model.set_vary("psf-sy", false).unwrap();
    model.set_vary("psf-sx", false).unwrap();
    reconfit_rs::fit(&mut model, observed.clone(), None, Default::default()).unwrap();

    // The stored image agrees with a fresh render and with the data
    let stored = model.render().unwrap().data.clone();
    let fresh = model.render_full().unwrap().data.clone();
    assert_eq!(stored, fresh);
    let worst = (&fresh - &observed).mapv(f64::abs).fold(0.0_f64, |a, &b| a.max(b));
    assert!(worst < 1e-5);
}
