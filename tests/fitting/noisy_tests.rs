//! Fits to noisy synthetic images

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use reconfit_rs::components::Particle;
use reconfit_rs::cost::CostEvaluator;
use reconfit_rs::{FitConfig, FitStatus, ImageState, LevenbergMarquardt};

use crate::test_helpers::single_particle_model;

const SIGMA: f64 = 0.02;

fn noisy_data(seed: u64) -> ndarray::Array3<f64> {
    let mut truth = single_particle_model(Particle::planar(12.0, 12.0, 1.5, 1.0));
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    truth.synthesize(SIGMA, &mut rng).unwrap()
}

#[test]
fn test_estimates_lie_within_their_errors() {
    let mut model = single_particle_model(Particle::planar(11.7, 12.2, 1.6, 0.9));
    let result = reconfit_rs::fit(&mut model, noisy_data(42), None, FitConfig::default()).unwrap();
    assert!(!matches!(result.status, FitStatus::Failed(_)), "status: {}", result.status);

    let errors = result.standard_errors.as_ref().unwrap();
    let truth = [
        ("bkg-level", 0.2),
        ("p0-y", 12.0),
        ("p0-x", 12.0),
        ("p0-a", 1.5),
        ("p0-amp", 1.0),
    ];
    for (name, expected) in truth {
        let estimate = result.value(name).unwrap();
        let error = errors[name];
        assert!(error > 0.0 && error < 0.1, "{}: error {}", name, error);
        assert!(
            (estimate - expected).abs() < 3.0 * error,
            "{}: {} vs {} +/- {}",
            name,
            estimate,
            expected,
            error
        );
    }

    // The residual level matches the noise
    let pixels = 24.0 * 24.0;
    let rms = (result.final_cost / pixels).sqrt();
    assert!((rms - SIGMA).abs() < 0.3 * SIGMA, "rms {}", rms);

    let covariance = result.covariance.as_ref().unwrap();
    assert_eq!(covariance.dim(), (result.varied.len(), result.varied.len()));
}

#[test]
fn test_uncertainties_can_be_skipped() {
    let mut model = single_particle_model(Particle::planar(11.7, 12.2, 1.6, 0.9));
    let config = FitConfig {
        compute_uncertainties: false,
        ..FitConfig::default()
    };
    let result = reconfit_rs::fit(&mut model, noisy_data(7), None, config).unwrap();
    assert!(result.standard_errors.is_none());
    assert!(result.covariance.is_none());
}

#[test]
fn test_weights_scale_the_cost() {
    let data = noisy_data(5);
    let weights = ndarray::Array3::from_elem(data.dim(), 1.0 / SIGMA);

    let mut model = single_particle_model(Particle::planar(11.7, 12.2, 1.6, 0.9));
    let plain = CostEvaluator::new(data.clone(), None).unwrap();
    let weighted = CostEvaluator::new(data, Some(weights)).unwrap();

    let plain_cost = ImageState::new(&mut model, plain).unwrap().cost();
    let weighted_cost = ImageState::new(&mut model, weighted).unwrap().cost();
    approx::assert_relative_eq!(weighted_cost, plain_cost / (SIGMA * SIGMA), max_relative = 1e-12);
}

#[test]
fn test_log_likelihood_improves_with_the_fit() {
    let mut model = single_particle_model(Particle::planar(11.7, 12.2, 1.6, 0.9));
    let evaluator = CostEvaluator::new(noisy_data(9), None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();

    let before = state.log_likelihood(SIGMA).unwrap();
    LevenbergMarquardt::new().fit(&mut state).unwrap();
    let after = state.log_likelihood(SIGMA).unwrap();
    assert!(after > before);
}
