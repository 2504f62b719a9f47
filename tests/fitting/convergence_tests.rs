//! Noiseless fits and termination rules

use approx::assert_relative_eq;
use reconfit_rs::components::Particle;
use reconfit_rs::cost::CostEvaluator;
use reconfit_rs::lm::JacobianMethod;
use reconfit_rs::{
    CompositionRule, FitConfig, FitStatus, ImageModel, ImageState, LevenbergMarquardt,
    Regularization,
};
use std::time::Duration;

use crate::test_helpers::{planar_model, single_particle_model, two_particles};

fn truth() -> Particle {
    Particle::planar(12.0, 12.0, 1.5, 1.0)
}

fn observed() -> ndarray::Array3<f64> {
    let mut model = single_particle_model(truth());
    reconfit_rs::render(&mut model).unwrap()
}

fn start_model() -> ImageModel {
    single_particle_model(Particle::planar(11.6, 12.3, 1.7, 0.85))
}

fn freeze_global(model: &mut ImageModel) {
    let names: Vec<String> = model
        .store()
        .names()
        .into_iter()
        .filter(|n| n.starts_with("ilm-") || n.starts_with("psf-"))
        .collect();
    for name in names {
        model.set_vary(&name, false).unwrap();
    }
}

#[test]
fn test_noiseless_fit_recovers_truth() {
    let mut model = start_model();
    let result = reconfit_rs::fit(&mut model, observed(), None, FitConfig::default()).unwrap();

    assert!(result.status.is_success(), "status: {}", result.status);
    assert_relative_eq!(result.value("p0-y").unwrap(), 12.0, epsilon = 1e-4);
    assert_relative_eq!(result.value("p0-x").unwrap(), 12.0, epsilon = 1e-4);
    assert_relative_eq!(result.value("p0-a").unwrap(), 1.5, epsilon = 1e-4);
    assert_relative_eq!(result.value("p0-amp").unwrap(), 1.0, epsilon = 1e-4);
    assert_relative_eq!(result.value("bkg-level").unwrap(), 0.2, epsilon = 1e-4);
    assert!(result.final_cost < 1e-8);
    assert!(result.final_cost < result.initial_cost);

    // Frozen parameters are untouched
    assert_eq!(result.value("psf-sx").unwrap(), 0.9);
    assert!(!result.varied.contains(&"psf-sx".to_string()));

    // The model is left at the solution
    assert_eq!(model.store().get("p0-x").unwrap(), result.value("p0-x").unwrap());
}

#[test]
fn test_accepted_costs_decrease() {
    let mut model = start_model();
    let result = reconfit_rs::fit(&mut model, observed(), None, FitConfig::default()).unwrap();

    assert_eq!(result.cost_history.len(), result.iterations_used + 1);
    assert_eq!(result.cost_history[0], result.initial_cost);
    for pair in result.cost_history.windows(2) {
        assert!(pair[1] < pair[0], "cost went from {} to {}", pair[0], pair[1]);
    }

    // Patched costs track the full render
    let last = *result.cost_history.last().unwrap();
    assert!((last - result.final_cost).abs() <= 1e-9 * result.initial_cost);

    // Most pricing goes through patches
    assert!(result.renders.patch_renders > result.renders.full_renders);
}

#[test]
fn test_two_particle_fit() {
    let mut target = planar_model(two_particles(), CompositionRule::Emission);
    let data = reconfit_rs::render(&mut target).unwrap();

    let mut model = planar_model(
        vec![
            Particle::planar(9.3, 9.7, 1.9, 0.9),
            Particle::planar(21.8, 21.3, 1.4, 0.85),
        ],
        CompositionRule::Emission,
    );
    freeze_global(&mut model);
    let result = reconfit_rs::fit(&mut model, data, None, FitConfig::default()).unwrap();

    assert!(result.status.is_success(), "status: {}", result.status);
    assert_eq!(result.varied.len(), 9);
    assert_relative_eq!(result.value("p0-y").unwrap(), 9.0, epsilon = 1e-3);
    assert_relative_eq!(result.value("p0-x").unwrap(), 10.0, epsilon = 1e-3);
    assert_relative_eq!(result.value("p1-y").unwrap(), 22.0, epsilon = 1e-3);
    assert_relative_eq!(result.value("p1-x").unwrap(), 21.0, epsilon = 1e-3);
    assert_relative_eq!(result.value("p1-amp").unwrap(), 0.8, epsilon = 1e-3);
}

#[test]
fn test_analytic_jacobian_matches_finite_differences() {
    let data = observed();

    let mut fd_model = start_model();
    let fd = reconfit_rs::fit(&mut fd_model, data.clone(), None, FitConfig::default()).unwrap();

    let config = FitConfig {
        jacobian: JacobianMethod::Analytic,
        ..FitConfig::default()
    };
    let mut analytic_model = start_model();
    let analytic = reconfit_rs::fit(&mut analytic_model, data, None, config).unwrap();

    assert!(analytic.status.is_success(), "status: {}", analytic.status);
    for name in &fd.varied {
        assert_relative_eq!(
            analytic.value(name).unwrap(),
            fd.value(name).unwrap(),
            epsilon = 1e-4
        );
    }
}

#[test]
fn test_zero_time_limit_stops_before_the_first_step() {
    let mut model = start_model();
    let before = model.store().get_vector();
    let evaluator = CostEvaluator::new(observed(), None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();

    let result = LevenbergMarquardt::new()
        .with_time_limit(Duration::ZERO)
        .fit(&mut state)
        .unwrap();
    assert_eq!(result.status, FitStatus::MaxIterationsReached);
    assert_eq!(result.iterations_used, 0);
    assert_eq!(result.cost_history.len(), 1);
    drop(state);
    assert_eq!(model.store().get_vector(), before);
}

#[test]
fn test_iteration_limit() {
    let mut model = start_model();
    let evaluator = CostEvaluator::new(observed(), None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();

    let result = LevenbergMarquardt::new()
        .with_max_iterations(1)
        .fit(&mut state)
        .unwrap();
    assert_eq!(result.status, FitStatus::MaxIterationsReached);
    assert_eq!(result.iterations_used, 1);
    assert!(result.final_cost < result.initial_cost);
}

#[test]
fn test_fit_subset_holds_other_parameters() {
    let mut model = start_model();
    let evaluator = CostEvaluator::new(observed(), None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();

    let names = vec!["p0-y".to_string(), "p0-x".to_string()];
    let result = LevenbergMarquardt::new().fit_subset(&mut state, &names).unwrap();
    assert_eq!(result.varied, names);
    assert_eq!(result.value("p0-a").unwrap(), 1.7);
    assert_eq!(result.value("p0-amp").unwrap(), 0.85);
    assert!(result.final_cost < result.initial_cost);
}

#[test]
fn test_ridge_holds_parameters_near_their_priors() {
    let mut model = start_model();
    let ridge = Regularization::ridge_from_store(1e6, model.store());
    let config = FitConfig {
        regularization: ridge,
        ..FitConfig::default()
    };
    let result = reconfit_rs::fit(&mut model, observed(), None, config).unwrap();

    assert!((result.value("p0-x").unwrap() - 12.3).abs() < 1e-2);
    assert!((result.value("p0-y").unwrap() - 11.6).abs() < 1e-2);

    // Without the penalty the same start reaches the truth
    let mut free = start_model();
    let unregularized = reconfit_rs::fit(&mut free, observed(), None, FitConfig::default()).unwrap();
    assert!((unregularized.value("p0-x").unwrap() - 12.0).abs() < 1e-3);
}

#[test]
fn test_configured_ridge_applies_to_direct_fits() {
    let mut model = start_model();
    let ridge = Regularization::ridge_from_store(1e6, model.store());
    let config = FitConfig {
        regularization: ridge.clone(),
        ..FitConfig::default()
    };
    let evaluator = CostEvaluator::new(observed(), None).unwrap();
    let mut state = ImageState::new(&mut model, evaluator).unwrap();

    let names = vec!["p0-y".to_string(), "p0-x".to_string()];
    let result = LevenbergMarquardt::with_config(config)
        .fit_subset(&mut state, &names)
        .unwrap();

    assert_eq!(state.evaluator().regularization(), &ridge);
    assert!((result.value("p0-x").unwrap() - 12.3).abs() < 1e-2);
    assert!((result.value("p0-y").unwrap() - 11.6).abs() < 1e-2);
}
