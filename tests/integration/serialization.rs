//! JSON configurations and results

use reconfit_rs::components::Particle;
use reconfit_rs::lm::{DampingScaling, JacobianMethod};
use reconfit_rs::{FitConfig, FitResult, Regularization};

use crate::test_helpers::single_particle_model;

#[test]
fn test_partial_config_uses_defaults() {
    let json = r#"{
        "max_iterations": 50,
        "ftol": 1e-12,
        "jacobian": "Analytic",
        "damping": "Identity"
    }"#;
    let config = FitConfig::from_json(json).unwrap();
    assert_eq!(config.max_iterations, 50);
    assert_eq!(config.ftol, 1e-12);
    assert_eq!(config.jacobian, JacobianMethod::Analytic);
    assert_eq!(config.damping, DampingScaling::Identity);
    assert_eq!(config.xtol, FitConfig::default().xtol);
    assert_eq!(config.regularization, Regularization::None);
    assert!(config.time_limit.is_none());
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(FitConfig::from_json(r#"{"ftol": -1.0}"#).is_err());
    assert!(FitConfig::from_json(r#"{"lambda_down_factor": 2.0}"#).is_err());
    assert!(FitConfig::from_json(r#"{"max_iterations": "many"}"#).is_err());
    assert!(FitConfig::from_json(
        r#"{"regularization": {"BoundPenalty": {"strength": -1.0}}}"#
    )
    .is_err());
}

#[test]
fn test_config_file_drives_a_fit() {
    let mut truth = single_particle_model(Particle::planar(12.0, 12.0, 1.5, 1.0));
    let observed = reconfit_rs::render(&mut truth).unwrap();

    let config = FitConfig::from_json(r#"{"max_iterations": 40, "compute_uncertainties": false}"#)
        .unwrap();
    let mut model = single_particle_model(Particle::planar(11.8, 12.2, 1.5, 1.0));
    let result = reconfit_rs::fit(&mut model, observed, None, config).unwrap();
    assert!(result.iterations_used <= 40);
    assert!(result.standard_errors.is_none());
    assert!((result.value("p0-x").unwrap() - 12.0).abs() < 1e-4);
}

#[test]
fn test_result_round_trip() {
    let mut truth = single_particle_model(Particle::planar(12.0, 12.0, 1.5, 1.0));
    let observed = reconfit_rs::render(&mut truth).unwrap();
    let mut model = single_particle_model(Particle::planar(11.8, 12.2, 1.6, 0.9));
    let result = reconfit_rs::fit(&mut model, observed, None, FitConfig::default()).unwrap();

    let json = result.to_json().unwrap();
    let back = FitResult::from_json(&json).unwrap();
    assert_eq!(back.parameters, result.parameters);
    assert_eq!(back.varied, result.varied);
    assert_eq!(back.status, result.status);
    assert_eq!(back.iterations_used, result.iterations_used);
    assert_eq!(back.cost_history, result.cost_history);
    assert_eq!(back.renders, result.renders);
    assert_eq!(back.standard_errors.is_some(), result.standard_errors.is_some());

    let summary = result.to_string();
    assert!(summary.contains("Status"));
    assert!(summary.contains("p0-x"));
}
