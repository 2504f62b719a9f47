//! Difference cache behaviour seen through the model

use reconfit_rs::components::Particle;
use reconfit_rs::CompositionRule;

use crate::test_helpers::{max_relative_difference, planar_model};

fn far_apart() -> Vec<Particle> {
    vec![
        Particle::planar(6.0, 6.0, 1.5, 1.0),
        Particle::planar(25.0, 25.0, 1.5, 0.8),
    ]
}

#[test]
fn test_update_invalidates_only_overlapping_entries() {
    let mut model = planar_model(far_apart(), CompositionRule::Emission);
    model.render_full().unwrap();

    model.cache_parameter("p0-x").unwrap();
    model.cache_parameter("p1-x").unwrap();
    model.cache_parameter("ilm-0-0-0").unwrap();
    assert!(model.cache().is_valid("p0-x"));
    assert!(model.cache().is_valid("p1-x"));
    assert!(model.cache().is_valid("ilm-0-0-0"));

    model.update(&[("p0-x".to_string(), 6.5)]).unwrap();

    // p1 is far from the change; p0 itself and the global field are not
    assert!(!model.cache().is_valid("p0-x"));
    assert!(model.cache().is_valid("p1-x"));
    assert!(!model.cache().is_valid("ilm-0-0-0"));

    // A surviving entry still matches a fresh render of its component
    let cached = model.cache_parameter("p1-x").unwrap();
    let entry = model.cache().entry("p1-x").unwrap();
    assert_eq!(entry.tile.lo, [0, 21, 21]);
    assert_eq!(entry.tile.hi, [1, 30, 30]);
    assert_eq!(cached.dim(), entry.tile.dim());
}

#[test]
fn test_cache_hits_are_counted() {
    let mut model = planar_model(far_apart(), CompositionRule::Emission);
    model.render_full().unwrap();

    let before = model.cache().stats();
    model.cache_parameter("p1-a").unwrap();
    model.cache_parameter("p1-a").unwrap();
    let after = model.cache().stats();
    assert_eq!(after.misses - before.misses, 1);
    assert_eq!(after.hits - before.hits, 1);
}

#[test]
fn test_full_render_primes_global_fields() {
    let mut model = planar_model(far_apart(), CompositionRule::Emission);
    model.render_full().unwrap();
    assert!(model.cache().is_valid("bkg-level"));
    assert!(model.cache().is_valid("ilm-0-1-1"));

    // Nothing left to render
    assert_eq!(model.warm_cache().unwrap(), 0);

    // A local change drops the global fields
    model.update(&[("p1-x".to_string(), 24.5)]).unwrap();
    assert!(!model.cache().is_valid("bkg-level"));
    assert!(model.warm_cache().unwrap() >= 1);
    assert!(model.cache().is_valid("bkg-level"));

    // A global change repaints the whole frame and stores the new fields
    model.update(&[("bkg-level".to_string(), 0.15)]).unwrap();
    assert!(model.cache().is_valid("bkg-level"));
    assert_eq!(model.warm_cache().unwrap(), 0);
    let cached = model.cache_parameter("bkg-level").unwrap();
    assert!(cached.iter().all(|&v| v == 0.15));
}

#[test]
fn test_patches_stay_exact_with_a_warm_cache() {
    let mut model = planar_model(far_apart(), CompositionRule::Exclusion);
    model.render_full().unwrap();
    model.warm_cache().unwrap();
    model.cache_parameter("p1-y").unwrap();

    for (name, value) in [("p0-y", 7.0), ("p1-a", 1.7), ("ilm-0-1-0", 0.05), ("p0-x", 5.5)] {
        model.update(&[(name.to_string(), value)]).unwrap();
        let patched = model.image().unwrap().data.clone();
        let full = model.render_full().unwrap().data.clone();
        assert!(max_relative_difference(&patched, &full) < 1e-12);
        model.warm_cache().unwrap();
    }
}
