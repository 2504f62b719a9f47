//! Integration tests for the ParameterStore
//!
//! These tests verify declaration, bounds checking and the undo stack.

use ndarray::array;
use reconfit_rs::parameters::{Bounds, ParameterStore};
use reconfit_rs::ReconError;

fn sample_store() -> ParameterStore {
    let mut store = ParameterStore::new();
    store.declare("bkg-level", 0.1, Bounds::unbounded()).unwrap();
    store.declare("p0-x", 4.0, Bounds::new(0.0, 16.0).unwrap()).unwrap();
    store.declare("p0-a", 1.5, Bounds::min_only(1e-3)).unwrap();
    store
}

#[test]
fn test_declaration_order_and_lookup() {
    let store = sample_store();
    assert_eq!(store.len(), 3);
    assert_eq!(store.names(), vec!["bkg-level", "p0-x", "p0-a"]);
    assert_eq!(store.position("p0-a").unwrap(), 2);
    assert_eq!(store.get_vector(), array![0.1, 4.0, 1.5]);
    assert!(matches!(
        store.get("p1-x"),
        Err(ReconError::ParameterNotFound(_))
    ));
}

#[test]
fn test_duplicate_declaration_is_rejected() {
    let mut store = sample_store();
    let version = store.version();
    let err = store.declare("p0-x", 2.0, Bounds::unbounded()).unwrap_err();
    assert!(matches!(err, ReconError::DuplicateParameter(ref name) if name == "p0-x"));
    assert!(err.is_validation());
    assert_eq!(store.len(), 3);
    assert_eq!(store.version(), version);
}

#[test]
fn test_out_of_bounds_leaves_store_unchanged() {
    let mut store = sample_store();
    let version = store.version();

    assert!(matches!(
        store.set("p0-x", 20.0),
        Err(ReconError::OutOfBounds { .. })
    ));
    assert_eq!(store.get("p0-x").unwrap(), 4.0);
    assert_eq!(store.version(), version);

    // Declaring with an initial value outside the bounds fails too
    assert!(store
        .declare("p1-x", -1.0, Bounds::new(0.0, 16.0).unwrap())
        .is_err());
    assert!(!store.contains("p1-x"));
}

#[test]
fn test_set_vector_is_atomic() {
    let mut store = sample_store();

    // The second value is out of bounds, so nothing is written
    assert!(store.set_vector(&array![0.2, 17.0, 2.0]).is_err());
    assert_eq!(store.get_vector(), array![0.1, 4.0, 1.5]);

    // Wrong length
    assert!(matches!(
        store.set_vector(&array![0.2, 5.0]),
        Err(ReconError::ShapeMismatch(_))
    ));

    store.set_vector(&array![0.2, 5.0, 2.0]).unwrap();
    assert_eq!(store.get("bkg-level").unwrap(), 0.2);
    assert_eq!(store.get("p0-x").unwrap(), 5.0);
    assert_eq!(store.get("p0-a").unwrap(), 2.0);
}

#[test]
fn test_set_many_is_atomic() {
    let mut store = sample_store();
    let updates = vec![("bkg-level".to_string(), 0.3), ("p0-a".to_string(), 0.0)];
    assert!(store.set_many(&updates).is_err());
    assert_eq!(store.get("bkg-level").unwrap(), 0.1);
}

#[test]
fn test_push_and_pop_update() {
    let mut store = sample_store();
    store
        .push_update(&[("p0-x".to_string(), 6.0)])
        .unwrap();
    store
        .push_update(&[("p0-x".to_string(), 7.0), ("p0-a".to_string(), 2.5)])
        .unwrap();
    assert_eq!(store.stack_depth(), 2);
    assert_eq!(store.get("p0-x").unwrap(), 7.0);

    let restored = store.pop_update().unwrap().unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(store.get("p0-x").unwrap(), 6.0);
    assert_eq!(store.get("p0-a").unwrap(), 1.5);

    store.pop_update().unwrap();
    assert_eq!(store.get("p0-x").unwrap(), 4.0);
    assert!(store.pop_update().unwrap().is_none());
}

#[test]
fn test_vary_flags_and_versions() {
    let mut store = sample_store();
    let version = store.version();

    store.set_vary("bkg-level", false).unwrap();
    assert_eq!(store.varying_names(), vec!["p0-x", "p0-a"]);
    assert_eq!(store.version(), version);

    store.set("p0-x", 4.5).unwrap();
    assert!(store.version() > version);
}

#[test]
fn test_remove_shifts_positions() {
    let mut store = sample_store();
    let removed = store.remove("p0-x").unwrap();
    assert_eq!(removed.value(), 4.0);
    assert_eq!(store.position("p0-a").unwrap(), 1);
    assert!(store.remove("p0-x").is_err());
}

#[test]
fn test_serde_round_trip_rejects_duplicates() {
    let store = sample_store();
    let json = serde_json::to_string(&store).unwrap();
    let restored: ParameterStore = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.names(), store.names());
    assert_eq!(restored.get_vector(), store.get_vector());

    let params: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
    let doubled = serde_json::to_string(&vec![params[0].clone(), params[0].clone()]).unwrap();
    assert!(serde_json::from_str::<ParameterStore>(&doubled).is_err());
}
