//! Read-only parameter views used while rendering.
//!
//! Components read values through [`ParameterValues`] so that scratch
//! evaluations (finite-difference Jacobian columns) can override a single
//! value without cloning or mutating the shared store.

use crate::error::Result;
use crate::parameters::store::ParameterStore;

/// Source of parameter values by name
pub trait ParameterValues: Sync {
    /// Current value of the named parameter
    fn value(&self, name: &str) -> Result<f64>;
}

impl ParameterValues for ParameterStore {
    fn value(&self, name: &str) -> Result<f64> {
        self.get(name)
    }
}

/// A store with one parameter temporarily replaced
#[derive(Debug, Clone, Copy)]
pub struct Perturbed<'a> {
    base: &'a ParameterStore,
    name: &'a str,
    value: f64,
}

impl<'a> Perturbed<'a> {
    /// View `base` as if `name` had `value`
    ///
    /// The override is not bounds checked; callers pick perturbations inside
    /// the parameter's bounds.
    pub fn new(base: &'a ParameterStore, name: &'a str, value: f64) -> Self {
        Self { base, name, value }
    }
}

impl ParameterValues for Perturbed<'_> {
    fn value(&self, name: &str) -> Result<f64> {
        if name == self.name {
            Ok(self.value)
        } else {
            self.base.get(name)
        }
    }
}
