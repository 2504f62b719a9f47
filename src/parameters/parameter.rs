//! Parameter definition
//!
//! A `Parameter` is a named scalar with optional bounds. Values are only
//! changed through the [`ParameterStore`](super::ParameterStore) update API.

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::parameters::bounds::Bounds;

/// A named scalar parameter of the forward model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Name of the parameter, unique across the whole model
    name: String,

    /// Current value of the parameter
    value: f64,

    /// Minimum and maximum bounds for the parameter value
    bounds: Bounds,

    /// Whether this parameter is varied by the optimizer
    vary: bool,
}

impl Parameter {
    /// Create a new unbounded, varying parameter
    ///
    /// # Examples
    ///
    /// ```
    /// use reconfit_rs::parameters::Parameter;
    ///
    /// let param = Parameter::new("bkg-level", 0.1);
    /// assert_eq!(param.name(), "bkg-level");
    /// assert_eq!(param.value(), 0.1);
    /// assert!(param.vary());
    /// ```
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            bounds: Bounds::default(),
            vary: true,
        }
    }

    /// Create a new parameter with bounds
    ///
    /// Fails with `InvalidBounds` when `min > max` and with `OutOfBounds` when
    /// `value` lies outside `[min, max]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use reconfit_rs::parameters::Parameter;
    ///
    /// let param = Parameter::with_bounds("p0-a", 3.0, 0.5, 10.0).unwrap();
    /// assert_eq!(param.bounds().min, 0.5);
    /// assert!(Parameter::with_bounds("p0-a", 30.0, 0.5, 10.0).is_err());
    /// ```
    pub fn with_bounds(name: &str, value: f64, min: f64, max: f64) -> Result<Self> {
        let bounds = Bounds::new(min, max).map_err(|_| ReconError::InvalidBounds {
            name: name.to_string(),
            min,
            max,
        })?;
        bounds.check(name, value)?;

        Ok(Self {
            name: name.to_string(),
            value,
            bounds,
            vary: true,
        })
    }

    /// Builder-style helper to freeze the parameter
    pub fn fixed(mut self) -> Self {
        self.vary = false;
        self
    }

    /// Get the name of the parameter
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current value of the parameter
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Get the bounds of the parameter
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Check if the parameter is varied during optimization
    pub fn vary(&self) -> bool {
        self.vary
    }

    /// Validate a candidate value against this parameter's bounds
    pub fn check(&self, value: f64) -> Result<()> {
        self.bounds.check(&self.name, value)
    }

    // Only the store writes values, after validating them.
    pub(crate) fn assign(&mut self, value: f64) {
        self.value = value;
    }

    pub(crate) fn set_vary(&mut self, vary: bool) {
        self.vary = vary;
    }
}
