//! Parameter store implementation
//!
//! The `ParameterStore` is the single source of truth for the model state: an
//! ordered vector of named parameters with a name index kept in sync, a
//! monotonic version counter consumed by the difference cache, and an undo
//! stack for tentative updates.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ReconError, Result};
use crate::parameters::bounds::Bounds;
use crate::parameters::parameter::Parameter;

/// Ordered collection of named model parameters
///
/// The ordered vector view (`get_vector`/`set_vector`) and the name-indexed
/// view (`get`/`set`) always agree, and no two parameters share a name.
/// Every successful mutation bumps [`version`](Self::version); failed
/// mutations leave the store untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "Vec<Parameter>", try_from = "Vec<Parameter>")]
pub struct ParameterStore {
    /// Parameters in declaration order
    params: Vec<Parameter>,

    /// Name -> position in `params`
    index: HashMap<String, usize>,

    /// Monotonic mutation counter
    version: u64,

    /// Saved (name, previous value) sets for `pop_update`
    stack: Vec<Vec<(String, f64)>>,
}

impl ParameterStore {
    /// Create a new empty store
    ///
    /// # Examples
    ///
    /// ```
    /// use reconfit_rs::parameters::ParameterStore;
    ///
    /// let store = ParameterStore::new();
    /// assert!(store.is_empty());
    /// assert_eq!(store.version(), 0);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new parameter
    ///
    /// # Arguments
    ///
    /// * `name` - Unique name of the parameter
    /// * `initial` - Initial value, which must respect `bounds`
    /// * `bounds` - Allowed range
    ///
    /// # Returns
    ///
    /// The position of the new parameter in the ordered vector, or
    /// `DuplicateParameter` if the name is already declared
    ///
    /// # Examples
    ///
    /// ```
    /// use reconfit_rs::parameters::{Bounds, ParameterStore};
    ///
    /// let mut store = ParameterStore::new();
    /// store.declare("p0-x", 4.0, Bounds::new(0.0, 16.0).unwrap()).unwrap();
    /// assert!(store.declare("p0-x", 5.0, Bounds::unbounded()).is_err());
    /// assert_eq!(store.get("p0-x").unwrap(), 4.0);
    /// ```
    pub fn declare(&mut self, name: &str, initial: f64, bounds: Bounds) -> Result<usize> {
        let param = Parameter::with_bounds(name, initial, bounds.min, bounds.max)?;
        self.declare_parameter(param)
    }

    /// Declare an already constructed parameter (keeps its `vary` flag)
    pub fn declare_parameter(&mut self, param: Parameter) -> Result<usize> {
        if self.index.contains_key(param.name()) {
            return Err(ReconError::DuplicateParameter(param.name().to_string()));
        }
        param.check(param.value())?;

        let position = self.params.len();
        self.index.insert(param.name().to_string(), position);
        self.params.push(param);
        self.version += 1;

        Ok(position)
    }

    /// Remove a parameter, returning it
    ///
    /// Positions of the parameters declared after it shift down by one.
    pub fn remove(&mut self, name: &str) -> Result<Parameter> {
        let position = self.position(name)?;
        let param = self.params.remove(position);
        self.rebuild_index();
        self.version += 1;

        Ok(param)
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the store holds no parameters
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Whether a parameter with the given name exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Current mutation version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Position of a parameter in the ordered vector
    pub fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ReconError::ParameterNotFound(name.to_string()))
    }

    /// Look up a parameter record by name
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Iterate over the parameters in order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Parameter names in order
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name().to_string()).collect()
    }

    /// Names of the parameters the optimizer may vary, in order
    pub fn varying_names(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.vary())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Get the current value of a parameter
    pub fn get(&self, name: &str) -> Result<f64> {
        Ok(self.params[self.position(name)?].value())
    }

    /// Get the bounds of a parameter
    pub fn bounds(&self, name: &str) -> Result<Bounds> {
        Ok(self.params[self.position(name)?].bounds())
    }

    /// Set a single parameter value
    ///
    /// Fails with `OutOfBounds` (store unchanged) when the value violates the
    /// parameter's bounds.
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        let position = self.position(name)?;
        self.params[position].check(value)?;
        self.params[position].assign(value);
        self.version += 1;
        Ok(())
    }

    /// Set several parameters at once; either all are applied or none.
    pub fn set_many(&mut self, updates: &[(String, f64)]) -> Result<()> {
        let mut positions = Vec::with_capacity(updates.len());
        for (name, value) in updates {
            let position = self.position(name)?;
            self.params[position].check(*value)?;
            positions.push(position);
        }

        for (position, (_, value)) in positions.into_iter().zip(updates) {
            self.params[position].assign(*value);
        }
        if !updates.is_empty() {
            self.version += 1;
        }
        Ok(())
    }

    /// Ordered snapshot of all parameter values
    pub fn get_vector(&self) -> Array1<f64> {
        self.params.iter().map(|p| p.value()).collect()
    }

    /// Replace all parameter values
    ///
    /// Validates the length (`ShapeMismatch`) and every value
    /// (`OutOfBounds`) before writing anything.
    pub fn set_vector(&mut self, values: &Array1<f64>) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(ReconError::ShapeMismatch(format!(
                "Expected {} parameter values, got {}",
                self.params.len(),
                values.len()
            )));
        }

        for (param, &value) in self.params.iter().zip(values.iter()) {
            param.check(value)?;
        }
        for (param, &value) in self.params.iter_mut().zip(values.iter()) {
            param.assign(value);
        }
        self.version += 1;
        Ok(())
    }

    /// Values of the named parameters, in the order given
    pub fn get_values(&self, names: &[String]) -> Result<Array1<f64>> {
        names.iter().map(|name| self.get(name)).collect()
    }

    /// Set the named parameters (atomic, like [`set_many`](Self::set_many))
    pub fn set_values(&mut self, names: &[String], values: &Array1<f64>) -> Result<()> {
        if names.len() != values.len() {
            return Err(ReconError::ShapeMismatch(format!(
                "Expected {} values for the named parameters, got {}",
                names.len(),
                values.len()
            )));
        }
        let updates: Vec<(String, f64)> = names.iter().cloned().zip(values.iter().copied()).collect();
        self.set_many(&updates)
    }

    /// Freeze or release a parameter for the optimizer
    ///
    /// This does not change any value, so the version is left alone.
    pub fn set_vary(&mut self, name: &str, vary: bool) -> Result<()> {
        let position = self.position(name)?;
        self.params[position].set_vary(vary);
        Ok(())
    }

    /// Apply an update while remembering the previous values
    pub fn push_update(&mut self, updates: &[(String, f64)]) -> Result<()> {
        let previous = updates
            .iter()
            .map(|(name, _)| Ok((name.clone(), self.get(name)?)))
            .collect::<Result<Vec<_>>>()?;
        self.set_many(updates)?;
        self.stack.push(previous);
        Ok(())
    }

    /// Undo the most recent `push_update`, returning the restored values
    pub fn pop_update(&mut self) -> Result<Option<Vec<(String, f64)>>> {
        match self.stack.pop() {
            Some(previous) => {
                self.set_many(&previous)?;
                Ok(Some(previous))
            }
            None => Ok(None),
        }
    }

    /// Values the next `pop_update` would restore
    pub fn peek_update(&self) -> Option<&[(String, f64)]> {
        self.stack.last().map(|previous| previous.as_slice())
    }

    /// Number of pending `push_update` entries
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name().to_string(), i))
            .collect();
    }
}

impl From<ParameterStore> for Vec<Parameter> {
    fn from(store: ParameterStore) -> Self {
        store.params
    }
}

impl TryFrom<Vec<Parameter>> for ParameterStore {
    type Error = ReconError;

    fn try_from(params: Vec<Parameter>) -> Result<Self> {
        let mut store = ParameterStore::new();
        for param in params {
            store.declare_parameter(param)?;
        }
        Ok(store)
    }
}
