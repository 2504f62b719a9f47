//! Fit state: a model paired with the data it is fitted to
//!
//! [`ImageState`] keeps the data cost in step with the model image. Every
//! update goes through the model's patch path and the cost is patched with
//! the old and new values of the re-rendered region, so pricing a tentative
//! step never needs a full render.

use ndarray::{Array1, Array3};

use crate::components::Particle;
use crate::cost::{CostEvaluator, Regularization};
use crate::error::{ReconError, Result};
use crate::model::{ImageModel, PatchOutcome};
use crate::parameters::ParameterStore;
use crate::region::Tile;

/// Outcome of a state update
#[derive(Debug, Clone)]
pub struct ParameterUpdate {
    /// Region of the image that was re-rendered
    pub region: Tile,
    /// Model values over `region` before the update
    pub previous: Array3<f64>,
    /// New model values over `region`
    pub patched: Array3<f64>,
    /// Total cost after the update
    pub cost: f64,
    /// Change in total cost
    pub cost_delta: f64,
}

/// A model together with the observed image and its current cost
#[derive(Debug)]
pub struct ImageState<'m> {
    model: &'m mut ImageModel,
    evaluator: CostEvaluator,
    data_cost: f64,
}

impl<'m> ImageState<'m> {
    /// Pair a model with an evaluator, rendering the model if needed
    pub fn new(model: &'m mut ImageModel, evaluator: CostEvaluator) -> Result<Self> {
        if model.shape() != evaluator.shape() {
            return Err(ReconError::ShapeMismatch(format!(
                "Model shape {:?} does not match observed image {:?}",
                model.shape(),
                evaluator.shape()
            )));
        }
        let data_cost = evaluator.data_cost(&model.render()?.data)?;
        Ok(Self {
            model,
            evaluator,
            data_cost,
        })
    }

    /// The underlying model
    pub fn model(&self) -> &ImageModel {
        &*self.model
    }

    /// The parameter store
    pub fn store(&self) -> &ParameterStore {
        self.model.store()
    }

    /// The cost evaluator
    pub fn evaluator(&self) -> &CostEvaluator {
        &self.evaluator
    }

    /// Replace the regularization term of the cost
    pub fn set_regularization(&mut self, regularization: Regularization) -> Result<()> {
        self.evaluator.set_regularization(regularization)
    }

    /// Current model image
    pub fn image(&self) -> Result<&Array3<f64>> {
        self.model
            .image()
            .map(|image| &image.data)
            .ok_or_else(|| ReconError::InvalidInput("Model has not been rendered".to_string()))
    }

    /// Data term of the cost
    pub fn data_cost(&self) -> f64 {
        self.data_cost
    }

    /// Regularization term of the cost
    pub fn regularization_cost(&self) -> f64 {
        self.evaluator.regularization().value(self.model.store())
    }

    /// Total cost
    pub fn cost(&self) -> f64 {
        self.data_cost + self.regularization_cost()
    }

    /// Weighted residual image
    pub fn residuals(&self) -> Result<Array3<f64>> {
        self.evaluator.residuals(self.image()?)
    }

    /// Gaussian log-likelihood of the current fit for pixel noise `sigma`
    pub fn log_likelihood(&self, sigma: f64) -> Result<f64> {
        self.evaluator.log_likelihood(self.data_cost, sigma)
    }

    /// Set several parameters at once
    pub fn update(&mut self, updates: &[(String, f64)]) -> Result<ParameterUpdate> {
        self.track(|model| model.update(updates))
    }

    /// Set a single parameter
    pub fn update_parameter(&mut self, name: &str, value: f64) -> Result<ParameterUpdate> {
        self.update(&[(name.to_string(), value)])
    }

    /// Set the named parameters, touching only those whose value changes
    pub fn set_values(&mut self, names: &[String], values: &Array1<f64>) -> Result<ParameterUpdate> {
        if names.len() != values.len() {
            return Err(ReconError::ShapeMismatch(format!(
                "Expected {} values for the named parameters, got {}",
                names.len(),
                values.len()
            )));
        }
        let store = self.model.store();
        let mut updates = Vec::new();
        for (name, &value) in names.iter().zip(values.iter()) {
            if store.get(name)? != value {
                updates.push((name.clone(), value));
            }
        }
        if updates.is_empty() {
            return Ok(ParameterUpdate {
                region: Tile::empty(),
                previous: Array3::zeros((0, 0, 0)),
                patched: Array3::zeros((0, 0, 0)),
                cost: self.cost(),
                cost_delta: 0.0,
            });
        }
        self.update(&updates)
    }

    /// Apply an update that [`pop_update`](Self::pop_update) can undo
    pub fn push_update(&mut self, updates: &[(String, f64)]) -> Result<ParameterUpdate> {
        self.track(|model| model.push_update(updates))
    }

    /// Undo the most recent [`push_update`](Self::push_update)
    pub fn pop_update(&mut self) -> Result<Option<ParameterUpdate>> {
        let before = self.cost();
        match self.model.pop_update() {
            Ok(Some(outcome)) => self.apply(before, outcome).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(self.recover(err)),
        }
    }

    /// Run `f` with `updates` applied, restoring the previous values after
    pub fn temp_update<T, F>(&mut self, updates: &[(String, f64)], f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.push_update(updates)?;
        let result = f(self);
        self.pop_update()?;
        result
    }

    /// Add a particle, returning its id
    pub fn add_particle(
        &mut self,
        component: usize,
        particle: Particle,
    ) -> Result<(usize, ParameterUpdate)> {
        let before = self.cost();
        let (id, outcome) = self
            .model
            .add_particle(component, particle)
            .map_err(|err| self.recover(err))?;
        Ok((id, self.apply(before, outcome)?))
    }

    /// Remove a particle, returning it as it was
    pub fn remove_particle(
        &mut self,
        component: usize,
        id: usize,
    ) -> Result<(Particle, ParameterUpdate)> {
        let before = self.cost();
        let (particle, outcome) = self
            .model
            .remove_particle(component, id)
            .map_err(|err| self.recover(err))?;
        Ok((particle, self.apply(before, outcome)?))
    }

    /// Freeze or release a parameter for the optimizer
    pub fn set_vary(&mut self, name: &str, vary: bool) -> Result<()> {
        self.model.set_vary(name, vary)
    }

    /// Fill the difference cache for globally supported parameters
    pub fn warm_cache(&mut self) -> Result<usize> {
        self.model.warm_cache()
    }

    /// Render the full frame and recompute the cost from scratch
    ///
    /// Returns the drift between the patched and recomputed data cost.
    pub fn refresh(&mut self) -> Result<f64> {
        let data_cost = self.evaluator.data_cost(&self.model.render_full()?.data)?;
        let drift = data_cost - self.data_cost;
        self.data_cost = data_cost;
        tracing::trace!(drift, "Refreshed image state");
        Ok(drift)
    }

    fn track<F>(&mut self, f: F) -> Result<ParameterUpdate>
    where
        F: FnOnce(&mut ImageModel) -> Result<PatchOutcome>,
    {
        let before = self.cost();
        let outcome = f(&mut *self.model).map_err(|err| self.recover(err))?;
        self.apply(before, outcome)
    }

    /// Re-render after a failed patch so the image and cost match the
    /// restored parameters again
    fn recover(&mut self, err: ReconError) -> ReconError {
        if self.model.image().is_none() {
            if let Err(refresh) = self.refresh() {
                self.data_cost = f64::NAN;
                tracing::warn!(error = %refresh, "Could not re-render after a failed update");
            }
        }
        err
    }

    fn apply(&mut self, before: f64, outcome: PatchOutcome) -> Result<ParameterUpdate> {
        self.data_cost =
            self.evaluator
                .patch_cost(self.data_cost, &outcome.region, &outcome.old, &outcome.new)?;
        let cost = self.cost();
        Ok(ParameterUpdate {
            region: outcome.region,
            previous: outcome.old,
            patched: outcome.new,
            cost,
            cost_delta: cost - before,
        })
    }
}
