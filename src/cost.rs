//! Residual and cost evaluation
//!
//! The data cost is `Σ (w · (observed − predicted))²`. It can be recomputed
//! from a full image or patched from the old and new values of a re-rendered
//! region, which is how the optimizer prices a step without a full render.

use ndarray::{Array1, Array3, ArrayView3, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ReconError, Result};
use crate::parameters::ParameterStore;
use crate::region::Tile;

/// Optional penalty added to the data cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Regularization {
    /// No penalty
    #[default]
    None,
    /// `lambda · Σ (p − prior)²` over the parameters that have a prior
    Ridge {
        lambda: f64,
        priors: BTreeMap<String, f64>,
    },
    /// Log barrier `−strength · Σ (ln(p − lo) + ln(hi − p))` over finite bounds
    BoundPenalty { strength: f64 },
}

impl Regularization {
    /// Ridge penalty pulling every parameter toward its current value
    pub fn ridge_from_store(lambda: f64, store: &ParameterStore) -> Self {
        Regularization::Ridge {
            lambda,
            priors: store
                .iter()
                .map(|p| (p.name().to_string(), p.value()))
                .collect(),
        }
    }

    /// Reject negative or non-finite strengths
    pub fn validate(&self) -> Result<()> {
        let strength = match self {
            Regularization::None => return Ok(()),
            Regularization::Ridge { lambda, .. } => *lambda,
            Regularization::BoundPenalty { strength } => *strength,
        };
        if strength.is_finite() && strength >= 0.0 {
            Ok(())
        } else {
            Err(ReconError::InvalidInput(format!(
                "Regularization strength must be finite and non-negative, got {}",
                strength
            )))
        }
    }

    /// Penalty value for the current store
    ///
    /// A bound penalty is infinite on or outside a finite bound.
    pub fn value(&self, store: &ParameterStore) -> f64 {
        match self {
            Regularization::None => 0.0,
            Regularization::Ridge { lambda, priors } => {
                lambda
                    * priors
                        .iter()
                        .filter_map(|(name, prior)| store.get(name).ok().map(|v| (v - prior).powi(2)))
                        .sum::<f64>()
            }
            Regularization::BoundPenalty { strength } => {
                let mut total = 0.0;
                for param in store.iter() {
                    let bounds = param.bounds();
                    let value = param.value();
                    if bounds.has_lower_bound() {
                        let gap = value - bounds.min;
                        if gap <= 0.0 {
                            return f64::INFINITY;
                        }
                        total -= gap.ln();
                    }
                    if bounds.has_upper_bound() {
                        let gap = bounds.max - value;
                        if gap <= 0.0 {
                            return f64::INFINITY;
                        }
                        total -= gap.ln();
                    }
                }
                strength * total
            }
        }
    }

    /// Gradient and Hessian diagonal of the penalty with respect to `names`
    pub fn derivatives(
        &self,
        store: &ParameterStore,
        names: &[String],
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let n = names.len();
        let mut gradient = Array1::zeros(n);
        let mut curvature = Array1::zeros(n);

        match self {
            Regularization::None => {}
            Regularization::Ridge { lambda, priors } => {
                for (i, name) in names.iter().enumerate() {
                    if let Some(prior) = priors.get(name) {
                        gradient[i] = 2.0 * lambda * (store.get(name)? - prior);
                        curvature[i] = 2.0 * lambda;
                    }
                }
            }
            Regularization::BoundPenalty { strength } => {
                for (i, name) in names.iter().enumerate() {
                    let bounds = store.bounds(name)?;
                    let value = store.get(name)?;
                    if bounds.has_lower_bound() {
                        let gap = (value - bounds.min).max(f64::MIN_POSITIVE);
                        gradient[i] -= strength / gap;
                        curvature[i] += strength / (gap * gap);
                    }
                    if bounds.has_upper_bound() {
                        let gap = (bounds.max - value).max(f64::MIN_POSITIVE);
                        gradient[i] += strength / gap;
                        curvature[i] += strength / (gap * gap);
                    }
                }
            }
        }
        Ok((gradient, curvature))
    }
}

/// Compares predicted images against the observed data
#[derive(Debug, Clone)]
pub struct CostEvaluator {
    observed: Array3<f64>,
    weights: Option<Array3<f64>>,
    regularization: Regularization,
}

impl CostEvaluator {
    /// Create an evaluator for `observed` with optional per-pixel weights
    ///
    /// Weights must match the observed shape and be finite and non-negative;
    /// a zero weight masks a pixel out.
    pub fn new(observed: Array3<f64>, weights: Option<Array3<f64>>) -> Result<Self> {
        if let Some(w) = &weights {
            if w.dim() != observed.dim() {
                return Err(ReconError::ShapeMismatch(format!(
                    "Weights of shape {:?} do not match observed image {:?}",
                    w.dim(),
                    observed.dim()
                )));
            }
            if w.iter().any(|&v| !(v.is_finite() && v >= 0.0)) {
                return Err(ReconError::InvalidInput(
                    "Weights must be finite and non-negative".to_string(),
                ));
            }
        }
        if observed.iter().any(|v| !v.is_finite()) {
            return Err(ReconError::InvalidInput(
                "Observed image contains non-finite values".to_string(),
            ));
        }
        Ok(Self {
            observed,
            weights,
            regularization: Regularization::None,
        })
    }

    /// Add a regularization term
    pub fn with_regularization(mut self, regularization: Regularization) -> Result<Self> {
        self.set_regularization(regularization)?;
        Ok(self)
    }

    /// Replace the regularization term
    pub fn set_regularization(&mut self, regularization: Regularization) -> Result<()> {
        regularization.validate()?;
        self.regularization = regularization;
        Ok(())
    }

    /// Observed image
    pub fn observed(&self) -> &Array3<f64> {
        &self.observed
    }

    /// Per-pixel weights, if any
    pub fn weights(&self) -> Option<&Array3<f64>> {
        self.weights.as_ref()
    }

    /// Configured regularization
    pub fn regularization(&self) -> &Regularization {
        &self.regularization
    }

    /// Frame shape of the observed image
    pub fn shape(&self) -> [usize; 3] {
        let (z, y, x) = self.observed.dim();
        [z, y, x]
    }

    /// Number of pixels that contribute to the cost
    pub fn pixel_count(&self) -> usize {
        match &self.weights {
            Some(w) => w.iter().filter(|&&v| v > 0.0).count(),
            None => self.observed.len(),
        }
    }

    /// Data cost of a full predicted image
    pub fn data_cost(&self, predicted: &Array3<f64>) -> Result<f64> {
        self.check_shape(predicted.dim())?;
        Ok(self.region_cost(&Tile::frame(self.shape()), predicted.view()))
    }

    /// Data cost plus regularization
    pub fn full_cost(&self, predicted: &Array3<f64>, store: &ParameterStore) -> Result<f64> {
        Ok(self.data_cost(predicted)? + self.regularization.value(store))
    }

    /// Update a data cost after `region` changed from `old` to `new`
    ///
    /// Equivalent to [`data_cost`](Self::data_cost) of the patched image up to
    /// summation order.
    pub fn patch_cost(
        &self,
        previous: f64,
        region: &Tile,
        old: &Array3<f64>,
        new: &Array3<f64>,
    ) -> Result<f64> {
        if !Tile::frame(self.shape()).contains(region) {
            return Err(ReconError::ShapeMismatch(format!(
                "Region {:?} lies outside the observed frame {:?}",
                region,
                self.shape()
            )));
        }
        for sub in [old, new] {
            if sub.dim() != region.dim() {
                return Err(ReconError::ShapeMismatch(format!(
                    "Sub-image of shape {:?} does not match region {:?}",
                    sub.dim(),
                    region.dim()
                )));
            }
        }
        Ok(previous - self.region_cost(region, old.view()) + self.region_cost(region, new.view()))
    }

    /// Weighted residual `w · (observed − predicted)`
    pub fn residuals(&self, predicted: &Array3<f64>) -> Result<Array3<f64>> {
        self.check_shape(predicted.dim())?;
        let mut residual = &self.observed - predicted;
        if let Some(w) = &self.weights {
            residual *= w;
        }
        Ok(residual)
    }

    /// Weights over a region, if any
    pub fn weights_in(&self, region: &Tile) -> Option<ArrayView3<'_, f64>> {
        let frame = Tile::frame(self.shape());
        self.weights.as_ref().map(|w| region.view_in(w, &frame))
    }

    /// Gaussian log-likelihood of a data cost with pixel noise `sigma`
    pub fn log_likelihood(&self, data_cost: f64, sigma: f64) -> Result<f64> {
        if !(sigma > 0.0) {
            return Err(ReconError::InvalidInput(format!(
                "Noise level must be positive, got {}",
                sigma
            )));
        }
        let n = self.pixel_count() as f64;
        Ok(-0.5 * data_cost / (sigma * sigma)
            - n * (sigma * (2.0 * std::f64::consts::PI).sqrt()).ln())
    }

    fn region_cost(&self, region: &Tile, predicted: ArrayView3<'_, f64>) -> f64 {
        let frame = Tile::frame(self.shape());
        let observed = region.view_in(&self.observed, &frame);
        match self.weights_in(region) {
            Some(w) => Zip::from(&observed)
                .and(&predicted)
                .and(&w)
                .fold(0.0, |acc, &o, &p, &wt| acc + (wt * (o - p)).powi(2)),
            None => Zip::from(&observed)
                .and(&predicted)
                .fold(0.0, |acc, &o, &p| acc + (o - p).powi(2)),
        }
    }

    fn check_shape(&self, dim: (usize, usize, usize)) -> Result<()> {
        if dim != self.observed.dim() {
            return Err(ReconError::ShapeMismatch(format!(
                "Predicted image of shape {:?} does not match observed {:?}",
                dim,
                self.observed.dim()
            )));
        }
        Ok(())
    }
}
