//! Sparse Jacobian of the weighted model image.
//!
//! Each column holds `w · ∂model/∂p` over the region the parameter can
//! affect, so `JᵀJ` and `Jᵀr` only touch overlapping tiles. Finite-difference
//! columns are rendered against a [`Perturbed`] view of the store and never
//! mutate the shared model, which lets them run concurrently.

use ndarray::{Array1, Array2, Array3, Zip};

use super::config::JacobianMethod;
use crate::cost::CostEvaluator;
use crate::error::{ReconError, Result};
use crate::model::ImageModel;
use crate::parameters::Perturbed;
use crate::region::Tile;
use crate::state::ImageState;

/// Caller-supplied Jacobian.
pub type JacobianFn = dyn Fn(&ImageState<'_>, &[String]) -> Result<Jacobian> + Send + Sync;

/// Weighted derivative of the model image with respect to one parameter.
#[derive(Debug, Clone)]
pub struct JacobianColumn {
    /// Region outside which the derivative is zero
    pub region: Tile,
    /// `w · ∂model/∂p` over `region`
    pub values: Array3<f64>,
}

impl JacobianColumn {
    /// A column that is zero everywhere.
    pub fn zero() -> Self {
        Self {
            region: Tile::empty(),
            values: Array3::zeros((0, 0, 0)),
        }
    }
}

/// Jacobian stored column by column.
#[derive(Debug, Clone)]
pub struct Jacobian {
    frame: Tile,
    names: Vec<String>,
    columns: Vec<JacobianColumn>,
}

impl Jacobian {
    /// Assemble a Jacobian over `frame`.
    ///
    /// Every column's values must match its region, which must lie inside
    /// the frame.
    pub fn new(frame: Tile, names: Vec<String>, columns: Vec<JacobianColumn>) -> Result<Self> {
        if names.len() != columns.len() {
            return Err(ReconError::ShapeMismatch(format!(
                "{} names for {} Jacobian columns",
                names.len(),
                columns.len()
            )));
        }
        for (name, column) in names.iter().zip(&columns) {
            if column.values.dim() != column.region.dim() || !frame.contains(&column.region) {
                return Err(ReconError::ShapeMismatch(format!(
                    "Jacobian column '{}' of shape {:?} does not fit region {:?}",
                    name,
                    column.values.dim(),
                    column.region
                )));
            }
        }
        Ok(Self {
            frame,
            names,
            columns,
        })
    }

    /// Parameter names in column order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The columns.
    pub fn columns(&self) -> &[JacobianColumn] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// `JᵀJ`, summing only over overlapping column regions.
    pub fn jtj(&self) -> Array2<f64> {
        let n = self.columns.len();
        let mut jtj = Array2::zeros((n, n));
        for i in 0..n {
            let a = &self.columns[i];
            for j in i..n {
                let b = &self.columns[j];
                let overlap = a.region.intersect(&b.region);
                if overlap.is_empty() {
                    continue;
                }
                let va = overlap.view_in(&a.values, &a.region);
                let vb = overlap.view_in(&b.values, &b.region);
                let dot = Zip::from(&va).and(&vb).fold(0.0, |acc, &x, &y| acc + x * y);
                jtj[[i, j]] = dot;
                jtj[[j, i]] = dot;
            }
        }
        jtj
    }

    /// `Jᵀr` for a full-frame weighted residual.
    pub fn jtr(&self, residual: &Array3<f64>) -> Result<Array1<f64>> {
        if residual.dim() != self.frame.dim() {
            return Err(ReconError::ShapeMismatch(format!(
                "Residual of shape {:?} does not match frame {:?}",
                residual.dim(),
                self.frame.dim()
            )));
        }
        Ok(self
            .columns
            .iter()
            .map(|column| {
                if column.region.is_empty() {
                    return 0.0;
                }
                let r = column.region.view_in(residual, &self.frame);
                Zip::from(&column.values)
                    .and(&r)
                    .fold(0.0, |acc, &j, &r| acc + j * r)
            })
            .collect())
    }

    /// Dense `pixels × parameters` matrix in row-major pixel order.
    pub fn to_dense(&self) -> Array2<f64> {
        let [_, ny, nx] = self.frame.shape();
        let mut dense = Array2::zeros((self.frame.len(), self.columns.len()));
        for (col, column) in self.columns.iter().enumerate() {
            for ((z, y, x), &v) in column.values.indexed_iter() {
                let [z0, y0, x0] = column.region.lo;
                let row = ((z + z0) * ny + (y + y0)) * nx + (x + x0);
                dense[[row, col]] = v;
            }
        }
        dense
    }
}

/// Compute the Jacobian of the state's model for `names`.
///
/// # Arguments
///
/// * `state` - The fit state; its image must be current
/// * `names` - Parameters, one column each
/// * `method` - Finite differences or analytic derivatives
/// * `fd_step` - Relative finite-difference step
/// * `parallel` - Evaluate columns concurrently when the `parallel` feature is on
pub fn compute(
    state: &ImageState<'_>,
    names: &[String],
    method: JacobianMethod,
    fd_step: f64,
    parallel: bool,
) -> Result<Jacobian> {
    let model = state.model();
    let evaluator = state.evaluator();
    let base = state.image()?;

    let columns = map_columns(names, parallel, |name| match method {
        JacobianMethod::Analytic => match analytic_column(model, evaluator, name)? {
            Some(column) => Ok(column),
            None => fd_column(model, evaluator, base, name, fd_step),
        },
        JacobianMethod::FiniteDifference => fd_column(model, evaluator, base, name, fd_step),
        JacobianMethod::Custom => Err(ReconError::InvalidInput(
            "Custom Jacobian requested without a Jacobian function".to_string(),
        )),
    })?;

    Jacobian::new(model.frame(), names.to_vec(), columns)
}

#[cfg(feature = "parallel")]
fn map_columns<F>(names: &[String], parallel: bool, f: F) -> Result<Vec<JacobianColumn>>
where
    F: Fn(&String) -> Result<JacobianColumn> + Sync + Send,
{
    use rayon::prelude::*;

    if parallel && names.len() > 1 {
        names.par_iter().map(&f).collect()
    } else {
        names.iter().map(f).collect()
    }
}

#[cfg(not(feature = "parallel"))]
fn map_columns<F>(names: &[String], _parallel: bool, f: F) -> Result<Vec<JacobianColumn>>
where
    F: Fn(&String) -> Result<JacobianColumn>,
{
    names.iter().map(f).collect()
}

/// Forward difference, stepping backwards when the forward step would leave
/// the parameter's bounds.
fn fd_column(
    model: &ImageModel,
    evaluator: &CostEvaluator,
    base: &Array3<f64>,
    name: &str,
    fd_step: f64,
) -> Result<JacobianColumn> {
    let store = model.store();
    let value = store.get(name)?;
    let bounds = store.bounds(name)?;
    let h = fd_step * value.abs().max(1.0);
    let h = if bounds.is_within_bounds(value + h) {
        h
    } else if bounds.is_within_bounds(value - h) {
        -h
    } else {
        return Err(ReconError::InvalidInput(format!(
            "Bounds of '{}' are too narrow for a finite-difference step of {:e}",
            name, h
        )));
    };

    let shifted = Perturbed::new(store, name, value + h);
    let region = model.affected_region(name, &shifted)?;
    if region.is_empty() {
        return Ok(JacobianColumn::zero());
    }
    let owner = model.owner_of(name)?;
    let rendered = model.render_region(&shifted, &region, Some(owner))?;

    let frame = model.frame();
    let mut values = rendered - &region.view_in(base, &frame);
    values /= h;
    if let Some(w) = evaluator.weights_in(&region) {
        values *= &w;
    }
    Ok(JacobianColumn { region, values })
}

fn analytic_column(
    model: &ImageModel,
    evaluator: &CostEvaluator,
    name: &str,
) -> Result<Option<JacobianColumn>> {
    let Some((region, mut values)) = model.derivative_region(name)? else {
        return Ok(None);
    };
    if let Some(w) = evaluator.weights_in(&region) {
        values *= &w;
    }
    Ok(Some(JacobianColumn { region, values }))
}
