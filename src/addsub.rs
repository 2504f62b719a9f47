//! Adding missing particles and removing spurious ones.
//!
//! Candidates are found as local maxima of the residual image. Each candidate
//! is added, optionally refined with a short local fit, and then put through
//! the same removal test as existing particles: a particle stays only if
//! taking it out would raise the cost by at least
//! `max(im_change_frac · Σ(w·Δimage)², min_derr)`.

use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::components::{Particle, ParticleField, ParticleSet};
use crate::error::{ReconError, Result};
use crate::lm::{FitConfig, LevenbergMarquardt};
use crate::model::CompositionRule;
use crate::region::Tile;
use crate::state::{ImageState, ParameterUpdate};

/// Tuning for particle addition and removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddSubOptions {
    /// Fraction of the image change a removal must cost to keep the particle.
    /// Default: 0.2
    pub im_change_frac: f64,

    /// Minimum cost increase that keeps a particle. Default: 0
    pub min_derr: f64,

    /// Look for dark features instead of bright ones; inferred from the
    /// composition rule when unset
    pub invert: Option<bool>,

    /// Minimum summed residual of a candidate; defaults to 30% of the
    /// candidate's nominal area or volume
    pub min_mass: Option<f64>,

    /// Candidates tried per round. Default: 20
    pub tries: usize,

    /// Refine candidate positions and amplitudes before the removal test.
    /// Default: true
    pub optimize: bool,

    /// Accepted steps allowed in each candidate refinement. Default: 2
    pub opt_iterations: usize,

    /// Add/remove rounds in [`add_subtract`]. Default: 5
    pub max_rounds: usize,

    /// Particles smaller than this are removed unconditionally. Default: 0
    pub min_radius: f64,

    /// Particles larger than this are removed unconditionally. Default: infinite
    pub max_radius: f64,
}

impl Default for AddSubOptions {
    fn default() -> Self {
        Self {
            im_change_frac: 0.2,
            min_derr: 0.0,
            invert: None,
            min_mass: None,
            tries: 20,
            optimize: true,
            opt_iterations: 2,
            max_rounds: 5,
            min_radius: 0.0,
            max_radius: f64::INFINITY,
        }
    }
}

impl AddSubOptions {
    /// Require a removal to cost at least three noise standard deviations.
    pub fn with_noise(mut self, sigma: f64) -> Self {
        self.min_derr = 3.0 * sigma;
        self
    }
}

/// A candidate particle location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    /// Mass-weighted center in `(z, y, x)`
    pub position: [f64; 3],
    /// Summed positive signal in the window around the maximum
    pub mass: f64,
}

/// Outcome of a removal test.
#[derive(Debug, Clone)]
pub struct RemovalCheck {
    /// Whether the particle was left out of the model
    pub removed: bool,
    /// The particle as it was before the test
    pub particle: Particle,
    /// Id of the particle after the test, if it was kept (re-added under a new id)
    pub id: Option<usize>,
    /// Cost without the particle minus cost with it
    pub cost_change: f64,
}

/// Counts from one or more add/remove rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddSubReport {
    pub added: usize,
    pub removed: usize,
    pub rounds: usize,
}

/// Local maxima of the residual image, largest mass first.
///
/// # Arguments
///
/// * `residuals` - Weighted residual image
/// * `radius` - Expected feature radius in pixels; sets the search window
/// * `invert` - Search for minima (dark features) instead of maxima
/// * `min_mass` - Candidates with less summed signal are dropped
pub fn feature_guess(
    residuals: &Array3<f64>,
    radius: f64,
    invert: bool,
    min_mass: f64,
) -> Vec<Feature> {
    let signal = if invert {
        residuals.mapv(|v| -v)
    } else {
        residuals.clone()
    };
    let (nz, ny, nx) = signal.dim();
    let frame = Tile::frame([nz, ny, nx]);
    let half = radius.max(0.5).ceil() as usize;

    let mut features = Vec::new();
    for ((z, y, x), &peak) in signal.indexed_iter() {
        if peak <= 0.0 {
            continue;
        }
        let window = Tile::new([z, y, x], [z + 1, y + 1, x + 1]).dilate([half; 3], &frame);
        let view = window.view_in(&signal, &frame);
        if view.iter().any(|&v| v > peak) {
            continue;
        }

        let mut mass = 0.0;
        let mut center = [0.0; 3];
        for ((dz, dy, dx), &v) in view.indexed_iter() {
            if v > 0.0 {
                mass += v;
                center[0] += v * (window.lo[0] + dz) as f64;
                center[1] += v * (window.lo[1] + dy) as f64;
                center[2] += v * (window.lo[2] + dx) as f64;
            }
        }
        if mass < min_mass || mass <= 0.0 {
            continue;
        }
        let position = [center[0] / mass, center[1] / mass, center[2] / mass];
        // Plateaus produce one maximum per pixel; keep the first
        if features
            .iter()
            .any(|f: &Feature| (0..3).all(|a| (f.position[a] - position[a]).abs() < 0.5))
        {
            continue;
        }
        features.push(Feature { position, mass });
    }

    features.sort_by(|a, b| b.mass.total_cmp(&a.mass));
    features
}

/// Remove particle `id` unless doing so raises the cost enough.
///
/// Kept particles are re-added with their previous geometry under a new id.
pub fn check_remove_particle(
    state: &mut ImageState<'_>,
    component: usize,
    id: usize,
    options: &AddSubOptions,
) -> Result<RemovalCheck> {
    let present = state.cost();
    let (particle, update) = state.remove_particle(component, id)?;
    let absent = update.cost;
    let im_change = weighted_change(state, &update);

    let threshold = (options.im_change_frac * im_change).max(options.min_derr);
    if absent - present >= threshold {
        let (new_id, _) = state.add_particle(component, particle)?;
        Ok(RemovalCheck {
            removed: false,
            particle,
            id: Some(new_id),
            cost_change: absent - present,
        })
    } else {
        tracing::info!(
            component,
            id,
            position = ?particle.position,
            radius = particle.radius,
            cost_before = present,
            cost_after = absent,
            "Removed particle"
        );
        Ok(RemovalCheck {
            removed: true,
            particle,
            id: None,
            cost_change: absent - present,
        })
    }
}

/// Try adding a particle at each guessed position.
///
/// Returns the ids of the particles that survived the removal test.
pub fn check_add_particles(
    state: &mut ImageState<'_>,
    component: usize,
    guesses: &[[f64; 3]],
    radius: f64,
    amplitude: f64,
    options: &AddSubOptions,
) -> Result<Vec<usize>> {
    let refine = LevenbergMarquardt::with_config(FitConfig {
        max_iterations: options.opt_iterations,
        initial_lambda: 1.0,
        compute_uncertainties: false,
        ..FitConfig::default()
    });

    let mut accepted = Vec::new();
    for &position in guesses {
        let before = state.cost();
        let candidate = Particle {
            position,
            radius,
            amplitude,
        };
        let (id, _) = state.add_particle(component, candidate)?;

        if options.optimize && options.opt_iterations > 0 {
            let names = refinable_names(state, component, id)?;
            let fit = refine.fit_subset(state, &names)?;
            tracing::trace!(id, status = %fit.status, "Refined candidate particle");
        }

        let check = check_remove_particle(state, component, id, options)?;
        if let Some(kept) = check.id {
            tracing::info!(
                component,
                id = kept,
                position = ?check.particle.position,
                cost_before = before,
                cost_after = state.cost(),
                "Added particle"
            );
            accepted.push(kept);
        }
    }
    Ok(accepted)
}

/// Remove particles whose radius lies outside the configured range, then
/// test the remaining ones one by one.
///
/// Returns the number of particles removed.
pub fn remove_bad_particles(
    state: &mut ImageState<'_>,
    component: usize,
    options: &AddSubOptions,
) -> Result<usize> {
    let mut removed = 0;
    for (id, particle) in particles_of(state, component)? {
        if particle.radius < options.min_radius || particle.radius > options.max_radius {
            state.remove_particle(component, id)?;
            tracing::info!(id, radius = particle.radius, "Removed particle of implausible size");
            removed += 1;
        }
    }

    let mut remaining = particles_of(state, component)?;
    remaining.sort_by(|a, b| a.1.radius.total_cmp(&b.1.radius));
    for (id, _) in remaining.into_iter().take(options.tries) {
        if check_remove_particle(state, component, id, options)?.removed {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Alternate removal and addition rounds until nothing changes.
pub fn add_subtract(
    state: &mut ImageState<'_>,
    component: usize,
    options: &AddSubOptions,
) -> Result<AddSubReport> {
    let invert = options
        .invert
        .unwrap_or(state.model().rule() == CompositionRule::Exclusion);
    let planar = state.model().shape()[0] == 1;

    let mut report = AddSubReport::default();
    for _ in 0..options.max_rounds {
        report.rounds += 1;
        let removed = remove_bad_particles(state, component, options)?;

        let existing = particles_of(state, component)?;
        let radius = median(existing.iter().map(|(_, p)| p.radius)).unwrap_or(2.0);
        let amplitude = median(existing.iter().map(|(_, p)| p.amplitude)).unwrap_or(1.0);
        let min_mass = options.min_mass.unwrap_or_else(|| {
            if planar {
                0.3 * std::f64::consts::PI * radius * radius
            } else {
                0.3 * 4.0 / 3.0 * std::f64::consts::PI * radius.powi(3)
            }
        });

        let residuals = state.residuals()?;
        let guesses: Vec<[f64; 3]> = feature_guess(&residuals, radius, invert, min_mass)
            .into_iter()
            .take(options.tries)
            .map(|f| f.position)
            .collect();
        let added = check_add_particles(state, component, &guesses, radius, amplitude, options)?
            .len();

        tracing::info!(round = report.rounds, added, removed, cost = state.cost(), "Add/subtract round");
        report.added += added;
        report.removed += removed;
        if added == 0 && removed == 0 {
            break;
        }
    }
    Ok(report)
}

fn particle_set<'a>(state: &'a ImageState<'_>, component: usize) -> Result<&'a ParticleSet> {
    state
        .model()
        .components()
        .get(component)
        .and_then(|c| c.as_particles())
        .ok_or_else(|| {
            ReconError::InvalidInput(format!("Component {} holds no particles", component))
        })
}

fn particles_of(state: &ImageState<'_>, component: usize) -> Result<Vec<(usize, Particle)>> {
    particle_set(state, component)?.particles(state.store())
}

/// Position and amplitude names of a particle; the radius is left alone.
fn refinable_names(state: &ImageState<'_>, component: usize, id: usize) -> Result<Vec<String>> {
    let set = particle_set(state, component)?;
    let radius = set.parameter_name(id, ParticleField::Radius);
    Ok(set
        .names_of(id)
        .into_iter()
        .filter(|name| *name != radius)
        .collect())
}

fn weighted_change(state: &ImageState<'_>, update: &ParameterUpdate) -> f64 {
    if update.region.is_empty() {
        return 0.0;
    }
    match state.evaluator().weights_in(&update.region) {
        Some(w) => Zip::from(&update.patched)
            .and(&update.previous)
            .and(&w)
            .fold(0.0, |acc, &n, &o, &wt| acc + (wt * (n - o)).powi(2)),
        None => Zip::from(&update.patched)
            .and(&update.previous)
            .fold(0.0, |acc, &n, &o| acc + (n - o).powi(2)),
    }
}

fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}
