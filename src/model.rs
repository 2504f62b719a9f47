//! Composite image model
//!
//! [`ImageModel`] owns the parameter store, the components, the current
//! rendered image and the difference cache. It combines component fields
//! with a [`CompositionRule`], applies the PSF, and keeps the rendered image
//! in sync with the store through full renders or region-restricted patches.
//!
//! Patch correctness rests on one property: every pixel is computed by the
//! same arithmetic whether it is rendered as part of the full frame or of a
//! small region. Component fields are pure per-pixel functions, fields of one
//! category are accumulated in component order, and the convolution reads a
//! fixed kernel footprint with zero padding at the frame edge.

use ndarray::Array3;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::DifferenceCache;
use crate::component::{Category, Component, RenderContext};
use crate::components::Particle;
use crate::convolve::{convolve_region, kernel_half_width};
use crate::error::{ReconError, Result};
use crate::evaluator::{default_evaluator, RegionEvaluator};
use crate::parameters::{ParameterStore, ParameterValues};
use crate::region::{Support, Tile};

/// How component fields combine into the pre-blur image
///
/// With illumination `I`, particles `P`, background `B` and blur `H`:
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionRule {
    /// Particles emit light: `H(I · P) + B`
    Emission,
    /// Particles exclude a fluorescent medium: `H(I · (1 − P)) + B`
    Exclusion,
    /// Everything adds before the blur: `H(I + P + B)`
    Additive,
}

/// The model image together with the store version it reflects
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub data: Array3<f64>,
    pub version: u64,
}

/// Result of a region-restricted re-render
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    /// Pixels that were re-rendered
    pub region: Tile,
    /// Model values over `region` before the patch
    pub old: Array3<f64>,
    /// Model values over `region` after the patch
    pub new: Array3<f64>,
}

/// Render counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderStats {
    pub full_renders: u64,
    pub patch_renders: u64,
    pub patched_pixels: u64,
}

/// Which component fields may be served from the difference cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheUse {
    All,
    Except(usize),
    Nothing,
}

impl CacheUse {
    fn allows(self, component: usize) -> bool {
        match self {
            CacheUse::All => true,
            CacheUse::Except(c) => c != component,
            CacheUse::Nothing => false,
        }
    }
}

/// Category sums over a padded tile
#[derive(Debug, Default)]
struct Fields {
    illumination: Option<Array3<f64>>,
    background: Option<Array3<f64>>,
    particles: Option<Array3<f64>>,
    /// Fields rendered from scratch, for re-priming the cache
    fresh: Vec<(usize, Arc<Array3<f64>>)>,
}

impl Fields {
    fn accumulate(slot: &mut Option<Array3<f64>>, field: &Array3<f64>) {
        match slot {
            Some(acc) => *acc += field,
            None => *slot = Some(field.clone()),
        }
    }
}

struct Composed {
    image: Array3<f64>,
    pad: Tile,
    fresh: Vec<(usize, Arc<Array3<f64>>)>,
}

/// Builder for [`ImageModel`]
#[derive(Debug)]
pub struct ImageModelBuilder {
    shape: [usize; 3],
    rule: CompositionRule,
    components: Vec<Box<dyn Component>>,
    evaluator: Option<Arc<dyn RegionEvaluator>>,
}

impl ImageModelBuilder {
    /// Start a model over a frame of `(z, y, x)` shape
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            shape,
            rule: CompositionRule::Emission,
            components: Vec::new(),
            evaluator: None,
        }
    }

    /// Set the composition rule
    pub fn rule(mut self, rule: CompositionRule) -> Self {
        self.rule = rule;
        self
    }

    /// Add a component
    pub fn component<C: Component + 'static>(mut self, component: C) -> Self {
        self.components.push(Box::new(component));
        self
    }

    /// Add an already boxed component
    pub fn boxed(mut self, component: Box<dyn Component>) -> Self {
        self.components.push(component);
        self
    }

    /// Use a specific region evaluator
    pub fn evaluator(mut self, evaluator: Arc<dyn RegionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Validate the composition and declare every component parameter
    ///
    /// Fails with `DuplicateParameter` if two components declare the same
    /// name, before anything is rendered.
    pub fn build(self) -> Result<ImageModel> {
        if self.shape.iter().any(|&n| n == 0) {
            return Err(ReconError::InvalidInput(format!(
                "Image shape must be non-empty, got {:?}",
                self.shape
            )));
        }

        let mut store = ParameterStore::new();
        let mut owners = HashMap::new();
        let mut psf = None;
        for (index, component) in self.components.iter().enumerate() {
            if component.category() == Category::Psf {
                if psf.is_some() {
                    return Err(ReconError::InvalidInput(
                        "A model accepts at most one PSF component".to_string(),
                    ));
                }
                psf = Some(index);
            }
            for param in component.initial_parameters()? {
                let name = param.name().to_string();
                store.declare_parameter(param)?;
                owners.insert(name, index);
            }
        }

        let frame = Tile::frame(self.shape);
        let evaluator = self.evaluator.unwrap_or_else(default_evaluator);
        let halo = match psf {
            Some(index) => {
                let declared = self.components[index].kernel_half_width();
                let ctx = RenderContext::new(&store, frame, evaluator.as_ref());
                let kernel = self.components[index].kernel(&ctx).ok_or_else(|| {
                    ReconError::InvalidInput("PSF component provides no kernel".to_string())
                })??;
                if kernel_half_width(&kernel)? != declared {
                    return Err(ReconError::ShapeMismatch(format!(
                        "PSF kernel of shape {:?} does not match its half-width {:?}",
                        kernel.dim(),
                        declared
                    )));
                }
                declared
            }
            None => [0; 3],
        };

        tracing::debug!(
            shape = ?self.shape,
            rule = ?self.rule,
            components = self.components.len(),
            parameters = store.len(),
            "Built image model"
        );

        Ok(ImageModel {
            frame,
            store,
            components: self.components,
            owners,
            rule: self.rule,
            psf,
            halo,
            evaluator,
            image: None,
            supports: HashMap::new(),
            cache: DifferenceCache::new(),
            stats: RenderStats::default(),
        })
    }
}

/// Forward model producing a synthetic image from the parameter store
#[derive(Debug)]
pub struct ImageModel {
    frame: Tile,
    store: ParameterStore,
    components: Vec<Box<dyn Component>>,
    owners: HashMap<String, usize>,
    rule: CompositionRule,
    psf: Option<usize>,
    halo: [usize; 3],
    evaluator: Arc<dyn RegionEvaluator>,
    image: Option<RenderedImage>,
    /// Supports as of the last render
    supports: HashMap<String, Support>,
    cache: DifferenceCache,
    stats: RenderStats,
}

impl ImageModel {
    /// Start building a model over a frame of `(z, y, x)` shape
    pub fn builder(shape: [usize; 3]) -> ImageModelBuilder {
        ImageModelBuilder::new(shape)
    }

    /// Frame shape
    pub fn shape(&self) -> [usize; 3] {
        self.frame.shape()
    }

    /// Full-frame tile
    pub fn frame(&self) -> Tile {
        self.frame
    }

    /// Parameter store (read-only; mutate through the model)
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Composition rule
    pub fn rule(&self) -> CompositionRule {
        self.rule
    }

    /// Components in composition order
    pub fn components(&self) -> &[Box<dyn Component>] {
        &self.components
    }

    /// PSF half-width used to dilate patch regions
    pub fn halo(&self) -> [usize; 3] {
        self.halo
    }

    /// Evaluator shared by all renders
    pub fn evaluator(&self) -> &dyn RegionEvaluator {
        self.evaluator.as_ref()
    }

    /// Difference cache
    pub fn cache(&self) -> &DifferenceCache {
        &self.cache
    }

    /// Render counters
    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Last rendered image, if any
    pub fn image(&self) -> Option<&RenderedImage> {
        self.image.as_ref()
    }

    /// Whether the rendered image reflects the current store
    pub fn is_current(&self) -> bool {
        self.image
            .as_ref()
            .map_or(false, |image| image.version == self.store.version())
    }

    /// Index of the component owning a parameter
    pub fn owner_of(&self, name: &str) -> Result<usize> {
        self.owners
            .get(name)
            .copied()
            .ok_or_else(|| ReconError::ParameterNotFound(name.to_string()))
    }

    /// Index of the first particle component
    pub fn particle_component(&self) -> Option<usize> {
        self.components
            .iter()
            .position(|c| c.as_particles().is_some())
    }

    /// Freeze or release a parameter for the optimizer
    pub fn set_vary(&mut self, name: &str, vary: bool) -> Result<()> {
        self.store.set_vary(name, vary)
    }

    /// Render the whole frame from scratch
    pub fn render_full(&mut self) -> Result<&RenderedImage> {
        let composed = self.compose(&self.store, &self.frame, CacheUse::Nothing)?;

        let mut supports = HashMap::with_capacity(self.owners.len());
        {
            let ctx = RenderContext::new(&self.store, self.frame, self.evaluator.as_ref());
            for (name, &owner) in &self.owners {
                supports.insert(name.clone(), self.components[owner].support(name, &ctx)?);
            }
        }
        self.supports = supports;
        self.cache.clear();
        self.prime_cache(&composed);

        self.stats.full_renders += 1;
        tracing::debug!(
            version = self.store.version(),
            pixels = self.frame.len(),
            "Full render"
        );

        Ok(self.image.insert(RenderedImage {
            data: composed.image,
            version: self.store.version(),
        }))
    }

    /// Current image, rendering the full frame first if it is stale
    pub fn render(&mut self) -> Result<&RenderedImage> {
        if !self.is_current() {
            self.render_full()?;
        }
        self.image
            .as_ref()
            .ok_or_else(|| ReconError::InvalidInput("Model has not been rendered".to_string()))
    }

    /// Re-render only the region affected by changes to `changed`
    ///
    /// The region is the union, over the changed parameters, of their
    /// supports before and after the change, dilated by the PSF half-width.
    /// The result is identical to a full render.
    pub fn render_patch(&mut self, changed: &[String]) -> Result<PatchOutcome> {
        let result = self.render_patch_inner(changed);
        if result.is_err() {
            self.image = None;
        }
        result
    }

    fn render_patch_inner(&mut self, changed: &[String]) -> Result<PatchOutcome> {
        if self.image.is_none() {
            return Err(ReconError::InvalidInput(
                "Model has not been rendered; call render_full first".to_string(),
            ));
        }

        let mut region = Tile::empty();
        let mut invalid = Vec::with_capacity(changed.len());
        {
            let ctx = RenderContext::new(&self.store, self.frame, self.evaluator.as_ref());
            for name in changed {
                let owner = self.owner_of(name)?;
                let before = self.supports.get(name).copied();
                let after = self.components[owner].support(name, &ctx)?;
                let tile = match (before, after) {
                    (Some(Support::Global), _) | (_, Support::Global) => self.frame,
                    (Some(old), new) => old.resolve(&self.frame).union(&new.resolve(&self.frame)),
                    (None, new) => new.resolve(&self.frame),
                };
                let dilated = tile.dilate(self.halo, &self.frame);
                region = region.union(&dilated);
                invalid.push((name.clone(), dilated));
            }
        }

        self.refresh_supports(changed)?;
        self.cache.invalidate(&invalid);
        self.repaint(region)
    }

    /// Set parameters and patch the image
    ///
    /// Out-of-bounds values are rejected before anything changes. If the
    /// patch fails, the previous values are restored and the image is
    /// dropped, so the next call must be a full render.
    pub fn update(&mut self, updates: &[(String, f64)]) -> Result<PatchOutcome> {
        self.require_image()?;
        let previous = self.current_values(updates)?;
        self.store.set_many(updates)?;
        let names: Vec<String> = updates.iter().map(|(name, _)| name.clone()).collect();
        self.patch_or_rollback(&names, |store| store.set_many(&previous))
    }

    /// Like [`update`](Self::update), remembering the previous values
    pub fn push_update(&mut self, updates: &[(String, f64)]) -> Result<PatchOutcome> {
        self.require_image()?;
        self.store.push_update(updates)?;
        let names: Vec<String> = updates.iter().map(|(name, _)| name.clone()).collect();
        self.patch_or_rollback(&names, |store| store.pop_update().map(|_| ()))
    }

    /// Undo the most recent [`push_update`](Self::push_update)
    pub fn pop_update(&mut self) -> Result<Option<PatchOutcome>> {
        self.require_image()?;
        let pending = match self.store.peek_update() {
            Some(previous) => self.current_values(previous)?,
            None => return Ok(None),
        };
        match self.store.pop_update()? {
            Some(restored) => {
                let names: Vec<String> = restored.into_iter().map(|(name, _)| name).collect();
                self.patch_or_rollback(&names, |store| store.push_update(&pending))
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    /// Add a particle to a particle component and patch the image
    ///
    /// Returns the new particle's id.
    pub fn add_particle(
        &mut self,
        component: usize,
        particle: Particle,
    ) -> Result<(usize, PatchOutcome)> {
        self.require_image()?;
        let set = self
            .components
            .get(component)
            .and_then(|c| c.as_particles())
            .ok_or_else(|| {
                ReconError::InvalidInput(format!("Component {} holds no particles", component))
            })?;
        let id = set.next_id();
        let params = set.particle_parameters(id, &particle)?;
        if let Some(existing) = params.iter().find(|p| self.store.contains(p.name())) {
            return Err(ReconError::DuplicateParameter(existing.name().to_string()));
        }

        let names: Vec<String> = params.iter().map(|p| p.name().to_string()).collect();
        for param in params {
            self.store.declare_parameter(param)?;
        }
        if let Some(set) = self.components[component].as_particles_mut() {
            set.insert(id);
        }
        for name in &names {
            self.owners.insert(name.clone(), component);
        }

        tracing::debug!(component, id, position = ?particle.position, "Added particle");
        match self.render_patch(&names) {
            Ok(outcome) => Ok((id, outcome)),
            Err(err) => {
                if let Some(set) = self.components[component].as_particles_mut() {
                    if let Err(undo) = set.remove(id) {
                        tracing::warn!(error = %undo, id, "Could not drop an unrendered particle");
                    }
                }
                for name in &names {
                    self.store.remove(name).ok();
                    self.owners.remove(name);
                    self.supports.remove(name);
                }
                self.cache.clear();
                Err(err)
            }
        }
    }

    /// Remove a particle and patch the image
    ///
    /// Returns the particle as it was before removal.
    pub fn remove_particle(
        &mut self,
        component: usize,
        id: usize,
    ) -> Result<(Particle, PatchOutcome)> {
        self.require_image()?;
        let set = self
            .components
            .get(component)
            .and_then(|c| c.as_particles())
            .ok_or_else(|| {
                ReconError::InvalidInput(format!("Component {} holds no particles", component))
            })?;
        if !set.contains(id) {
            return Err(ReconError::InvalidInput(format!("No particle with id {}", id)));
        }
        let particle = set.read(&self.store, id)?;

        let mut footprint = Tile::empty();
        let names = match self.components[component].as_particles_mut() {
            Some(set) => set.remove(id)?,
            None => Vec::new(),
        };
        for name in &names {
            if let Some(support) = self.supports.remove(name) {
                footprint = footprint.union(&support.resolve(&self.frame));
            }
            self.store.remove(name)?;
            self.owners.remove(name);
        }

        let region = footprint.dilate(self.halo, &self.frame);
        let invalid: Vec<(String, Tile)> = names.iter().map(|n| (n.clone(), region)).collect();
        self.cache.invalidate(&invalid);

        tracing::debug!(component, id, position = ?particle.position, "Removed particle");
        let outcome = self.repaint(region);
        if outcome.is_err() {
            self.image = None;
        }
        Ok((particle, outcome?))
    }

    /// Render `tile` for arbitrary parameter values without touching the
    /// stored image
    ///
    /// `changed` names the component whose parameters differ from the store
    /// in `params`; its field is always rendered fresh, the others may come
    /// from the difference cache.
    pub fn render_region(
        &self,
        params: &dyn ParameterValues,
        tile: &Tile,
        changed: Option<usize>,
    ) -> Result<Array3<f64>> {
        let cache_use = match changed {
            Some(component) => CacheUse::Except(component),
            None => CacheUse::All,
        };
        Ok(self.compose(params, tile, cache_use)?.image)
    }

    /// Output region affected by `name` when moving from the stored values to
    /// `params`
    pub fn affected_region(&self, name: &str, params: &dyn ParameterValues) -> Result<Tile> {
        let owner = self.owner_of(name)?;
        let ctx = RenderContext::new(params, self.frame, self.evaluator.as_ref());
        let after = self.components[owner].support(name, &ctx)?;
        let tile = match (self.supports.get(name), after) {
            (Some(Support::Global), _) | (_, Support::Global) => self.frame,
            (Some(before), after) => before
                .resolve(&self.frame)
                .union(&after.resolve(&self.frame)),
            (None, after) => after.resolve(&self.frame),
        };
        Ok(tile.dilate(self.halo, &self.frame))
    }

    /// Analytic derivative of the model image with respect to `name`
    ///
    /// Returns the affected region and the derivative over it, or `None` when
    /// the owning component has no closed form (callers fall back to finite
    /// differences).
    pub fn derivative_region(&self, name: &str) -> Result<Option<(Tile, Array3<f64>)>> {
        let owner = self.owner_of(name)?;
        let component = &self.components[owner];
        let category = component.category();
        if category == Category::Psf {
            return Ok(None);
        }

        let ctx = RenderContext::new(&self.store, self.frame, self.evaluator.as_ref());
        let region = component
            .support(name, &ctx)?
            .resolve(&self.frame)
            .dilate(self.halo, &self.frame);
        if region.is_empty() {
            return Ok(Some((region, Array3::zeros(region.dim()))));
        }
        let pad = region.dilate(self.halo, &self.frame);
        let dfield = match component.derivative(name, &ctx, &pad) {
            Some(result) => result?,
            None => return Ok(None),
        };

        let post_blur = category == Category::Background && self.rule != CompositionRule::Additive;
        if post_blur {
            return Ok(Some((region, region.view_in(&dfield, &pad).to_owned())));
        }

        let fields = self.fields_over(&self.store, &pad, CacheUse::All)?;
        let pre = match (self.rule, category) {
            (CompositionRule::Emission, Category::Illumination) => match &fields.particles {
                Some(p) => dfield * p,
                None => Array3::zeros(pad.dim()),
            },
            (CompositionRule::Emission, Category::Particles) => match &fields.illumination {
                Some(i) => dfield * i,
                None => dfield,
            },
            (CompositionRule::Exclusion, Category::Illumination) => match &fields.particles {
                Some(p) => dfield * &p.mapv(|v| 1.0 - v),
                None => dfield,
            },
            (CompositionRule::Exclusion, Category::Particles) => match &fields.illumination {
                Some(i) => -(dfield * i),
                None => -dfield,
            },
            _ => dfield,
        };

        Ok(Some((region, self.blur(&ctx, &pre, &pad, &region)?)))
    }

    /// Render and add Gaussian pixel noise, producing synthetic data
    pub fn synthesize<R: Rng + ?Sized>(&mut self, sigma: f64, rng: &mut R) -> Result<Array3<f64>> {
        let clean = self.render()?.data.clone();
        if sigma == 0.0 {
            return Ok(clean);
        }
        let noise = Normal::new(0.0, sigma)
            .map_err(|e| ReconError::InvalidInput(format!("Noise level {}: {}", sigma, e)))?;
        Ok(clean.mapv(|v| v + noise.sample(rng)))
    }

    /// Cached field of the component owning `name` over the parameter's
    /// support, rendering it on a miss
    pub fn cache_parameter(&mut self, name: &str) -> Result<Arc<Array3<f64>>> {
        let owner = self.owner_of(name)?;
        let frame = self.frame;
        let component = &self.components[owner];
        let store = &self.store;
        let evaluator = self.evaluator.as_ref();
        let entry = self.cache.get_or_render(name, || {
            let ctx = RenderContext::new(store, frame, evaluator);
            let tile = component.support(name, &ctx)?.resolve(&frame);
            Ok((owner, tile, component.render(&ctx, &tile)?))
        })?;
        Ok(entry.field)
    }

    /// Make sure every globally supported parameter has a valid cache entry
    ///
    /// Components render their whole-frame field at most once; the other
    /// global parameters of the same component share it. Returns the number
    /// of fields rendered.
    pub fn warm_cache(&mut self) -> Result<usize> {
        let mut rendered = 0;
        for owner in 0..self.components.len() {
            if self.components[owner].category() == Category::Psf {
                continue;
            }
            let global: Vec<String> = self.components[owner]
                .parameters()
                .into_iter()
                .filter(|name| matches!(self.supports.get(name), Some(Support::Global)))
                .collect();
            let Some(first) = global.first() else {
                continue;
            };
            let misses = self.cache.stats().misses;
            let field = self.cache_parameter(first)?;
            if self.cache.stats().misses > misses {
                rendered += 1;
            }
            for name in &global[1..] {
                if !self.cache.is_valid(name) {
                    self.cache
                        .insert(name, owner, self.frame, Arc::clone(&field));
                }
            }
        }
        Ok(rendered)
    }

    fn require_image(&self) -> Result<()> {
        match &self.image {
            Some(image) if image.version == self.store.version() => Ok(()),
            Some(_) => Err(ReconError::InvalidInput(
                "Rendered image is stale; call render_full first".to_string(),
            )),
            None => Err(ReconError::InvalidInput(
                "Model has not been rendered; call render_full first".to_string(),
            )),
        }
    }

    fn current_values(&self, updates: &[(String, f64)]) -> Result<Vec<(String, f64)>> {
        updates
            .iter()
            .map(|(name, _)| Ok((name.clone(), self.store.get(name)?)))
            .collect()
    }

    /// Patch the image for `changed`, undoing the store mutation on failure
    fn patch_or_rollback<F>(&mut self, changed: &[String], rollback: F) -> Result<PatchOutcome>
    where
        F: FnOnce(&mut ParameterStore) -> Result<()>,
    {
        let err = match self.render_patch(changed) {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        if let Err(restore) = rollback(&mut self.store) {
            tracing::warn!(error = %restore, "Could not restore parameters after a failed patch");
        }
        if let Err(restore) = self.refresh_supports(changed) {
            tracing::warn!(error = %restore, "Could not restore supports after a failed patch");
        }
        self.cache.clear();
        self.image = None;
        tracing::debug!(error = %err, "Patch failed; parameters restored");
        Err(err)
    }

    fn refresh_supports(&mut self, changed: &[String]) -> Result<()> {
        let ctx = RenderContext::new(&self.store, self.frame, self.evaluator.as_ref());
        for name in changed {
            let owner = self.owner_of(name)?;
            let component = &self.components[owner];
            for coupled in component.coupled(name) {
                let support = component.support(&coupled, &ctx)?;
                self.supports.insert(coupled, support);
            }
        }
        Ok(())
    }

    fn repaint(&mut self, region: Tile) -> Result<PatchOutcome> {
        let composed = self.compose(&self.store, &region, CacheUse::All)?;
        let version = self.store.version();
        let frame = self.frame;
        let image = self
            .image
            .as_mut()
            .ok_or_else(|| ReconError::InvalidInput("Model has not been rendered".to_string()))?;

        let old = region.view_in(&image.data, &frame).to_owned();
        region
            .view_in_mut(&mut image.data, &frame)
            .assign(&composed.image);
        image.version = version;

        self.stats.patch_renders += 1;
        self.stats.patched_pixels += region.len() as u64;
        tracing::trace!(region = ?region, pixels = region.len(), "Patched image");

        self.prime_cache(&composed);
        Ok(PatchOutcome {
            region,
            old,
            new: composed.image,
        })
    }

    /// Store whole-frame fields of globally supported components
    fn prime_cache(&mut self, composed: &Composed) {
        if composed.pad != self.frame {
            return;
        }
        for (component, field) in &composed.fresh {
            for name in self.components[*component].parameters() {
                if matches!(self.supports.get(&name), Some(Support::Global)) {
                    self.cache
                        .insert(&name, *component, self.frame, Arc::clone(field));
                }
            }
        }
    }

    fn fields_over(
        &self,
        params: &dyn ParameterValues,
        pad: &Tile,
        cache_use: CacheUse,
    ) -> Result<Fields> {
        let ctx = RenderContext::new(params, self.frame, self.evaluator.as_ref());
        let mut fields = Fields::default();

        for (index, component) in self.components.iter().enumerate() {
            let category = component.category();
            if category == Category::Psf {
                continue;
            }

            let cached = if cache_use.allows(index) {
                self.cache.covering(index, pad)
            } else {
                None
            };
            let field = match cached {
                Some((field, tile)) => Arc::new(pad.view_in(&field, &tile).to_owned()),
                None => {
                    let field = Arc::new(component.render(&ctx, pad)?);
                    fields.fresh.push((index, Arc::clone(&field)));
                    field
                }
            };

            let slot = match category {
                Category::Illumination => &mut fields.illumination,
                Category::Background => &mut fields.background,
                Category::Particles => &mut fields.particles,
                Category::Psf => continue,
            };
            Fields::accumulate(slot, &field);
        }
        Ok(fields)
    }

    fn compose(
        &self,
        params: &dyn ParameterValues,
        out: &Tile,
        cache_use: CacheUse,
    ) -> Result<Composed> {
        let pad = out.dilate(self.halo, &self.frame);
        let fields = self.fields_over(params, &pad, cache_use)?;
        let ones = || Array3::from_elem(pad.dim(), 1.0);

        let (pre, post) = match self.rule {
            CompositionRule::Emission => {
                let pre = match (&fields.illumination, &fields.particles) {
                    (Some(i), Some(p)) => i * p,
                    (None, Some(p)) => p.clone(),
                    _ => Array3::zeros(pad.dim()),
                };
                (pre, fields.background.as_ref())
            }
            CompositionRule::Exclusion => {
                let hole = match &fields.particles {
                    Some(p) => p.mapv(|v| 1.0 - v),
                    None => ones(),
                };
                let pre = match &fields.illumination {
                    Some(i) => i * &hole,
                    None => hole,
                };
                (pre, fields.background.as_ref())
            }
            CompositionRule::Additive => {
                let mut pre = Array3::zeros(pad.dim());
                for field in [&fields.illumination, &fields.particles, &fields.background]
                    .into_iter()
                    .flatten()
                {
                    pre += field;
                }
                (pre, None)
            }
        };

        let ctx = RenderContext::new(params, self.frame, self.evaluator.as_ref());
        let mut image = self.blur(&ctx, &pre, &pad, out)?;
        if let Some(background) = post {
            image += &out.view_in(background, &pad);
        }

        Ok(Composed {
            image,
            pad,
            fresh: fields.fresh,
        })
    }

    fn blur(
        &self,
        ctx: &RenderContext<'_>,
        pre: &Array3<f64>,
        pad: &Tile,
        out: &Tile,
    ) -> Result<Array3<f64>> {
        match self.psf {
            Some(index) => {
                let kernel = self.components[index].kernel(ctx).ok_or_else(|| {
                    ReconError::InvalidInput("PSF component provides no kernel".to_string())
                })??;
                convolve_region(pre, pad, &kernel, out, &self.frame, ctx.evaluator)
            }
            None => Ok(out.view_in(pre, pad).to_owned()),
        }
    }
}
