//! Particle collections
//!
//! Each particle owns five parameters named `{prefix}{id}-{z,y,x,a,amp}`
//! (the `z` coordinate is omitted for planar sets). A particle's footprint is
//! truncated at a fixed multiple of its size and renormalized so the field
//! goes continuously to zero at the cutoff; this keeps each particle's support
//! local, which is what makes patch rendering cheap.

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::component::{Category, Component, RenderContext};
use crate::error::{ReconError, Result};
use crate::parameters::{Parameter, ParameterValues};
use crate::region::{Support, Tile};

/// Smallest allowed particle size
pub const MIN_RADIUS: f64 = 1e-3;

/// Geometry and brightness of a single particle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Center in `(z, y, x)` pixel coordinates
    pub position: [f64; 3],
    /// Size (Gaussian width or sphere radius) in pixels
    pub radius: f64,
    /// Peak contribution
    pub amplitude: f64,
}

impl Particle {
    /// A particle in a planar image
    pub fn planar(y: f64, x: f64, radius: f64, amplitude: f64) -> Self {
        Self {
            position: [0.0, y, x],
            radius,
            amplitude,
        }
    }
}

/// Radial profile of a particle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParticleShape {
    /// `exp(-d² / 2a²)`, truncated at `cutoff * a`
    Gaussian,
    /// Smoothed ball `(1 - tanh((d - a) / edge)) / 2`, truncated at
    /// `a + cutoff * edge`
    Sphere { edge: f64 },
}

/// Parameter slot of a particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticleField {
    Z,
    Y,
    X,
    Radius,
    Amplitude,
}

impl ParticleField {
    fn suffix(self) -> &'static str {
        match self {
            ParticleField::Z => "z",
            ParticleField::Y => "y",
            ParticleField::X => "x",
            ParticleField::Radius => "a",
            ParticleField::Amplitude => "amp",
        }
    }
}

/// A set of particles sharing one profile
#[derive(Debug, Clone)]
pub struct ParticleSet {
    prefix: String,
    shape: ParticleShape,
    cutoff: f64,
    planar: bool,
    ids: Vec<usize>,
    next_id: usize,
    initial: Vec<(usize, Particle)>,
    lookup: HashMap<String, (usize, ParticleField)>,
}

impl ParticleSet {
    /// Create a set from initial particles, which get ids `0..n`
    pub fn new(shape: ParticleShape, particles: Vec<Particle>) -> Result<Self> {
        if let ParticleShape::Sphere { edge } = shape {
            if !(edge > 0.0) {
                return Err(ReconError::InvalidInput(format!(
                    "Sphere edge width must be positive, got {}",
                    edge
                )));
            }
        }
        let mut set = Self {
            prefix: "p".to_string(),
            shape,
            cutoff: 3.0,
            planar: false,
            ids: Vec::new(),
            next_id: 0,
            initial: Vec::new(),
            lookup: HashMap::new(),
        };
        for particle in particles {
            let id = set.next_id();
            set.particle_parameters(id, &particle)?;
            set.initial.push((id, particle));
            set.insert(id);
        }
        Ok(set)
    }

    /// Treat the set as two-dimensional: no `z` parameters, all particles in
    /// plane `z = 0`
    pub fn planar(mut self) -> Self {
        self.planar = true;
        self.rebuild_lookup();
        self
    }

    /// Use a different parameter-name prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self.rebuild_lookup();
        self
    }

    /// Truncation radius in units of the profile's length scale
    pub fn with_cutoff(mut self, cutoff: f64) -> Result<Self> {
        if !(cutoff > 0.0) {
            return Err(ReconError::InvalidInput(format!(
                "Particle cutoff must be positive, got {}",
                cutoff
            )));
        }
        self.cutoff = cutoff;
        Ok(self)
    }

    /// Particle ids in rendering order
    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    /// Number of particles
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether a particle with this id exists
    pub fn contains(&self, id: usize) -> bool {
        self.ids.contains(&id)
    }

    /// Id the next added particle will receive
    pub fn next_id(&self) -> usize {
        self.next_id
    }

    /// Particle id owning a parameter name
    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).map(|&(id, _)| id)
    }

    /// Parameter name of one slot of a particle
    pub fn parameter_name(&self, id: usize, field: ParticleField) -> String {
        format!("{}{}-{}", self.prefix, id, field.suffix())
    }

    /// Parameter names of a particle
    pub fn names_of(&self, id: usize) -> Vec<String> {
        self.fields()
            .iter()
            .map(|&field| self.parameter_name(id, field))
            .collect()
    }

    /// Parameter declarations for a particle with the given id
    pub fn particle_parameters(&self, id: usize, particle: &Particle) -> Result<Vec<Parameter>> {
        let mut params = Vec::with_capacity(5);
        if !self.planar {
            params.push(Parameter::new(
                &self.parameter_name(id, ParticleField::Z),
                particle.position[0],
            ));
        }
        params.push(Parameter::new(
            &self.parameter_name(id, ParticleField::Y),
            particle.position[1],
        ));
        params.push(Parameter::new(
            &self.parameter_name(id, ParticleField::X),
            particle.position[2],
        ));
        params.push(Parameter::with_bounds(
            &self.parameter_name(id, ParticleField::Radius),
            particle.radius,
            MIN_RADIUS,
            f64::INFINITY,
        )?);
        params.push(Parameter::new(
            &self.parameter_name(id, ParticleField::Amplitude),
            particle.amplitude,
        ));

        for p in &params {
            p.check(p.value())?;
        }
        Ok(params)
    }

    /// Read a particle's current geometry
    pub fn read(&self, params: &dyn ParameterValues, id: usize) -> Result<Particle> {
        let z = if self.planar {
            0.0
        } else {
            params.value(&self.parameter_name(id, ParticleField::Z))?
        };
        Ok(Particle {
            position: [
                z,
                params.value(&self.parameter_name(id, ParticleField::Y))?,
                params.value(&self.parameter_name(id, ParticleField::X))?,
            ],
            radius: params.value(&self.parameter_name(id, ParticleField::Radius))?,
            amplitude: params.value(&self.parameter_name(id, ParticleField::Amplitude))?,
        })
    }

    /// All particles with their ids
    pub fn particles(&self, params: &dyn ParameterValues) -> Result<Vec<(usize, Particle)>> {
        self.ids
            .iter()
            .map(|&id| Ok((id, self.read(params, id)?)))
            .collect()
    }

    /// Pixels a particle can touch
    pub fn footprint(&self, particle: &Particle, frame: &Tile) -> Tile {
        let extent = self.extent(particle.radius);
        let radius = if self.planar {
            [0.0, extent, extent]
        } else {
            [extent; 3]
        };
        Tile::around(particle.position, radius, frame)
    }

    pub(crate) fn insert(&mut self, id: usize) {
        self.ids.push(id);
        self.next_id = self.next_id.max(id + 1);
        for field in self.fields() {
            let name = self.parameter_name(id, field);
            self.lookup.insert(name, (id, field));
        }
    }

    pub(crate) fn remove(&mut self, id: usize) -> Result<Vec<String>> {
        let position = self
            .ids
            .iter()
            .position(|&i| i == id)
            .ok_or_else(|| ReconError::InvalidInput(format!("No particle with id {}", id)))?;
        self.ids.remove(position);
        let names = self.names_of(id);
        for name in &names {
            self.lookup.remove(name);
        }
        Ok(names)
    }

    fn fields(&self) -> Vec<ParticleField> {
        let mut fields = Vec::with_capacity(5);
        if !self.planar {
            fields.push(ParticleField::Z);
        }
        fields.extend([
            ParticleField::Y,
            ParticleField::X,
            ParticleField::Radius,
            ParticleField::Amplitude,
        ]);
        fields
    }

    fn rebuild_lookup(&mut self) {
        self.lookup.clear();
        for id in self.ids.clone() {
            for field in self.fields() {
                let name = self.parameter_name(id, field);
                self.lookup.insert(name, (id, field));
            }
        }
    }

    fn extent(&self, radius: f64) -> f64 {
        match self.shape {
            ParticleShape::Gaussian => self.cutoff * radius,
            ParticleShape::Sphere { edge } => radius + self.cutoff * edge,
        }
    }

    /// Profile value at the cutoff, subtracted so the field is continuous
    fn floor(&self) -> f64 {
        match self.shape {
            ParticleShape::Gaussian => (-0.5 * self.cutoff * self.cutoff).exp(),
            ParticleShape::Sphere { .. } => 0.5 * (1.0 - self.cutoff.tanh()),
        }
    }

    fn offsets(&self, particle: &Particle, pixel: [usize; 3]) -> [f64; 3] {
        let mut offsets = [0.0; 3];
        for axis in 0..3 {
            offsets[axis] = pixel[axis] as f64 - particle.position[axis];
        }
        if self.planar {
            offsets[0] = 0.0;
        }
        offsets
    }

    /// Unit-amplitude profile at a pixel
    fn profile(&self, particle: &Particle, pixel: [usize; 3]) -> f64 {
        let o = self.offsets(particle, pixel);
        let d2 = o[0] * o[0] + o[1] * o[1] + o[2] * o[2];
        let extent = self.extent(particle.radius);
        if d2 > extent * extent {
            return 0.0;
        }
        let t = self.floor();
        let a = particle.radius;
        let raw = match self.shape {
            ParticleShape::Gaussian => (-d2 / (2.0 * a * a)).exp(),
            ParticleShape::Sphere { edge } => 0.5 * (1.0 - ((d2.sqrt() - a) / edge).tanh()),
        };
        ((raw - t) / (1.0 - t)).max(0.0)
    }

    fn value_at(&self, particle: &Particle, pixel: [usize; 3]) -> f64 {
        particle.amplitude * self.profile(particle, pixel)
    }

    fn derivative_at(&self, particle: &Particle, field: ParticleField, pixel: [usize; 3]) -> f64 {
        if field == ParticleField::Amplitude {
            return self.profile(particle, pixel);
        }
        let o = self.offsets(particle, pixel);
        let d2 = o[0] * o[0] + o[1] * o[1] + o[2] * o[2];
        let extent = self.extent(particle.radius);
        if d2 > extent * extent {
            return 0.0;
        }
        let scale = particle.amplitude / (1.0 - self.floor());
        let a = particle.radius;

        match self.shape {
            ParticleShape::Gaussian => {
                let g = (-d2 / (2.0 * a * a)).exp();
                match field {
                    ParticleField::Z => scale * g * o[0] / (a * a),
                    ParticleField::Y => scale * g * o[1] / (a * a),
                    ParticleField::X => scale * g * o[2] / (a * a),
                    ParticleField::Radius => scale * g * d2 / (a * a * a),
                    ParticleField::Amplitude => 0.0,
                }
            }
            ParticleShape::Sphere { edge } => {
                let d = d2.sqrt();
                let th = ((d - a) / edge).tanh();
                // -ds/dd
                let slope = 0.5 * (1.0 - th * th) / edge;
                let radial = |offset: f64| if d > 0.0 { slope * offset / d } else { 0.0 };
                let unit = match field {
                    ParticleField::Z => radial(o[0]),
                    ParticleField::Y => radial(o[1]),
                    ParticleField::X => radial(o[2]),
                    ParticleField::Radius => slope,
                    ParticleField::Amplitude => 0.0,
                };
                scale * unit
            }
        }
    }
}

impl Component for ParticleSet {
    fn label(&self) -> &str {
        "particles"
    }

    fn category(&self) -> Category {
        Category::Particles
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        let mut params = Vec::new();
        for (id, particle) in &self.initial {
            if self.contains(*id) {
                params.extend(self.particle_parameters(*id, particle)?);
            }
        }
        Ok(params)
    }

    fn parameters(&self) -> Vec<String> {
        self.ids.iter().flat_map(|&id| self.names_of(id)).collect()
    }

    fn coupled(&self, name: &str) -> Vec<String> {
        match self.id_of(name) {
            Some(id) => self.names_of(id),
            None => vec![name.to_string()],
        }
    }

    fn support(&self, name: &str, ctx: &RenderContext<'_>) -> Result<Support> {
        let &(id, _) = self
            .lookup
            .get(name)
            .ok_or_else(|| ReconError::ParameterNotFound(name.to_string()))?;
        let particle = self.read(ctx.params, id)?;
        Ok(Support::Local(self.footprint(&particle, &ctx.frame)))
    }

    fn render(&self, ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>> {
        let mut out = Array3::zeros(tile.dim());
        for &id in &self.ids {
            let particle = self.read(ctx.params, id)?;
            let overlap = self.footprint(&particle, &ctx.frame).intersect(tile);
            if overlap.is_empty() {
                continue;
            }
            let patch = ctx
                .evaluator
                .evaluate(&overlap, &|pixel| self.value_at(&particle, pixel))?;
            let mut view = overlap.view_in_mut(&mut out, tile);
            view += &patch;
        }
        Ok(out)
    }

    fn derivative(
        &self,
        name: &str,
        ctx: &RenderContext<'_>,
        tile: &Tile,
    ) -> Option<Result<Array3<f64>>> {
        let &(id, field) = self.lookup.get(name)?;
        let compute = || -> Result<Array3<f64>> {
            let particle = self.read(ctx.params, id)?;
            let mut out = Array3::zeros(tile.dim());
            let overlap = self.footprint(&particle, &ctx.frame).intersect(tile);
            if !overlap.is_empty() {
                let patch = ctx.evaluator.evaluate(&overlap, &|pixel| {
                    self.derivative_at(&particle, field, pixel)
                })?;
                overlap.view_in_mut(&mut out, tile).assign(&patch);
            }
            Ok(out)
        };
        Some(compute())
    }

    fn as_particles(&self) -> Option<&ParticleSet> {
        Some(self)
    }

    fn as_particles_mut(&mut self) -> Option<&mut ParticleSet> {
        Some(self)
    }
}
