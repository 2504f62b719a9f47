//! # Model Components
//!
//! Concrete contributors to the composite image:
//!
//! - [`PolynomialIllumination`]: multiplicative Legendre or power series
//! - [`SeparableIllumination`]: in-plane polynomial joined with an axial one
//! - [`Background`]: additive level with optional gradient
//! - [`ParticleSet`]: locally supported particles (Gaussian or sphere)
//! - [`GaussianPsf`]: blur kernel applied after composition

pub mod background;
pub mod illumination;
pub mod particles;
pub mod psf;

pub use background::Background;
pub use illumination::{
    AxialJoin, PolynomialBasis, PolynomialIllumination, SeparableIllumination,
};
pub use particles::{Particle, ParticleField, ParticleSet, ParticleShape};
pub use psf::GaussianPsf;
