//! Integration tests for reconfit-rs
//!
//! This module organizes the tests that drive the library as a whole,
//! from synthetic data to a fitted and serialized result.

// Particle discovery followed by a global fit
pub mod pipeline;

// Configurations and results written to and read from JSON
pub mod serialization;
