//! Integration tests for the Levenberg-Marquardt fit
//!
//! These tests verify convergence on synthetic images, the handling of
//! bounds and regularization, and the termination rules.

// Noiseless fits and termination
mod convergence_tests;

// Bounded parameters and the bound penalty
mod bounds_tests;

// Fits to noisy data and their uncertainties
mod noisy_tests;
