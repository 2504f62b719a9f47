//! Integration tests for rendering
//!
//! These tests check that region-restricted patches reproduce full renders
//! and that the difference cache never serves a stale field.

// Patch/full equivalence, particle insertion and removal
mod patch_tests;

// Difference cache invalidation
mod cache_tests;
