//! Integration tests for the parameter system

// Tests for the ParameterStore
mod store_tests;
