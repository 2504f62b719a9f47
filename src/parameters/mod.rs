//! # Parameter System
//!
//! Named scalar parameters with bounds, held in a single ordered, versioned
//! [`ParameterStore`]. Model components never own parameter values; they
//! declare parameters at composition time and read the store when rendering.
//!
//! ## Example Usage
//!
//! ```rust
//! use reconfit_rs::parameters::{Bounds, ParameterStore};
//!
//! let mut store = ParameterStore::new();
//! store.declare("bkg-level", 0.1, Bounds::unbounded()).unwrap();
//! store.declare("p0-amp", 1.0, Bounds::min_only(0.0)).unwrap();
//!
//! // Bulk access for the optimizer
//! let mut values = store.get_vector();
//! values[1] = 2.0;
//! store.set_vector(&values).unwrap();
//!
//! // Out-of-bounds updates are rejected and leave the store unchanged
//! assert!(store.set("p0-amp", -1.0).is_err());
//! assert_eq!(store.get("p0-amp").unwrap(), 2.0);
//! ```

pub mod bounds;
pub mod parameter;
pub mod store;
pub mod view;

// Re-export key types
pub use bounds::Bounds;
pub use parameter::Parameter;
pub use store::ParameterStore;
pub use view::{ParameterValues, Perturbed};
