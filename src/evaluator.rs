//! Per-pixel region evaluation.
//!
//! Components and the convolution describe *what* each pixel of a region
//! should contain as a closure over pixel coordinates; a [`RegionEvaluator`]
//! decides *how* the region is swept. The optimizer and cache are agnostic to
//! the choice, so an accelerated evaluator can be plugged in without touching
//! them.

use ndarray::Array3;
use std::fmt;

use crate::error::{ReconError, Result};
use crate::region::Tile;

/// Pixel function over absolute `(z, y, x)` indices
pub type PixelFn<'a> = dyn Fn([usize; 3]) -> f64 + Sync + 'a;

/// Strategy for evaluating a pixel function over a tile
///
/// Implementations must return, for every pixel of `tile`, exactly the value
/// of `f` at that pixel: no reordering of floating-point work across pixels is
/// allowed, which keeps patch and full renders identical.
pub trait RegionEvaluator: Send + Sync + fmt::Debug {
    /// Evaluate `f` at every pixel of `tile`, returning an array of
    /// `tile.dim()` indexed relative to `tile.lo`.
    fn evaluate(&self, tile: &Tile, f: &PixelFn<'_>) -> Result<Array3<f64>>;
}

/// Evaluates pixels one by one on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialEvaluator;

impl RegionEvaluator for SerialEvaluator {
    fn evaluate(&self, tile: &Tile, f: &PixelFn<'_>) -> Result<Array3<f64>> {
        let lo = tile.lo;
        Ok(Array3::from_shape_fn(tile.dim(), |(z, y, x)| {
            f([lo[0] + z, lo[1] + y, lo[2] + x])
        }))
    }
}

/// Evaluates pixels on the rayon thread pool once a region is large enough
#[cfg(feature = "parallel")]
#[derive(Debug, Clone, Copy)]
pub struct ParallelEvaluator {
    /// Regions smaller than this are evaluated serially
    pub min_pixels: usize,
}

#[cfg(feature = "parallel")]
impl Default for ParallelEvaluator {
    fn default() -> Self {
        Self { min_pixels: 4096 }
    }
}

#[cfg(feature = "parallel")]
impl RegionEvaluator for ParallelEvaluator {
    fn evaluate(&self, tile: &Tile, f: &PixelFn<'_>) -> Result<Array3<f64>> {
        use rayon::prelude::*;

        if tile.len() < self.min_pixels {
            return SerialEvaluator.evaluate(tile, f);
        }

        let [_, ny, nx] = tile.shape();
        let lo = tile.lo;
        let values: Vec<f64> = (0..tile.len())
            .into_par_iter()
            .map(|i| {
                let z = i / (ny * nx);
                let y = (i / nx) % ny;
                let x = i % nx;
                f([lo[0] + z, lo[1] + y, lo[2] + x])
            })
            .collect();

        Array3::from_shape_vec(tile.dim(), values)
            .map_err(|e| ReconError::ShapeMismatch(format!("region evaluation: {}", e)))
    }
}

/// Evaluator used when a model is built without an explicit choice
pub fn default_evaluator() -> std::sync::Arc<dyn RegionEvaluator> {
    #[cfg(feature = "parallel")]
    {
        std::sync::Arc::new(ParallelEvaluator::default())
    }
    #[cfg(not(feature = "parallel"))]
    {
        std::sync::Arc::new(SerialEvaluator)
    }
}
