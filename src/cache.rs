//! Difference cache for per-component sub-renders
//!
//! Entries hold a component's field over some tile, keyed by the parameter
//! whose support produced that tile. The cache carries a version counter
//! that advances on every invalidation; an entry is only served while its
//! stamp equals the current version. Invalidation drops every entry whose
//! tile overlaps a changed (dilated) support and re-stamps the survivors, so
//! a stale field can never be returned.

use ndarray::Array3;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::region::Tile;

/// One cached sub-render
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Index of the component that rendered the field
    pub component: usize,
    /// Region covered by `field`
    pub tile: Tile,
    /// Component field over `tile`
    pub field: Arc<Array3<f64>>,
    /// Cache version at which the entry was last known valid
    pub version: u64,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Per-parameter cache of component sub-renders
#[derive(Debug, Default)]
pub struct DifferenceCache {
    version: u64,
    entries: HashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: u64,
}

impl DifferenceCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cache version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `name` has an entry stamped with the current version
    pub fn is_valid(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map_or(false, |entry| entry.version == self.version)
    }

    /// The valid entry for `name`, if any
    pub fn entry(&self, name: &str) -> Option<&CacheEntry> {
        self.entries
            .get(name)
            .filter(|entry| entry.version == self.version)
    }

    /// Store a field for `name`, stamped with the current version
    pub fn insert(&mut self, name: &str, component: usize, tile: Tile, field: Arc<Array3<f64>>) {
        self.entries.insert(
            name.to_string(),
            CacheEntry {
                component,
                tile,
                field,
                version: self.version,
            },
        );
    }

    /// Return the valid entry for `name`, rendering and storing it on a miss
    ///
    /// `render` produces the owning component's index, the tile and the field.
    pub fn get_or_render<F>(&mut self, name: &str, render: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Result<(usize, Tile, Array3<f64>)>,
    {
        if let Some(entry) = self.entry(name) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let (component, tile, field) = render()?;
        self.insert(name, component, tile, Arc::new(field));
        let entry = CacheEntry {
            component,
            tile,
            field: Arc::clone(&self.entries[name].field),
            version: self.version,
        };
        Ok(entry)
    }

    /// A valid field of `component` covering all of `tile`
    ///
    /// Returns the field together with the tile it spans; callers slice the
    /// requested region out of it.
    pub fn covering(&self, component: usize, tile: &Tile) -> Option<(Arc<Array3<f64>>, Tile)> {
        let found = self.entries.values().find(|entry| {
            entry.version == self.version
                && entry.component == component
                && entry.tile.contains(tile)
        });
        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some((Arc::clone(&entry.field), entry.tile))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Advance the version after parameters changed
    ///
    /// `changed` lists the changed parameters with their dilated support
    /// (union of old and new). Entries overlapping any of these tiles, or
    /// already stale, are dropped; all others are re-stamped. Returns the
    /// names of the dropped entries.
    pub fn invalidate(&mut self, changed: &[(String, Tile)]) -> Vec<String> {
        let previous = self.version;
        self.version += 1;
        self.invalidations += 1;

        let mut dropped = Vec::new();
        self.entries.retain(|name, entry| {
            let stale = entry.version != previous;
            let touched = changed
                .iter()
                .any(|(changed_name, tile)| changed_name == name || entry.tile.overlaps(tile));
            if stale || touched {
                dropped.push(name.clone());
                false
            } else {
                true
            }
        });
        for entry in self.entries.values_mut() {
            entry.version = self.version;
        }

        tracing::trace!(
            version = self.version,
            dropped = dropped.len(),
            kept = self.entries.len(),
            "Invalidated difference cache"
        );
        dropped
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.version += 1;
        self.entries.clear();
    }

    /// Counters since creation
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations,
        }
    }
}
