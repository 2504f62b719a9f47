//! Rectangular image regions and parameter supports.
//!
//! A [`Tile`] is a half-open box `[lo, hi)` over `(z, y, x)` pixel indices.
//! Two-dimensional images are handled as volumes of depth one. A parameter's
//! [`Support`] is either a tile (local influence) or the whole frame.

use ndarray::{s, Array3, ArrayView3, ArrayViewMut3};
use serde::{Deserialize, Serialize};

/// Half-open axis-aligned box of pixels in `(z, y, x)` order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Inclusive lower corner
    pub lo: [usize; 3],
    /// Exclusive upper corner
    pub hi: [usize; 3],
}

impl Tile {
    /// Create a tile from corners; an inverted axis yields an empty tile.
    pub fn new(lo: [usize; 3], hi: [usize; 3]) -> Self {
        let mut hi = hi;
        for axis in 0..3 {
            hi[axis] = hi[axis].max(lo[axis]);
        }
        Self { lo, hi }
    }

    /// Tile spanning a whole frame of the given shape
    pub fn frame(shape: [usize; 3]) -> Self {
        Self {
            lo: [0; 3],
            hi: shape,
        }
    }

    /// The empty tile
    pub fn empty() -> Self {
        Self {
            lo: [0; 3],
            hi: [0; 3],
        }
    }

    /// Bounding box of all pixel centers within `radius` of `center`,
    /// clipped to `frame`. Pixel `i` has its center at coordinate `i`.
    pub fn around(center: [f64; 3], radius: [f64; 3], frame: &Tile) -> Self {
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            let start = (center[axis] - radius[axis]).ceil();
            let stop = (center[axis] + radius[axis]).floor() + 1.0;
            let start = start.max(frame.lo[axis] as f64);
            let stop = stop.min(frame.hi[axis] as f64);
            if !(start < stop) {
                return Tile::empty();
            }
            lo[axis] = start as usize;
            hi[axis] = stop as usize;
        }
        Tile::new(lo, hi)
    }

    /// Extent along each axis
    pub fn shape(&self) -> [usize; 3] {
        [
            self.hi[0] - self.lo[0],
            self.hi[1] - self.lo[1],
            self.hi[2] - self.lo[2],
        ]
    }

    /// Extent as an ndarray shape tuple
    pub fn dim(&self) -> (usize, usize, usize) {
        let shape = self.shape();
        (shape[0], shape[1], shape[2])
    }

    /// Number of pixels covered
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether the tile covers no pixel
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the two tiles share at least one pixel
    pub fn overlaps(&self, other: &Tile) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Whether `other` lies entirely inside this tile
    pub fn contains(&self, other: &Tile) -> bool {
        other.is_empty()
            || (0..3).all(|axis| self.lo[axis] <= other.lo[axis] && other.hi[axis] <= self.hi[axis])
    }

    /// Common part of two tiles (possibly empty)
    pub fn intersect(&self, other: &Tile) -> Tile {
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            lo[axis] = self.lo[axis].max(other.lo[axis]);
            hi[axis] = self.hi[axis].min(other.hi[axis]);
        }
        Tile::new(lo, hi)
    }

    /// Smallest tile containing both tiles
    pub fn union(&self, other: &Tile) -> Tile {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            lo[axis] = self.lo[axis].min(other.lo[axis]);
            hi[axis] = self.hi[axis].max(other.hi[axis]);
        }
        Tile::new(lo, hi)
    }

    /// Grow by `by` pixels on every side of each axis, clipped to `frame`
    pub fn dilate(&self, by: [usize; 3], frame: &Tile) -> Tile {
        if self.is_empty() {
            return *self;
        }
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            lo[axis] = self.lo[axis].saturating_sub(by[axis]).max(frame.lo[axis]);
            hi[axis] = (self.hi[axis] + by[axis]).min(frame.hi[axis]);
        }
        Tile::new(lo, hi)
    }

    /// View of this tile inside an array that covers `origin`
    ///
    /// Panics if the tile is not contained in `origin`; callers establish that
    /// invariant when building the regions.
    pub fn view_in<'a>(&self, array: &'a Array3<f64>, origin: &Tile) -> ArrayView3<'a, f64> {
        let (a, b) = self.offsets(origin);
        array.slice(s![a[0]..b[0], a[1]..b[1], a[2]..b[2]])
    }

    /// Mutable view of this tile inside an array that covers `origin`
    pub fn view_in_mut<'a>(
        &self,
        array: &'a mut Array3<f64>,
        origin: &Tile,
    ) -> ArrayViewMut3<'a, f64> {
        let (a, b) = self.offsets(origin);
        array.slice_mut(s![a[0]..b[0], a[1]..b[1], a[2]..b[2]])
    }

    fn offsets(&self, origin: &Tile) -> ([usize; 3], [usize; 3]) {
        debug_assert!(origin.contains(self), "{:?} not inside {:?}", self, origin);
        let mut a = [0usize; 3];
        let mut b = [0usize; 3];
        for axis in 0..3 {
            a[axis] = self.lo[axis] - origin.lo[axis];
            b[axis] = self.hi[axis] - origin.lo[axis];
        }
        (a, b)
    }
}

/// Spatial region of the output image a parameter can influence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Support {
    /// Influences the whole frame (illumination, background, PSF)
    Global,
    /// Influences only the given tile (pre-PSF)
    Local(Tile),
}

impl Support {
    /// Concrete tile within `frame`
    pub fn resolve(&self, frame: &Tile) -> Tile {
        match self {
            Support::Global => *frame,
            Support::Local(tile) => tile.intersect(frame),
        }
    }

    /// Whether this support covers the whole frame
    pub fn is_global(&self) -> bool {
        matches!(self, Support::Global)
    }
}
