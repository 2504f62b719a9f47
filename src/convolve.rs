//! Region-restricted 3D convolution
//!
//! The point-spread function is applied with zero padding at the frame edge
//! ("same" mode). Both full and patch renders go through
//! [`convolve_region`], so a pixel always sees the same kernel taps in the
//! same order no matter how large the rendered region is.

use ndarray::Array3;

use crate::error::{ReconError, Result};
use crate::evaluator::RegionEvaluator;
use crate::region::Tile;

/// Half-width of an odd-sized kernel along each axis
pub fn kernel_half_width(kernel: &Array3<f64>) -> Result<[usize; 3]> {
    let (kz, ky, kx) = kernel.dim();
    if kz % 2 == 0 || ky % 2 == 0 || kx % 2 == 0 {
        return Err(ReconError::ShapeMismatch(format!(
            "Kernel dimensions must be odd, got {:?}",
            kernel.dim()
        )));
    }
    Ok([kz / 2, ky / 2, kx / 2])
}

/// Convolve `field` with `kernel`, producing the pixels of `out_tile`
///
/// # Arguments
/// * `field` - Pre-blur values over `field_tile`
/// * `field_tile` - Region covered by `field`; must contain `out_tile`
///   dilated by the kernel half-width (clipped to `frame`)
/// * `kernel` - Odd-sized kernel
/// * `out_tile` - Region to produce
/// * `frame` - Full image frame; pixels outside it count as zero
/// * `evaluator` - Strategy used to sweep the output pixels
///
/// # Returns
/// * Blurred values over `out_tile`
pub fn convolve_region(
    field: &Array3<f64>,
    field_tile: &Tile,
    kernel: &Array3<f64>,
    out_tile: &Tile,
    frame: &Tile,
    evaluator: &dyn RegionEvaluator,
) -> Result<Array3<f64>> {
    if field.dim() != field_tile.dim() {
        return Err(ReconError::ShapeMismatch(format!(
            "Field of shape {:?} does not match its tile {:?}",
            field.dim(),
            field_tile.dim()
        )));
    }
    let half = kernel_half_width(kernel)?;
    let needed = out_tile.dilate(half, frame);
    if !field_tile.contains(&needed) {
        return Err(ReconError::ShapeMismatch(format!(
            "Field tile {:?} does not cover the convolution footprint {:?}",
            field_tile, needed
        )));
    }

    let (kd, kh, kw) = kernel.dim();
    let lo = field_tile.lo;
    let inside = |axis: usize, value: isize| {
        value >= frame.lo[axis] as isize && value < frame.hi[axis] as isize
    };

    evaluator.evaluate(out_tile, &|[z, y, x]| {
        let mut sum = 0.0;
        for kz in 0..kd {
            let sz = z as isize + half[0] as isize - kz as isize;
            if !inside(0, sz) {
                continue;
            }
            for ky in 0..kh {
                let sy = y as isize + half[1] as isize - ky as isize;
                if !inside(1, sy) {
                    continue;
                }
                for kx in 0..kw {
                    let sx = x as isize + half[2] as isize - kx as isize;
                    if !inside(2, sx) {
                        continue;
                    }
                    let source = [
                        sz as usize - lo[0],
                        sy as usize - lo[1],
                        sx as usize - lo[2],
                    ];
                    sum += field[source] * kernel[[kz, ky, kx]];
                }
            }
        }
        sum
    })
}

/// Create a normalized, separable Gaussian kernel
///
/// # Arguments
/// * `sigma` - Standard deviation along `(z, y, x)` in pixels
/// * `half_width` - Kernel half-width along each axis; the kernel has
///   `2 * half_width + 1` taps per axis
///
/// An axis with zero half-width (or a non-positive sigma) collapses to a
/// single unit tap.
pub fn gaussian_kernel(sigma: [f64; 3], half_width: [usize; 3]) -> Array3<f64> {
    let taps = |axis: usize| -> Vec<f64> {
        let h = half_width[axis] as isize;
        if h == 0 || sigma[axis] <= 0.0 {
            let mut delta = vec![0.0; (2 * h + 1) as usize];
            delta[h as usize] = 1.0;
            return delta;
        }
        let s = sigma[axis];
        (-h..=h)
            .map(|i| (-((i * i) as f64) / (2.0 * s * s)).exp())
            .collect()
    };
    let (tz, ty, tx) = (taps(0), taps(1), taps(2));

    let mut kernel = Array3::from_shape_fn((tz.len(), ty.len(), tx.len()), |(z, y, x)| {
        tz[z] * ty[y] * tx[x]
    });

    // Normalize the kernel
    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|v| v / sum);
    }
    kernel
}
