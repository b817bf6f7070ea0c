//! Per-pixel extremum projection across the z-stack.
//!
//! Every pixel's trace through focus is reduced to its maximum and minimum
//! and the planes they occurred in. The normalized intensity range
//! (`max − min`) is what particles light up in.

use image::Luma;

use crate::blur::gaussian_blur;
use crate::types::{ImageStack, IndexMap, PixelBuffer};

/// Lateral sigma of the smoothing applied to the NIR image.
pub const NIR_BLUR_SIGMA: f32 = 1.5;

/// Per-pixel extremes of a stack and their slice indices.
#[derive(Debug, Clone)]
pub struct ExtremumMap {
    /// Maximum value over z.
    pub max_val: PixelBuffer,
    /// Minimum value over z.
    pub min_val: PixelBuffer,
    /// Plane index of the maximum.
    pub max_idx: IndexMap,
    /// Plane index of the minimum.
    pub min_idx: IndexMap,
}

impl ExtremumMap {
    /// Normalized intensity range, `max − min` per pixel.
    #[must_use = "returns the range image"]
    pub fn range(&self) -> PixelBuffer {
        PixelBuffer::from_fn(self.max_val.width(), self.max_val.height(), |x, y| {
            Luma([self.max_val.get_pixel(x, y).0[0] - self.min_val.get_pixel(x, y).0[0]])
        })
    }
}

/// Scan the stack once, starting from plane 0 as the baseline.
///
/// A later plane replaces the maximum only when strictly greater, and
/// otherwise replaces the minimum only when strictly less. Ties therefore
/// keep the first plane seen, and NaN samples never replace anything.
#[must_use = "returns the extremum map"]
pub fn extremum_projection(stack: &ImageStack) -> ExtremumMap {
    let (w, h) = (stack.width(), stack.height());
    let planes = stack.planes();
    let (mut max_val, mut min_val) = planes
        .first()
        .map_or_else(
            || (PixelBuffer::new(w, h), PixelBuffer::new(w, h)),
            |p| (p.clone(), p.clone()),
        );
    let mut max_idx = IndexMap::new(w, h);
    let mut min_idx = IndexMap::new(w, h);

    for (z, plane) in planes.iter().enumerate().skip(1) {
        #[allow(clippy::cast_possible_truncation)]
        let z = z as u32;
        for (x, y, pixel) in plane.enumerate_pixels() {
            let v = pixel.0[0];
            if v > max_val.get_pixel(x, y).0[0] {
                max_val.put_pixel(x, y, Luma([v]));
                max_idx.put_pixel(x, y, Luma([z]));
            } else if v < min_val.get_pixel(x, y).0[0] {
                min_val.put_pixel(x, y, Luma([v]));
                min_idx.put_pixel(x, y, Luma([z]));
            }
        }
    }

    ExtremumMap {
        max_val,
        min_val,
        max_idx,
        min_idx,
    }
}

/// The NIR image handed to the deconvolver: range blurred with
/// [`NIR_BLUR_SIGMA`].
#[must_use = "returns the blurred NIR image"]
pub fn blurred_nir(extrema: &ExtremumMap) -> PixelBuffer {
    gaussian_blur(&extrema.range(), NIR_BLUR_SIGMA)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stack_of(values: &[f32]) -> ImageStack {
        ImageStack::from_fn(1, 1, values.len(), |_, _, z| values[z]).unwrap()
    }

    fn at(map: &ExtremumMap) -> (f32, f32, u32, u32) {
        (
            map.max_val.get_pixel(0, 0).0[0],
            map.min_val.get_pixel(0, 0).0[0],
            map.max_idx.get_pixel(0, 0).0[0],
            map.min_idx.get_pixel(0, 0).0[0],
        )
    }

    #[test]
    fn finds_extremes_and_planes() {
        let map = extremum_projection(&stack_of(&[0.2, 0.9, -0.4, 0.1]));
        assert_eq!(at(&map), (0.9, -0.4, 1, 2));
    }

    #[test]
    fn ties_keep_first_plane() {
        let map = extremum_projection(&stack_of(&[0.0, 1.0, 1.0, -1.0, -1.0]));
        assert_eq!(at(&map), (1.0, -1.0, 1, 3));
    }

    #[test]
    fn nan_never_updates() {
        let map = extremum_projection(&stack_of(&[0.5, f32::NAN, 0.7]));
        assert_eq!(at(&map), (0.7, 0.5, 2, 0));
    }

    #[test]
    fn single_plane_has_zero_range() {
        let map = extremum_projection(&stack_of(&[3.0]));
        assert_eq!(at(&map), (3.0, 3.0, 0, 0));
        assert!(map.range().get_pixel(0, 0).0[0].abs() < f32::EPSILON);
    }

    #[test]
    fn max_never_below_min() {
        let stack = ImageStack::from_fn(8, 6, 5, |x, y, z| {
            ((x * 7 + y * 3 + z as u32 * 11) % 13) as f32 - 6.0
        })
        .unwrap();
        let map = extremum_projection(&stack);
        for (x, y, p) in map.max_val.enumerate_pixels() {
            assert!(p.0[0] >= map.min_val.get_pixel(x, y).0[0]);
            assert!(map.max_idx.get_pixel(x, y).0[0] < 5);
            assert!(map.min_idx.get_pixel(x, y).0[0] < 5);
        }
        assert!(blurred_nir(&map).pixels().all(|p| p.0[0] >= -1e-5));
    }
}
