//! Background normalization of the raw z-stack.
//!
//! Each plane is divided by its own slowly varying background, estimated
//! with a wide median filter:
//!
//! ```text
//! NI = (raw − background) / background
//! ```
//!
//! The normalized stack is then smoothed laterally with `σ` and axially
//! with [`AXIAL_SIGMA`].

use image::Luma;

use crate::blur::gaussian_blur_3d;
use crate::rank::median_filter_square;
use crate::types::{ImageStack, PixelBuffer};

/// Backgrounds with a magnitude below this produce NI = 0.
pub const ZERO_BACKGROUND_EPSILON: f32 = 1e-6;

/// Axial sigma of the 3D smoothing, in planes.
pub const AXIAL_SIGMA: f32 = 1.0;

/// Output of [`normalize_stack`].
#[derive(Debug, Clone)]
pub struct NormalizedStack {
    /// The smoothed normalized-intensity stack.
    pub stack: ImageStack,
    /// Number of voxels whose background was (near) zero.
    pub guarded_pixels: u64,
}

/// Normalize every plane against its median background, then smooth.
///
/// `median_radius` is the half-width of the square background window.
#[must_use = "returns the normalized stack"]
pub fn normalize_stack(stack: &ImageStack, sigma: f32, median_radius: u32) -> NormalizedStack {
    let mut guarded_pixels = 0;
    let planes: Vec<PixelBuffer> = stack
        .planes()
        .iter()
        .map(|plane| {
            let background = median_filter_square(plane, median_radius);
            let (ni, guarded) = normalized_intensity(plane, &background);
            guarded_pixels += guarded;
            ni
        })
        .collect();

    if guarded_pixels > 0 {
        log::warn!(
            "{guarded_pixels} voxel(s) had a zero background and were normalized to 0"
        );
    }

    NormalizedStack {
        stack: ImageStack::from_stage_output(gaussian_blur_3d(&planes, sigma, AXIAL_SIGMA)),
        guarded_pixels,
    }
}

/// `(raw − bg) / bg` per pixel, with the zero-background guard.
///
/// Returns the NI plane and the number of guarded pixels.
fn normalized_intensity(raw: &PixelBuffer, background: &PixelBuffer) -> (PixelBuffer, u64) {
    let mut guarded = 0;
    let ni = PixelBuffer::from_fn(raw.width(), raw.height(), |x, y| {
        let bg = background.get_pixel(x, y).0[0];
        if bg.abs() < ZERO_BACKGROUND_EPSILON {
            guarded += 1;
            return Luma([0.0]);
        }
        Luma([(raw.get_pixel(x, y).0[0] - bg) / bg])
    });
    (ni, guarded)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn uniform_stack_normalizes_to_zero() {
        let stack = ImageStack::from_fn(6, 5, 3, |_, _, _| 100.0).unwrap();
        let out = normalize_stack(&stack, 1.0, 20);
        assert_eq!(out.guarded_pixels, 0);
        assert_eq!(out.stack.depth(), 3);
        for plane in out.stack.planes() {
            assert!(plane.pixels().all(|p| p.0[0].abs() < 1e-6));
        }
    }

    #[test]
    fn bright_spot_becomes_positive_contrast() {
        // Background 50, a single pixel at 100 -> NI 1.0 before smoothing.
        let raw =
            PixelBuffer::from_fn(9, 9, |x, y| Luma([if (x, y) == (4, 4) { 100.0 } else { 50.0 }]));
        let background = median_filter_square(&raw, 4);
        let (ni, guarded) = normalized_intensity(&raw, &background);
        assert_eq!(guarded, 0);
        assert!((ni.get_pixel(4, 4).0[0] - 1.0).abs() < 1e-6);
        assert!(ni.get_pixel(0, 0).0[0].abs() < 1e-6);
    }

    #[test]
    fn zero_background_is_guarded() {
        let stack = ImageStack::from_fn(4, 4, 2, |_, _, _| 0.0).unwrap();
        let out = normalize_stack(&stack, 1.0, 2);
        assert_eq!(out.guarded_pixels, 32);
        for plane in out.stack.planes() {
            assert!(plane.pixels().all(|p| p.0[0].is_finite() && p.0[0].abs() < f32::EPSILON));
        }
    }

    #[test]
    fn output_has_input_geometry() {
        let stack =
            ImageStack::from_fn(7, 3, 4, |x, y, z| (x + y) as f32 + z as f32 + 1.0).unwrap();
        let out = normalize_stack(&stack, 0.5, 1);
        assert_eq!(out.stack.dimensions(), stack.dimensions());
        assert_eq!(out.stack.depth(), 4);
    }
}
