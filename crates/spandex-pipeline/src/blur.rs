//! Gaussian smoothing of single planes and of whole stacks.
//!
//! The lateral pass wraps [`imageproc::filter::gaussian_blur_f32`]
//! (separable, edge pixels replicated). The axial pass of
//! [`gaussian_blur_3d`] is a direct convolution along z with a normalized
//! kernel of radius `⌈3σ⌉`, also replicating the first and last plane.

use image::Luma;

use crate::types::PixelBuffer;

/// Apply Gaussian blur to a single-precision plane.
///
/// Non-positive sigma values return the image unchanged, since
/// `imageproc`'s underlying function panics on `sigma <= 0.0`.
#[must_use = "returns the blurred image"]
pub fn gaussian_blur(image: &PixelBuffer, sigma: f32) -> PixelBuffer {
    if sigma <= 0.0 {
        return image.clone();
    }

    imageproc::filter::gaussian_blur_f32(image, sigma)
}

/// Blur a stack laterally with `sigma_xy`, then along z with `sigma_z`.
#[must_use = "returns the blurred planes"]
pub fn gaussian_blur_3d(planes: &[PixelBuffer], sigma_xy: f32, sigma_z: f32) -> Vec<PixelBuffer> {
    let lateral: Vec<PixelBuffer> = planes
        .iter()
        .map(|plane| gaussian_blur(plane, sigma_xy))
        .collect();

    if sigma_z <= 0.0 || lateral.len() < 2 {
        return lateral;
    }

    let kernel = gaussian_kernel(sigma_z);
    let radius = kernel.len() / 2;
    let last = lateral.len() - 1;

    (0..lateral.len())
        .map(|z| {
            let (w, h) = lateral[z].dimensions();
            PixelBuffer::from_fn(w, h, |x, y| {
                let value = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, weight)| {
                        let zz = (z + k).saturating_sub(radius).min(last);
                        weight * lateral[zz].get_pixel(x, y).0[0]
                    })
                    .sum();
                Luma([value])
            })
        })
        .collect()
}

/// Normalized 1D Gaussian kernel with radius `⌈3σ⌉`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil() as usize;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let raw: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let d = i as f32 - radius as f32;
            (-(d * d) / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = raw.iter().sum();
    raw.into_iter().map(|w| w / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(w: u32, h: u32, v: f32) -> PixelBuffer {
        PixelBuffer::from_pixel(w, h, Luma([v]))
    }

    #[test]
    fn zero_sigma_returns_identical_image() {
        let img = PixelBuffer::from_fn(5, 5, |x, y| Luma([(x * y) as f32]));
        assert_eq!(gaussian_blur(&img, 0.0), img);
    }

    #[test]
    fn uniform_plane_unchanged_by_blur() {
        let blurred = gaussian_blur(&constant(12, 9, 3.5), 1.5);
        for p in blurred.pixels() {
            assert!((p.0[0] - 3.5).abs() < 1e-4, "got {}", p.0[0]);
        }
    }

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel(1.0);
        assert_eq!(k.len(), 7);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        for i in 0..k.len() {
            assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-7);
        }
    }

    #[test]
    fn axial_blur_spreads_a_single_plane() {
        let planes = vec![
            constant(3, 3, 0.0),
            constant(3, 3, 0.0),
            constant(3, 3, 1.0),
            constant(3, 3, 0.0),
            constant(3, 3, 0.0),
        ];
        let out = gaussian_blur_3d(&planes, 0.0, 1.0);
        let centre = out[2].get_pixel(1, 1).0[0];
        let side = out[1].get_pixel(1, 1).0[0];
        assert!(centre < 1.0 && centre > side && side > 0.0);
        assert!((side - out[3].get_pixel(1, 1).0[0]).abs() < 1e-7);
    }

    #[test]
    fn axial_blur_preserves_uniform_stack() {
        let planes = vec![constant(2, 2, 4.0), constant(2, 2, 4.0), constant(2, 2, 4.0)];
        for plane in gaussian_blur_3d(&planes, 1.0, 1.0) {
            for p in plane.pixels() {
                assert!((p.0[0] - 4.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn single_plane_skips_axial_pass() {
        let planes = vec![constant(4, 4, 2.0)];
        let out = gaussian_blur_3d(&planes, 0.0, 1.0);
        assert_eq!(out, planes);
    }
}
