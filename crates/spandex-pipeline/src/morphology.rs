//! Magnification-dependent size correction of the particle mask.
//!
//! At 20x and 50x the segmented blobs come out roughly one pixel too wide,
//! so the mask is eroded once with a 3×3 structuring element. Pixels
//! outside the image never count as background.

use imageproc::distance_transform::Norm;

use crate::config::Magnification;
use crate::types::GrayImage;

/// Erode `mask` once if `magnification` needs it, otherwise return it as is.
#[must_use = "returns the refined mask"]
pub fn refine(mask: GrayImage, magnification: Magnification) -> GrayImage {
    if magnification.needs_erosion() {
        erode_3x3(&mask)
    } else {
        mask
    }
}

/// Binary erosion with the radius-1 disk (the full 3×3 square).
#[must_use = "returns the eroded mask"]
pub fn erode_3x3(mask: &GrayImage) -> GrayImage {
    imageproc::morphology::erode(mask, Norm::LInf, 1)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn square(size: u32, lo: u32, hi: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            Luma([if (lo..=hi).contains(&x) && (lo..=hi).contains(&y) { 255 } else { 0 }])
        })
    }

    fn count(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] != 0).count()
    }

    #[test]
    fn low_magnification_is_unchanged() {
        let mask = square(10, 2, 6);
        assert_eq!(refine(mask.clone(), Magnification::Low), mask);
    }

    #[test]
    fn erosion_shrinks_square_by_one_pixel() {
        let eroded = refine(square(10, 2, 6), Magnification::Mid);
        assert_eq!(eroded, square(10, 3, 5));
    }

    #[test]
    fn high_magnification_erodes_too() {
        assert_eq!(count(&refine(square(9, 1, 7), Magnification::High)), 25);
    }

    #[test]
    fn single_pixel_disappears() {
        let mask = square(5, 2, 2);
        assert_eq!(count(&erode_3x3(&mask)), 0);
    }

    #[test]
    fn image_border_is_not_background() {
        let full = GrayImage::from_pixel(4, 4, Luma([255]));
        assert_eq!(erode_3x3(&full), full);
    }
}
