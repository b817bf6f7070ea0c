//! Adaptive local thresholding (Bernsen).
//!
//! Each pixel is compared against the mid-range of its disk neighbourhood.
//! Where the neighbourhood has too little contrast to decide locally, the
//! mid-range itself is compared against the middle of the 8-bit range.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::rank::{max_filter_disk, min_filter_disk};
use crate::types::PixelBuffer;

/// Contrast threshold used when none is configured.
pub const DEFAULT_CONTRAST_THRESHOLD: u32 = 15;

/// Bernsen parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BernsenParams {
    /// Neighbourhood disk radius.
    pub radius: u32,
    /// Minimum local contrast for a local decision.
    /// `None` uses [`DEFAULT_CONTRAST_THRESHOLD`].
    pub contrast_threshold: Option<u32>,
    /// Whether objects are brighter than the background.
    pub object_is_white: bool,
}

/// Linearly rescale to `0..=255` with round-half-up.
///
/// The minimum maps to 0 and the maximum to 255. A constant image maps to
/// all zeros. Non-finite samples are ignored when computing the range and
/// map to 0.
#[must_use = "returns the quantized image"]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn quantize_to_gray8(image: &PixelBuffer) -> GrayImage {
    let (min, max) = image
        .pixels()
        .map(|p| p.0[0])
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

    let (w, h) = image.dimensions();
    if max <= min {
        return GrayImage::new(w, h);
    }

    let scale = 255.0 / (f64::from(max) - f64::from(min));
    GrayImage::from_fn(w, h, |x, y| {
        let v = image.get_pixel(x, y).0[0];
        if !v.is_finite() {
            return Luma([0]);
        }
        let scaled = (f64::from(v) - f64::from(min)).mul_add(scale, 0.5).floor();
        Luma([scaled.clamp(0.0, 255.0) as u8])
    })
}

/// Binarize an 8-bit image with Bernsen's method.
///
/// Output pixels are 255 for objects and 0 for background. With
/// `object_is_white` unset the comparison is mirrored, so darker-than-mid
/// pixels become objects.
#[must_use = "returns the threshold mask"]
pub fn bernsen(image: &GrayImage, params: &BernsenParams) -> GrayImage {
    let local_max = max_filter_disk(image, params.radius);
    let local_min = min_filter_disk(image, params.radius);
    let threshold = i32::try_from(params.contrast_threshold.unwrap_or(DEFAULT_CONTRAST_THRESHOLD))
        .unwrap_or(i32::MAX);
    let (object, background) = if params.object_is_white { (255, 0) } else { (0, 255) };

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let hi = i32::from(local_max.get_pixel(x, y).0[0]);
        let lo = i32::from(local_min.get_pixel(x, y).0[0]);
        let v = i32::from(image.get_pixel(x, y).0[0]);
        let contrast = hi - lo;
        let mid = (hi + lo) / 2;
        let bright = if contrast < threshold { mid >= 128 } else { v >= mid };
        Luma([if bright { object } else { background }])
    })
}
