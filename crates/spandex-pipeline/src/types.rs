//! Shared types for the particle detection pipeline.

use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference binary masks
/// without depending on `image` directly.
pub use image::GrayImage;

/// A single-precision 2D plane. The common currency between stages.
pub type PixelBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Per-pixel slice indices produced by the extremum projection.
pub type IndexMap = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Region labels: 0 is background (or a watershed dam), 1..N are regions.
pub type LabelMap = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// An ordered z-stack of equal-sized planes.
///
/// Immutable once constructed: the pipeline only ever borrows it.
#[derive(Debug, Clone)]
pub struct ImageStack {
    planes: Vec<PixelBuffer>,
}

impl ImageStack {
    /// Build a stack from planes in z order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStack`] if there are no planes, the
    /// planes are empty, or their sizes differ.
    pub fn new(planes: Vec<PixelBuffer>) -> Result<Self, PipelineError> {
        let Some(first) = planes.first() else {
            return Err(PipelineError::InvalidStack(
                "stack contains no planes".to_string(),
            ));
        };
        let (width, height) = first.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidStack(format!(
                "planes must not be empty, got {width}x{height}"
            )));
        }
        if let Some((z, plane)) = planes
            .iter()
            .enumerate()
            .find(|(_, p)| p.dimensions() != (width, height))
        {
            return Err(PipelineError::InvalidStack(format!(
                "plane {z} is {}x{}, expected {width}x{height}",
                plane.width(),
                plane.height(),
            )));
        }
        Ok(Self { planes })
    }

    /// Build a stack by evaluating `f(x, y, z)` for every voxel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStack`] if any extent is zero.
    pub fn from_fn(
        width: u32,
        height: u32,
        depth: usize,
        f: impl Fn(u32, u32, usize) -> f32,
    ) -> Result<Self, PipelineError> {
        let planes = (0..depth)
            .map(|z| PixelBuffer::from_fn(width, height, |x, y| Luma([f(x, y, z)])))
            .collect();
        Self::new(planes)
    }

    /// Stage outputs share the input's geometry by construction.
    pub(crate) const fn from_stage_output(planes: Vec<PixelBuffer>) -> Self {
        Self { planes }
    }

    /// Plane width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.planes.first().map_or(0, PixelBuffer::width)
    }

    /// Plane height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.planes.first().map_or(0, PixelBuffer::height)
    }

    /// Number of planes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.planes.len()
    }

    /// Plane dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width(),
            height: self.height(),
        }
    }

    /// All planes in z order.
    #[must_use]
    pub fn planes(&self) -> &[PixelBuffer] {
        &self.planes
    }
}

/// A validated point spread function.
///
/// The buffer must be non-empty, contain only finite values and have a
/// positive sum. Normalization to unit sum happens inside the deconvolver.
#[derive(Debug, Clone)]
pub struct Psf {
    buffer: PixelBuffer,
}

impl Psf {
    /// Wrap a calibration image as a PSF.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPsf`] if the buffer is empty,
    /// contains non-finite values, or does not have a positive sum.
    pub fn new(buffer: PixelBuffer) -> Result<Self, PipelineError> {
        if buffer.width() == 0 || buffer.height() == 0 {
            return Err(PipelineError::InvalidPsf("PSF image is empty".to_string()));
        }
        if buffer.pixels().any(|p| !p.0[0].is_finite()) {
            return Err(PipelineError::InvalidPsf(
                "PSF contains non-finite values".to_string(),
            ));
        }
        let sum: f64 = buffer.pixels().map(|p| f64::from(p.0[0])).sum();
        if sum <= 0.0 {
            return Err(PipelineError::InvalidPsf(format!(
                "PSF must have a positive sum, got {sum}"
            )));
        }
        Ok(Self { buffer })
    }

    /// A normalized, centred Gaussian PSF of radius `⌈4σ⌉`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPsf`] if `sigma` is not a positive
    /// finite number.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn gaussian(sigma: f32) -> Result<Self, PipelineError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(PipelineError::InvalidPsf(format!(
                "Gaussian PSF sigma must be positive, got {sigma}"
            )));
        }
        let radius = (4.0 * sigma).ceil() as u32;
        let size = 2 * radius + 1;
        let two_sigma_sq = 2.0 * sigma * sigma;
        let buffer = PixelBuffer::from_fn(size, size, |x, y| {
            let dx = x as f32 - radius as f32;
            let dy = y as f32 - radius as f32;
            Luma([(-(dx * dx + dy * dy) / two_sigma_sq).exp()])
        });
        let sum: f32 = buffer.pixels().map(|p| p.0[0]).sum();
        let normalized = PixelBuffer::from_fn(size, size, |x, y| {
            Luma([buffer.get_pixel(x, y).0[0] / sum])
        });
        Self::new(normalized)
    }

    /// The PSF samples.
    #[must_use]
    pub const fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }
}

/// A detected particle.
///
/// `x`/`y` are the bounding-box origin of the blob, not its centroid.
/// `area` and `circularity` are the values the blob filter was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticleCandidate {
    /// Left edge of the bounding box (pixels).
    pub x: f64,
    /// Top edge of the bounding box (pixels).
    pub y: f64,
    /// Bounding-box width in pixels.
    pub width: u32,
    /// Bounding-box height in pixels.
    pub height: u32,
    /// Pixel count of the blob.
    pub area: u32,
    /// `4π·area / perimeter²`, clamped to 1.
    pub circularity: f64,
}

/// Side length of the square display marker drawn for each particle.
pub const MARKER_SIZE: f64 = 16.0;

/// Offset from the candidate coordinate to the marker origin.
pub const MARKER_OFFSET: f64 = 4.0;

impl ParticleCandidate {
    /// Origin and side length of the display marker for this particle.
    #[must_use]
    pub fn marker(&self) -> (f64, f64, f64) {
        (self.x - MARKER_OFFSET, self.y - MARKER_OFFSET, MARKER_SIZE)
    }
}

/// Candidates in ascending label order (row-major first-seen).
pub type ParticleList = Vec<ParticleCandidate>;

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// At least one candidate was detected.
    Ok,
    /// Blob detection found no candidates. Not an error.
    NoParticlesFound,
    /// The configuration was rejected before any stage ran.
    InvalidConfiguration,
}

/// Named intermediate buffers, exposed when `emit_diagnostics` is set.
#[derive(Debug, Clone)]
pub struct Intermediates {
    /// Normalized-intensity stack after 3D smoothing.
    pub ni_stack: ImageStack,
    /// Normalized intensity range, `max − min` per pixel.
    pub nir: PixelBuffer,
    /// Deconvolved NIR image (nonnegative).
    pub restored: PixelBuffer,
    /// Bernsen threshold mask ({0, 255}).
    pub threshold_mask: GrayImage,
    /// Watershed labels (0 = background or dam).
    pub labels: LabelMap,
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct Detection {
    /// `Ok` or `NoParticlesFound`.
    pub status: Status,
    /// Detected particles, empty when `status` is `NoParticlesFound`.
    pub particles: ParticleList,
    /// Source plane dimensions.
    pub dimensions: Dimensions,
    /// Intermediate buffers, `Some` only when diagnostics were requested.
    pub intermediates: Option<Intermediates>,
}

/// Errors that abort the pipeline before any stage runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The image stack is empty or inconsistent.
    #[error("invalid image stack: {0}")]
    InvalidStack(String),

    /// The point spread function is unusable.
    #[error("invalid point spread function: {0}")]
    InvalidPsf(String),
}

impl PipelineError {
    /// The reported status for configuration errors.
    ///
    /// Resource errors (stack, PSF) have no status of their own and are
    /// reported through the error value only.
    #[must_use]
    pub const fn status(&self) -> Option<Status> {
        match self {
            Self::InvalidConfig(_) => Some(Status::InvalidConfiguration),
            Self::InvalidStack(_) | Self::InvalidPsf(_) => None,
        }
    }
}
