//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! [`crate::detect`] runs every stage in one call. [`Pipeline`] lets the
//! caller drive execution one step at a time:
//!
//! ```rust
//! # use spandex_pipeline::{ImageStack, Pipeline, PipelineConfig, PipelineError, Psf};
//! # fn run(stack: &ImageStack, psf: &Psf) -> Result<(), PipelineError> {
//! let config = PipelineConfig::default();
//! let detection = Pipeline::new(stack, psf, &config)?
//!     .normalize()
//!     .project()
//!     .deconvolve()
//!     .threshold()
//!     .segment()
//!     .refine()
//!     .detect_blobs()
//!     .finish();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state. The
//! configuration is validated once, in [`Pipeline::new`]; every later
//! transition is infallible.
//!
//! # Memory
//!
//! With `emit_diagnostics` unset each stage drops the buffers it no
//! longer needs. With it set, the NI stack, NIR, restored image,
//! threshold mask and label map are moved into the final
//! [`Detection::intermediates`] instead.

use crate::blob::BlobDetection;
use crate::config::{PipelineConfig, ValidatedConfig};
use crate::deconvolve::{Restoration, StopReason};
use crate::diagnostics::{StageMetrics, count_foreground};
use crate::normalize::NormalizedStack;
use crate::particle_filter::ParticleFilter;
use crate::project::ExtremumMap;
use crate::types::{
    Detection, Dimensions, GrayImage, ImageStack, Intermediates, LabelMap, ParticleCandidate,
    PipelineError, PixelBuffer, Psf, Status,
};
use crate::watershed::Segmentation;

/// State shared by every stage after validation.
struct Context<'a> {
    psf: &'a Psf,
    config: ValidatedConfig,
    dimensions: Dimensions,
    retained: Retained,
}

/// Buffers kept for [`Intermediates`] when diagnostics are requested.
#[derive(Default)]
struct Retained {
    ni_stack: Option<ImageStack>,
    nir: Option<PixelBuffer>,
    restored: Option<PixelBuffer>,
    threshold_mask: Option<GrayImage>,
    labels: Option<LabelMap>,
}

impl Retained {
    fn into_intermediates(self) -> Option<Intermediates> {
        Some(Intermediates {
            ni_stack: self.ni_stack?,
            nir: self.nir?,
            restored: self.restored?,
            threshold_mask: self.threshold_mask?,
            labels: self.labels?,
        })
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`normalize`](Self::normalize) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .normalize() to continue"]
pub struct Pending<'a> {
    stack: &'a ImageStack,
    context: Context<'a>,
}

impl<'a> Pending<'a> {
    /// The input stack.
    #[must_use]
    pub const fn stack(&self) -> &ImageStack {
        self.stack
    }

    /// The resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &ValidatedConfig {
        &self.context.config
    }

    /// Normalize against the median background and smooth in 3D.
    pub fn normalize(self) -> Normalized<'a> {
        let config = &self.context.config;
        let median_radius = config.median_radius();
        let normalized = crate::normalize::normalize_stack(self.stack, config.sigma, median_radius);
        log::debug!(
            "normalize: {}x{}x{} median radius {median_radius}, {} guarded voxel(s)",
            self.stack.width(),
            self.stack.height(),
            self.stack.depth(),
            normalized.guarded_pixels,
        );
        Normalized {
            context: self.context,
            median_radius,
            normalized,
        }
    }
}

// ───────────────────────── Stage 1: Normalized ───────────────────────

/// Pipeline state after background normalization.
///
/// Call [`project`](Self::project) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .project() to continue"]
pub struct Normalized<'a> {
    context: Context<'a>,
    median_radius: u32,
    normalized: NormalizedStack,
}

impl<'a> Normalized<'a> {
    /// The smoothed normalized-intensity stack.
    #[must_use]
    pub const fn ni_stack(&self) -> &ImageStack {
        &self.normalized.stack
    }

    /// Voxels whose background was (near) zero.
    #[must_use]
    pub const fn guarded_pixels(&self) -> u64 {
        self.normalized.guarded_pixels
    }

    /// Metrics for the normalization step.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let stack = &self.normalized.stack;
        StageMetrics::Normalize {
            width: stack.width(),
            height: stack.height(),
            depth: stack.depth(),
            median_radius: self.median_radius,
            sigma: self.context.config.sigma,
            guarded_pixels: self.normalized.guarded_pixels,
        }
    }

    /// Project the extremes over z and blur the NIR image.
    pub fn project(self) -> Projected<'a> {
        let mut context = self.context;
        let extrema = crate::project::extremum_projection(&self.normalized.stack);
        let nir = crate::project::blurred_nir(&extrema);
        if context.config.emit_diagnostics {
            context.retained.ni_stack = Some(self.normalized.stack);
            context.retained.nir = Some(extrema.range());
        }
        let (nir_min, nir_max) = value_range(&nir);
        log::debug!("project: NIR range {nir_min:.4}..{nir_max:.4}");
        Projected {
            context,
            extrema,
            nir,
        }
    }
}

// ───────────────────────── Stage 2: Projected ────────────────────────

/// Pipeline state after the extremum projection.
///
/// Call [`deconvolve`](Self::deconvolve) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .deconvolve() to continue"]
pub struct Projected<'a> {
    context: Context<'a>,
    extrema: ExtremumMap,
    nir: PixelBuffer,
}

impl Projected<'_> {
    /// Per-pixel extremes and their plane indices.
    #[must_use]
    pub const fn extrema(&self) -> &ExtremumMap {
        &self.extrema
    }

    /// The blurred NIR image handed to the deconvolver.
    #[must_use]
    pub const fn nir(&self) -> &PixelBuffer {
        &self.nir
    }

    /// Metrics for the projection step.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let (nir_min, nir_max) = value_range(&self.nir);
        StageMetrics::Projection { nir_min, nir_max }
    }

    /// Restore the NIR image against the PSF.
    pub fn deconvolve(self) -> Deconvolved {
        let context = self.context;
        let restoration =
            crate::deconvolve::mrnsd(&self.nir, context.psf, &context.config.deconvolution);
        log::debug!(
            "deconvolve: {} iteration(s), |g| = {:.3e}, {:?}",
            restoration.iterations,
            restoration.gradient_norm,
            restoration.stop_reason,
        );
        Deconvolved {
            config: context.config,
            dimensions: context.dimensions,
            retained: context.retained,
            restoration,
        }
    }
}

// ───────────────────────── Stage 3: Deconvolved ──────────────────────

/// Pipeline state after deconvolution.
///
/// Call [`threshold`](Self::threshold) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .threshold() to continue"]
pub struct Deconvolved {
    config: ValidatedConfig,
    dimensions: Dimensions,
    retained: Retained,
    restoration: Restoration,
}

impl Deconvolved {
    /// The restored image.
    #[must_use]
    pub const fn restored(&self) -> &PixelBuffer {
        &self.restoration.image
    }

    /// Iterations the deconvolver performed.
    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.restoration.iterations
    }

    /// Why the deconvolver stopped.
    #[must_use]
    pub const fn stop_reason(&self) -> StopReason {
        self.restoration.stop_reason
    }

    /// Metrics for the deconvolution step.
    #[must_use]
    pub const fn metrics(&self) -> StageMetrics {
        StageMetrics::Deconvolution {
            iterations: self.restoration.iterations,
            max_iterations: self.config.deconvolution.max_iterations,
            gradient_norm: self.restoration.gradient_norm,
            stop_reason: self.restoration.stop_reason,
        }
    }

    /// Quantize to 8 bits and apply the Bernsen threshold.
    pub fn threshold(self) -> Thresholded {
        let gray = crate::threshold::quantize_to_gray8(&self.restoration.image);
        let mask = crate::threshold::bernsen(&gray, &self.config.bernsen);
        log::debug!(
            "threshold: radius {}, {} foreground pixel(s)",
            self.config.bernsen.radius,
            count_foreground(&mask),
        );
        Thresholded {
            config: self.config,
            dimensions: self.dimensions,
            retained: self.retained,
            restored: self.restoration.image,
            mask,
        }
    }
}

// ───────────────────────── Stage 4: Thresholded ──────────────────────

/// Pipeline state after adaptive thresholding.
///
/// Call [`segment`](Self::segment) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .segment() to continue"]
pub struct Thresholded {
    config: ValidatedConfig,
    dimensions: Dimensions,
    retained: Retained,
    restored: PixelBuffer,
    mask: GrayImage,
}

impl Thresholded {
    /// The Bernsen threshold mask.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Metrics for the threshold step.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Threshold {
            radius: self.config.bernsen.radius,
            contrast_threshold: self
                .config
                .bernsen
                .contrast_threshold
                .unwrap_or(crate::threshold::DEFAULT_CONTRAST_THRESHOLD),
            foreground_pixels: count_foreground(&self.mask),
        }
    }

    /// Split touching particles with a watershed inside the mask.
    pub fn segment(self) -> Segmented {
        let surface = crate::watershed::invert(&self.restored);
        let segmentation =
            crate::watershed::watershed(&surface, &self.mask, self.config.watershed_connectivity);
        let mask = crate::watershed::binarize_labels(&segmentation.labels);
        log::debug!(
            "segment: {} region(s), {} dam pixel(s)",
            segmentation.regions,
            segmentation.dams,
        );

        let mut retained = self.retained;
        if self.config.emit_diagnostics {
            retained.restored = Some(self.restored);
            retained.threshold_mask = Some(self.mask);
        }
        Segmented {
            config: self.config,
            dimensions: self.dimensions,
            retained,
            segmentation,
            mask,
        }
    }
}

// ───────────────────────── Stage 5: Segmented ────────────────────────

/// Pipeline state after watershed segmentation.
///
/// Call [`refine`](Self::refine) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .refine() to continue"]
pub struct Segmented {
    config: ValidatedConfig,
    dimensions: Dimensions,
    retained: Retained,
    segmentation: Segmentation,
    mask: GrayImage,
}

impl Segmented {
    /// Region labels (0 for background and dams).
    #[must_use]
    pub const fn labels(&self) -> &LabelMap {
        &self.segmentation.labels
    }

    /// Number of watershed regions.
    #[must_use]
    pub const fn regions(&self) -> u32 {
        self.segmentation.regions
    }

    /// The labels rebinarized, dams removed.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Metrics for the watershed step.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Watershed {
            regions: self.segmentation.regions,
            dams: self.segmentation.dams,
            foreground_pixels: count_foreground(&self.mask),
        }
    }

    /// Apply the magnification-dependent erosion.
    pub fn refine(self) -> Refined {
        let magnification = self.config.magnification;
        let mask = crate::morphology::refine(self.mask, magnification);
        log::debug!(
            "refine: {} ({})",
            magnification.label(),
            if magnification.needs_erosion() { "eroded" } else { "unchanged" },
        );

        let mut retained = self.retained;
        if self.config.emit_diagnostics {
            retained.labels = Some(self.segmentation.labels);
        }
        Refined {
            config: self.config,
            dimensions: self.dimensions,
            retained,
            mask,
        }
    }
}

// ───────────────────────── Stage 6: Refined ──────────────────────────

/// Pipeline state after the morphological correction.
///
/// Call [`detect_blobs`](Self::detect_blobs) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .detect_blobs() to continue"]
pub struct Refined {
    config: ValidatedConfig,
    dimensions: Dimensions,
    retained: Retained,
    mask: GrayImage,
}

impl Refined {
    /// The final particle mask.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Metrics for the refinement step.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let magnification = self.config.magnification;
        StageMetrics::Refine {
            magnification: magnification.label().to_string(),
            eroded: magnification.needs_erosion(),
            foreground_pixels: count_foreground(&self.mask),
        }
    }

    /// Extract and filter connected components.
    pub fn detect_blobs(self) -> BlobsDetected {
        let detection = crate::blob::detect_blobs(&self.mask, &self.config.blob_filter);
        log::debug!(
            "detect_blobs: {} component(s), {} candidate(s)",
            detection.components,
            detection.candidates.len(),
        );
        BlobsDetected {
            config: self.config,
            dimensions: self.dimensions,
            retained: self.retained,
            detection,
        }
    }
}

// ───────────────────────── Stage 7: BlobsDetected ────────────────────

/// Pipeline state after blob detection.
///
/// Call [`finish`](Self::finish) to run the particle filter and produce
/// the [`Detection`].
#[must_use = "pipeline stages are consumed by advancing; call .finish() to continue"]
pub struct BlobsDetected {
    config: ValidatedConfig,
    dimensions: Dimensions,
    retained: Retained,
    detection: BlobDetection,
}

impl BlobsDetected {
    /// Candidates that passed the blob filter.
    #[must_use]
    pub fn candidates(&self) -> &[ParticleCandidate] {
        &self.detection.candidates
    }

    /// Number of components before the blob filter.
    #[must_use]
    pub const fn components(&self) -> usize {
        self.detection.components
    }

    /// Metrics for the blob detection step.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::BlobDetection {
            components: self.detection.components,
            candidates: self.detection.candidates.len(),
        }
    }

    /// Run the particle filter and assemble the result.
    ///
    /// With no candidates the status is [`Status::NoParticlesFound`] and the
    /// filter is not invoked.
    pub fn finish(self) -> Detection {
        let candidates = self.detection.candidates;
        let (status, particles) = if candidates.is_empty() {
            log::info!("no particles found");
            (Status::NoParticlesFound, candidates)
        } else {
            let before = candidates.len();
            let particles = self.config.particle_filter.apply(candidates);
            log::debug!("particle filter: {before} -> {}", particles.len());
            (Status::Ok, particles)
        };

        Detection {
            status,
            particles,
            dimensions: self.dimensions,
            intermediates: self.retained.into_intermediates(),
        }
    }
}

/// Entry point for stage-by-stage execution.
///
/// Each stage method consumes the current state and returns the next,
/// making it a compile-time error to skip stages or call them out of
/// order.
pub struct Pipeline;

impl Pipeline {
    /// Validate `config` and prepare a run over `stack` with `psf`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the configuration is
    /// rejected. No stage runs in that case.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<'a>(
        stack: &'a ImageStack,
        psf: &'a Psf,
        config: &PipelineConfig,
    ) -> Result<Pending<'a>, PipelineError> {
        let config = config.validate()?;
        log::debug!(
            "pipeline: {} magnification, sigma {}, Bernsen radius {} contrast {:?}",
            config.magnification.label(),
            config.sigma,
            config.bernsen.radius,
            config.bernsen.contrast_threshold,
        );
        Ok(Pending {
            stack,
            context: Context {
                psf,
                config,
                dimensions: stack.dimensions(),
                retained: Retained::default(),
            },
        })
    }
}

/// Smallest and largest finite value of a plane, `(0, 0)` if none.
fn value_range(image: &PixelBuffer) -> (f32, f32) {
    image
        .pixels()
        .map(|p| p.0[0])
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<(f32, f32)>, v| {
            Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
        })
        .unwrap_or((0.0, 0.0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Magnification, MagnificationFlags};

    fn uniform_stack() -> ImageStack {
        ImageStack::from_fn(4, 4, 3, |_, _, _| 100.0).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_before_any_stage() {
        let config = PipelineConfig {
            magnification: MagnificationFlags {
                low: true,
                mid: true,
                high: false,
            },
            ..PipelineConfig::default()
        };
        let psf = Psf::gaussian(1.0).unwrap();
        let err = Pipeline::new(&uniform_stack(), &psf, &config).err().unwrap();
        assert_eq!(err.status(), Some(Status::InvalidConfiguration));
    }

    #[test]
    fn stages_expose_their_outputs() {
        let stack = uniform_stack();
        let psf = Psf::gaussian(1.0).unwrap();
        let config = PipelineConfig {
            magnification: MagnificationFlags::only(Magnification::Mid),
            ..PipelineConfig::default()
        };

        let pending = Pipeline::new(&stack, &psf, &config).unwrap();
        assert_eq!(pending.config().magnification, Magnification::Mid);
        assert_eq!(pending.stack().depth(), 3);

        let normalized = pending.normalize();
        assert_eq!(normalized.ni_stack().depth(), 3);
        assert_eq!(normalized.guarded_pixels(), 0);

        let projected = normalized.project();
        assert_eq!(projected.nir().dimensions(), (4, 4));
        assert_eq!(projected.extrema().max_idx.dimensions(), (4, 4));

        let deconvolved = projected.deconvolve();
        assert!(deconvolved.iterations() <= 9);
        assert!(deconvolved.restored().pixels().all(|p| p.0[0] >= 0.0));

        let thresholded = deconvolved.threshold();
        assert!(thresholded.mask().pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));

        let segmented = thresholded.segment();
        let refined = segmented.refine();
        let blobs = refined.detect_blobs();
        assert!(blobs.candidates().is_empty());

        let detection = blobs.finish();
        assert_eq!(detection.status, Status::NoParticlesFound);
        assert!(detection.intermediates.is_none());
    }

    #[test]
    fn emit_diagnostics_keeps_every_intermediate() {
        let stack = uniform_stack();
        let psf = Psf::gaussian(1.0).unwrap();
        let config = PipelineConfig {
            emit_diagnostics: true,
            ..PipelineConfig::default()
        };
        let detection = crate::detect(&stack, &psf, &config).unwrap();
        let intermediates = detection.intermediates.unwrap();
        assert_eq!(intermediates.ni_stack.depth(), 3);
        assert_eq!(intermediates.nir.dimensions(), (4, 4));
        assert_eq!(intermediates.restored.dimensions(), (4, 4));
        assert_eq!(intermediates.threshold_mask.dimensions(), (4, 4));
        assert_eq!(intermediates.labels.dimensions(), (4, 4));
    }

    #[test]
    fn value_range_skips_non_finite() {
        let img =
            PixelBuffer::from_fn(3, 1, |x, _| image::Luma([[1.0, f32::NAN, -2.0][x as usize]]));
        assert_eq!(value_range(&img), (-2.0, 1.0));
        assert_eq!(value_range(&PixelBuffer::new(0, 0)), (0.0, 0.0));
    }
}
