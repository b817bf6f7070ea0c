//! spandex-pipeline: Pure particle detection pipeline (sans-IO).
//!
//! Finds sub-wavelength particles in an SP-IRIS z-stack through:
//! background normalization -> extremum projection -> deconvolution ->
//! adaptive threshold -> watershed -> erosion -> blob detection ->
//! particle filter.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! planes and returns structured data. Image files and command-line
//! handling live in `spandex-cli`.

pub mod blob;
pub mod blur;
pub mod config;
pub mod deconvolve;
pub mod diagnostics;
pub mod fft;
pub mod morphology;
pub mod normalize;
pub mod particle_filter;
pub mod pipeline;
pub mod project;
pub mod rank;
pub mod threshold;
pub mod types;
pub mod watershed;

pub use blob::BlobFilter;
pub use config::{Magnification, MagnificationFlags, PipelineConfig, ValidatedConfig};
pub use deconvolve::{Preconditioner, StopReason, StoppingTolerance};
pub use diagnostics::{PipelineDiagnostics, detect_with_diagnostics};
pub use particle_filter::{ParticleFilter, ParticleFilterKind, Region};
pub use pipeline::Pipeline;
pub use threshold::quantize_to_gray8;
pub use types::{
    Detection, Dimensions, GrayImage, ImageStack, Intermediates, LabelMap, ParticleCandidate,
    ParticleList, PipelineError, PixelBuffer, Psf, Status,
};
pub use watershed::Connectivity;

/// Run the full detection pipeline.
///
/// # Pipeline steps
///
/// 1. Median background normalization and 3D Gaussian smoothing
/// 2. Per-pixel extremum projection, NIR image, σ = 1.5 blur
/// 3. MRNSD deconvolution against the PSF
/// 4. 8-bit quantization and Bernsen threshold
/// 5. Watershed on the inverted restored image, dams removed
/// 6. Erosion at 20x / 50x
/// 7. Connected components filtered by area, circularity and edge contact
/// 8. Particle post-filter (skipped when nothing was found)
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if the configuration is
/// rejected. No stage runs in that case.
pub fn detect(
    stack: &ImageStack,
    psf: &Psf,
    config: &PipelineConfig,
) -> Result<Detection, PipelineError> {
    Ok(Pipeline::new(stack, psf, config)?
        .normalize()
        .project()
        .deconvolve()
        .threshold()
        .segment()
        .refine()
        .detect_blobs()
        .finish())
}
