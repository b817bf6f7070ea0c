//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! [`detect_with_diagnostics`] runs the same stages as [`crate::detect`]
//! and records the wall-clock duration and stage-specific metrics of each.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::deconvolve::StopReason;
use crate::pipeline::Pipeline;
use crate::types::{Detection, GrayImage, ImageStack, PipelineError, Psf, Status};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
///
/// The particle filter only runs when blob detection found candidates, so
/// its entry is `None` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: background normalization and 3D smoothing.
    pub normalize: StageDiagnostics,
    /// Stage 2: extremum projection and NIR blur.
    pub projection: StageDiagnostics,
    /// Stage 3: MRNSD deconvolution.
    pub deconvolution: StageDiagnostics,
    /// Stage 4: quantization and Bernsen threshold.
    pub threshold: StageDiagnostics,
    /// Stage 5: watershed segmentation.
    pub watershed: StageDiagnostics,
    /// Stage 6: magnification-dependent erosion.
    pub refine: StageDiagnostics,
    /// Stage 7: connected components and blob filter.
    pub blob_detection: StageDiagnostics,
    /// Stage 8: particle post-filter (only when candidates exist).
    pub particle_filter: Option<StageDiagnostics>,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Background normalization metrics.
    Normalize {
        /// Plane width in pixels.
        width: u32,
        /// Plane height in pixels.
        height: u32,
        /// Number of planes.
        depth: usize,
        /// Half-width of the median background window.
        median_radius: u32,
        /// Lateral smoothing sigma.
        sigma: f32,
        /// Voxels with a (near) zero background.
        guarded_pixels: u64,
    },
    /// Extremum projection metrics.
    Projection {
        /// Smallest value of the blurred NIR image.
        nir_min: f32,
        /// Largest value of the blurred NIR image.
        nir_max: f32,
    },
    /// Deconvolution metrics.
    Deconvolution {
        /// Iterations performed.
        iterations: u32,
        /// Iteration budget.
        max_iterations: u32,
        /// Gradient norm at the end.
        gradient_norm: f64,
        /// Why the iteration ended.
        stop_reason: StopReason,
    },
    /// Adaptive threshold metrics.
    Threshold {
        /// Bernsen disk radius.
        radius: u32,
        /// Bernsen contrast threshold.
        contrast_threshold: u32,
        /// Object pixels in the mask.
        foreground_pixels: u64,
    },
    /// Watershed metrics.
    Watershed {
        /// Seeded regions.
        regions: u32,
        /// Dam pixels separating regions.
        dams: u64,
        /// Object pixels after rebinarization.
        foreground_pixels: u64,
    },
    /// Morphological refinement metrics.
    Refine {
        /// Objective label.
        magnification: String,
        /// Whether the mask was eroded.
        eroded: bool,
        /// Object pixels after refinement.
        foreground_pixels: u64,
    },
    /// Blob detection metrics.
    BlobDetection {
        /// Connected components found.
        components: usize,
        /// Components that passed the blob filter.
        candidates: usize,
    },
    /// Particle post-filter metrics.
    ParticleFilter {
        /// Candidates before filtering.
        before: usize,
        /// Particles after filtering.
        after: usize,
    },
}

/// High-level summary for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Plane width in pixels.
    pub image_width: u32,
    /// Plane height in pixels.
    pub image_height: u32,
    /// Number of planes.
    pub depth: usize,
    /// Terminal status.
    pub status: Status,
    /// Number of reported particles.
    pub particle_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Stack: {}x{}x{}",
            self.summary.image_width, self.summary.image_height, self.summary.depth,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages = vec![
            ("Normalize", &self.normalize),
            ("Projection", &self.projection),
            ("Deconvolution", &self.deconvolution),
            ("Threshold", &self.threshold),
            ("Watershed", &self.watershed),
            ("Refine", &self.refine),
            ("Blob Detection", &self.blob_detection),
        ];
        if let Some(ref f) = self.particle_filter {
            stages.push(("Particle Filter", f));
        }

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Status: {:?}  |  Particles: {}",
            self.summary.status, self.summary.particle_count,
        ));

        lines.join("\n")
    }
}

/// Run the pipeline and record per-stage timing and metrics.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if the configuration is
/// rejected. No stage runs in that case.
pub fn detect_with_diagnostics(
    stack: &ImageStack,
    psf: &Psf,
    config: &PipelineConfig,
) -> Result<(Detection, PipelineDiagnostics), PipelineError> {
    let total_start = Instant::now();
    let pending = Pipeline::new(stack, psf, config)?;

    let start = Instant::now();
    let normalized = pending.normalize();
    let normalize = stage(start, normalized.metrics());

    let start = Instant::now();
    let projected = normalized.project();
    let projection = stage(start, projected.metrics());

    let start = Instant::now();
    let deconvolved = projected.deconvolve();
    let deconvolution = stage(start, deconvolved.metrics());

    let start = Instant::now();
    let thresholded = deconvolved.threshold();
    let threshold = stage(start, thresholded.metrics());

    let start = Instant::now();
    let segmented = thresholded.segment();
    let watershed = stage(start, segmented.metrics());

    let start = Instant::now();
    let refined = segmented.refine();
    let refine = stage(start, refined.metrics());

    let start = Instant::now();
    let blobs = refined.detect_blobs();
    let blob_detection = stage(start, blobs.metrics());

    let before = blobs.candidates().len();
    let start = Instant::now();
    let detection = blobs.finish();
    let particle_filter = (before > 0).then(|| {
        stage(
            start,
            StageMetrics::ParticleFilter {
                before,
                after: detection.particles.len(),
            },
        )
    });

    let diagnostics = PipelineDiagnostics {
        normalize,
        projection,
        deconvolution,
        threshold,
        watershed,
        refine,
        blob_detection,
        particle_filter,
        total_duration: total_start.elapsed(),
        summary: PipelineSummary {
            image_width: detection.dimensions.width,
            image_height: detection.dimensions.height,
            depth: stack.depth(),
            status: detection.status,
            particle_count: detection.particles.len(),
        },
    };
    Ok((detection, diagnostics))
}

fn stage(start: Instant, metrics: StageMetrics) -> StageDiagnostics {
    StageDiagnostics {
        duration: start.elapsed(),
        metrics,
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Normalize {
            width,
            height,
            depth,
            median_radius,
            sigma,
            guarded_pixels,
        } => format!(
            "{width}x{height}x{depth} median_r={median_radius} sigma={sigma:.2} \
             guarded={guarded_pixels}"
        ),
        StageMetrics::Projection { nir_min, nir_max } => {
            format!("nir={nir_min:.4}..{nir_max:.4}")
        }
        StageMetrics::Deconvolution {
            iterations,
            max_iterations,
            gradient_norm,
            stop_reason,
        } => format!("{iterations}/{max_iterations} iters |g|={gradient_norm:.3e} {stop_reason:?}"),
        StageMetrics::Threshold {
            radius,
            contrast_threshold,
            foreground_pixels,
        } => format!("r={radius} contrast={contrast_threshold} fg={foreground_pixels}"),
        StageMetrics::Watershed {
            regions,
            dams,
            foreground_pixels,
        } => format!("{regions} regions, {dams} dams, fg={foreground_pixels}"),
        StageMetrics::Refine {
            magnification,
            eroded,
            foreground_pixels,
        } => format!(
            "{magnification} {} fg={foreground_pixels}",
            if *eroded { "eroded" } else { "unchanged" }
        ),
        StageMetrics::BlobDetection {
            components,
            candidates,
        } => format!("{components} components -> {candidates} candidates"),
        StageMetrics::ParticleFilter { before, after } => format!("{before} -> {after}"),
    }
}

/// Count object pixels (non-zero) in a mask.
pub(crate) fn count_foreground(image: &GrayImage) -> u64 {
    image.pixels().map(|p| u64::from(p.0[0] != 0)).sum()
}
