//! Pipeline configuration and its validation.
//!
//! [`PipelineConfig`] mirrors the user-facing parameters one-to-one and is
//! serde-friendly so it can travel as JSON. It is never used directly by
//! the stages: [`PipelineConfig::validate`] resolves it into a
//! [`ValidatedConfig`] with the magnification preset applied, and rejects
//! anything the stages cannot run with before any computation starts.

use serde::{Deserialize, Serialize};

use crate::blob::BlobFilter;
use crate::deconvolve::{DeconvolutionOptions, Preconditioner, StoppingTolerance};
use crate::particle_filter::ParticleFilterKind;
use crate::threshold::BernsenParams;
use crate::types::PipelineError;
use crate::watershed::Connectivity;

/// Objective magnification of the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Magnification {
    /// 10x objective.
    Low,
    /// 20x objective.
    Mid,
    /// 50x objective.
    High,
}

impl Magnification {
    /// Default `(threshold_radius, contrast_threshold)` for this setting.
    #[must_use]
    pub const fn preset(self) -> (u32, u32) {
        match self {
            Self::Low => (14, 8),
            Self::Mid => (15, 9),
            Self::High => (19, 9),
        }
    }

    /// Whether blobs are systematically oversized at this setting and need
    /// an erosion pass.
    #[must_use]
    pub const fn needs_erosion(self) -> bool {
        !matches!(self, Self::Low)
    }

    /// Objective label used in reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "10x",
            Self::Mid => "20x",
            Self::High => "50x",
        }
    }
}

/// One checkbox per magnification. Exactly one must be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagnificationFlags {
    /// 10x objective.
    pub low: bool,
    /// 20x objective.
    pub mid: bool,
    /// 50x objective.
    pub high: bool,
}

impl Default for MagnificationFlags {
    fn default() -> Self {
        Self::only(Magnification::Low)
    }
}

impl MagnificationFlags {
    /// Flags with exactly `magnification` set.
    #[must_use]
    pub const fn only(magnification: Magnification) -> Self {
        Self {
            low: matches!(magnification, Magnification::Low),
            mid: matches!(magnification, Magnification::Mid),
            high: matches!(magnification, Magnification::High),
        }
    }

    /// The selected magnification, if exactly one flag is set.
    #[must_use]
    pub const fn selected(self) -> Option<Magnification> {
        match (self.low, self.mid, self.high) {
            (true, false, false) => Some(Magnification::Low),
            (false, true, false) => Some(Magnification::Mid),
            (false, false, true) => Some(Magnification::High),
            _ => None,
        }
    }

    const fn count(self) -> u8 {
        self.low as u8 + self.mid as u8 + self.high as u8
    }
}

/// User-facing configuration for the detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Blur parameter. Sets the median background window half-width
    /// (`round(20·σ)`) and the lateral sigma of the 3D smoothing.
    pub sigma: f32,

    /// Magnification checkboxes.
    pub magnification: MagnificationFlags,

    /// Bernsen contrast threshold. 0 keeps the magnification preset.
    pub contrast_threshold_override: u32,

    /// Bernsen neighbourhood radius. 0 keeps the magnification preset.
    pub threshold_radius_override: u32,

    /// Deconvolution iteration budget.
    pub max_iterations: u32,

    /// Keep the intermediate buffers in the returned [`crate::Detection`].
    pub emit_diagnostics: bool,

    /// Early-stopping rule for the deconvolver.
    pub stopping_tolerance: StoppingTolerance,

    /// Frequency-domain preconditioning of the deconvolver.
    pub preconditioner: Preconditioner,

    /// Restored values below this are set to zero.
    pub output_threshold: Option<f64>,

    /// Pixel connectivity used by the watershed flooding.
    pub watershed_connectivity: Connectivity,

    /// Area / circularity bounds and edge exclusion for blobs.
    pub blob_filter: BlobFilter,

    /// Post-filter applied to detected candidates.
    pub particle_filter: ParticleFilterKind,
}

impl PipelineConfig {
    /// Default blur parameter.
    pub const DEFAULT_SIGMA: f32 = 1.5;

    /// Default deconvolution iteration budget.
    pub const DEFAULT_MAX_ITERATIONS: u32 = 9;

    /// Largest accepted Bernsen neighbourhood radius.
    pub const MAX_THRESHOLD_RADIUS: u32 = crate::rank::MAX_DISK_RADIUS;

    /// Resolve the preset and check every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when zero or more than one
    /// magnification is selected, `sigma` is not positive and finite,
    /// `max_iterations` is zero, or any nested option is out of range.
    pub fn validate(&self) -> Result<ValidatedConfig, PipelineError> {
        let Some(magnification) = self.magnification.selected() else {
            return Err(PipelineError::InvalidConfig(format!(
                "exactly one magnification must be selected, got {}",
                self.magnification.count(),
            )));
        };
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "sigma must be positive, got {}",
                self.sigma,
            )));
        }
        if self.max_iterations == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if let Some(t) = self.output_threshold
            && !t.is_finite()
        {
            return Err(PipelineError::InvalidConfig(format!(
                "output_threshold must be finite, got {t}"
            )));
        }
        self.stopping_tolerance.check()?;
        self.preconditioner.check()?;
        self.blob_filter.check()?;

        let (preset_radius, preset_contrast) = magnification.preset();
        let threshold_radius = if self.threshold_radius_override == 0 {
            preset_radius
        } else {
            self.threshold_radius_override
        };
        let contrast_threshold = if self.contrast_threshold_override == 0 {
            preset_contrast
        } else {
            self.contrast_threshold_override
        };
        if threshold_radius > Self::MAX_THRESHOLD_RADIUS {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold radius must be at most {}, got {threshold_radius}",
                Self::MAX_THRESHOLD_RADIUS,
            )));
        }

        Ok(ValidatedConfig {
            sigma: self.sigma,
            magnification,
            bernsen: BernsenParams {
                radius: threshold_radius,
                contrast_threshold: Some(contrast_threshold),
                object_is_white: true,
            },
            deconvolution: DeconvolutionOptions {
                max_iterations: self.max_iterations,
                stopping_tolerance: self.stopping_tolerance,
                preconditioner: self.preconditioner,
                output_threshold: self.output_threshold,
            },
            watershed_connectivity: self.watershed_connectivity,
            blob_filter: self.blob_filter,
            particle_filter: self.particle_filter.clone(),
            emit_diagnostics: self.emit_diagnostics,
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sigma: Self::DEFAULT_SIGMA,
            magnification: MagnificationFlags::default(),
            contrast_threshold_override: 0,
            threshold_radius_override: 0,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            emit_diagnostics: false,
            stopping_tolerance: StoppingTolerance::default(),
            preconditioner: Preconditioner::default(),
            output_threshold: None,
            watershed_connectivity: Connectivity::default(),
            blob_filter: BlobFilter::default(),
            particle_filter: ParticleFilterKind::default(),
        }
    }
}

/// A configuration the stages can run with.
///
/// Only obtainable through [`PipelineConfig::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    /// Blur parameter.
    pub sigma: f32,
    /// The single selected magnification.
    pub magnification: Magnification,
    /// Resolved Bernsen parameters.
    pub bernsen: BernsenParams,
    /// Resolved deconvolver options.
    pub deconvolution: DeconvolutionOptions,
    /// Watershed connectivity.
    pub watershed_connectivity: Connectivity,
    /// Blob bounds.
    pub blob_filter: BlobFilter,
    /// Candidate post-filter.
    pub particle_filter: ParticleFilterKind,
    /// Keep intermediates.
    pub emit_diagnostics: bool,
}

impl ValidatedConfig {
    /// Half-width of the median background window, `round(20·σ)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn median_radius(&self) -> u32 {
        (20.0 * self.sigma).round() as u32
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let validated = PipelineConfig::default().validate().unwrap();
        assert_eq!(validated.magnification, Magnification::Low);
        assert_eq!(validated.bernsen.radius, 14);
        assert_eq!(validated.bernsen.contrast_threshold, Some(8));
        assert_eq!(validated.deconvolution.max_iterations, 9);
        assert_eq!(validated.median_radius(), 30);
    }

    #[test]
    fn presets_per_magnification() {
        for (mag, radius, contrast) in [
            (Magnification::Low, 14, 8),
            (Magnification::Mid, 15, 9),
            (Magnification::High, 19, 9),
        ] {
            let config = PipelineConfig {
                magnification: MagnificationFlags::only(mag),
                ..PipelineConfig::default()
            };
            let v = config.validate().unwrap();
            assert_eq!(v.bernsen.radius, radius);
            assert_eq!(v.bernsen.contrast_threshold, Some(contrast));
        }
    }

    #[test]
    fn overrides_replace_preset() {
        let config = PipelineConfig {
            contrast_threshold_override: 4,
            threshold_radius_override: 7,
            ..PipelineConfig::default()
        };
        let v = config.validate().unwrap();
        assert_eq!(v.bernsen.radius, 7);
        assert_eq!(v.bernsen.contrast_threshold, Some(4));
    }

    #[test]
    fn no_magnification_is_rejected() {
        let config = PipelineConfig {
            magnification: MagnificationFlags {
                low: false,
                mid: false,
                high: false,
            },
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid pipeline configuration: exactly one magnification must be selected, got 0",
        );
    }

    #[test]
    fn two_magnifications_are_rejected() {
        let config = PipelineConfig {
            magnification: MagnificationFlags {
                low: true,
                mid: false,
                high: true,
            },
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn non_positive_sigma_is_rejected() {
        for sigma in [0.0, -1.0, f32::NAN] {
            let config = PipelineConfig {
                sigma,
                ..PipelineConfig::default()
            };
            assert!(config.validate().is_err(), "sigma={sigma} accepted");
        }
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let config = PipelineConfig {
            max_iterations: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_threshold_radius_is_rejected() {
        let config = PipelineConfig {
            threshold_radius_override: 256,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn erosion_only_above_low() {
        assert!(!Magnification::Low.needs_erosion());
        assert!(Magnification::Mid.needs_erosion());
        assert!(Magnification::High.needs_erosion());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"sigma": 2.0, "magnification": {"low": false, "mid": true, "high": false}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!((config.sigma - 2.0).abs() < f32::EPSILON);
        assert_eq!(config.magnification.selected(), Some(Magnification::Mid));
        assert_eq!(config.max_iterations, PipelineConfig::DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn config_serde_round_trip() {
        let config = PipelineConfig {
            sigma: 0.8,
            magnification: MagnificationFlags::only(Magnification::High),
            emit_diagnostics: true,
            output_threshold: Some(0.01),
            ..PipelineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
