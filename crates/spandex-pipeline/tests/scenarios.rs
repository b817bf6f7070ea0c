//! Integration test: synthetic z-stacks through the full detection pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use spandex_pipeline::{
    Detection, ImageStack, Magnification, MagnificationFlags, ParticleFilterKind, PipelineConfig,
    PipelineError, Psf, Region, Status,
};

/// Axial profile of the particle contrast through focus.
const FOCUS: [f32; 5] = [0.0, 0.5, 1.0, 0.5, 0.0];

/// A 21×21×5 stack on a background of 50 with a radius-3 disk at (10, 10),
/// blurred by the PSF and modulated through focus.
fn disk_stack(psf: &Psf) -> ImageStack {
    let kernel = psf.buffer();
    let (kw, kh) = kernel.dimensions();
    let (cx, cy) = (i64::from(kw / 2), i64::from(kh / 2));
    let in_disk = |x: i64, y: i64| (x - 10).pow(2) + (y - 10).pow(2) <= 9;

    let blurred_disk = |x: u32, y: u32| -> f32 {
        let mut sum = 0.0;
        for ky in 0..kh {
            for kx in 0..kw {
                let sx = i64::from(x) + i64::from(kx) - cx;
                let sy = i64::from(y) + i64::from(ky) - cy;
                if in_disk(sx, sy) {
                    sum += kernel.get_pixel(kx, ky).0[0];
                }
            }
        }
        sum
    };

    ImageStack::from_fn(21, 21, FOCUS.len(), |x, y, z| {
        150.0f32.mul_add(FOCUS[z] * blurred_disk(x, y), 50.0)
    })
    .unwrap()
}

fn scenario_b_config() -> PipelineConfig {
    PipelineConfig {
        sigma: 1.0,
        magnification: MagnificationFlags::only(Magnification::Low),
        threshold_radius_override: 19,
        ..PipelineConfig::default()
    }
}

fn run_scenario_b(config: &PipelineConfig) -> Detection {
    let psf = Psf::gaussian(1.0).unwrap();
    let stack = disk_stack(&psf);
    spandex_pipeline::detect(&stack, &psf, config).unwrap()
}

#[test]
fn uniform_stack_reports_no_particles() {
    let stack = ImageStack::from_fn(4, 4, 3, |_, _, _| 100.0).unwrap();
    let psf = Psf::gaussian(1.0).unwrap();
    let detection = spandex_pipeline::detect(&stack, &psf, &PipelineConfig::default()).unwrap();
    assert_eq!(detection.status, Status::NoParticlesFound);
    assert!(detection.particles.is_empty());
}

#[test]
fn single_disk_is_detected_once() {
    let detection = run_scenario_b(&scenario_b_config());
    assert_eq!(detection.status, Status::Ok);
    assert_eq!(detection.particles.len(), 1, "{:?}", detection.particles);

    let p = detection.particles[0];
    let centre_x = p.x + f64::from(p.width - 1) / 2.0;
    let centre_y = p.y + f64::from(p.height - 1) / 2.0;
    assert!((centre_x - 10.0).abs() <= 1.0, "centre x {centre_x}");
    assert!((centre_y - 10.0).abs() <= 1.0, "centre y {centre_y}");
    assert!(p.x <= 10.0 && p.x + f64::from(p.width) > 10.0);
    assert!(p.y <= 10.0 && p.y + f64::from(p.height) > 10.0);
}

#[test]
fn candidates_respect_filter_bounds() {
    let config = scenario_b_config();
    let detection = run_scenario_b(&config);
    for p in &detection.particles {
        assert!(p.area >= config.blob_filter.min_area && p.area <= config.blob_filter.max_area);
        assert!(p.circularity >= config.blob_filter.min_circularity);
        assert!(p.circularity <= config.blob_filter.max_circularity);
    }
}

#[test]
fn repeated_runs_are_identical() {
    let config = scenario_b_config();
    let first = run_scenario_b(&config);
    let second = run_scenario_b(&config);
    assert_eq!(first.status, second.status);
    assert_eq!(first.particles, second.particles);
}

#[test]
fn filter_that_drops_everything_still_reports_ok() {
    let config = PipelineConfig {
        particle_filter: ParticleFilterKind::ExcludeRegions(vec![Region {
            x: 0,
            y: 0,
            width: 21,
            height: 21,
        }]),
        ..scenario_b_config()
    };
    let detection = run_scenario_b(&config);
    assert_eq!(detection.status, Status::Ok);
    assert!(detection.particles.is_empty());
}

#[test]
fn intermediates_are_returned_on_request() {
    let config = PipelineConfig {
        emit_diagnostics: true,
        ..scenario_b_config()
    };
    let detection = run_scenario_b(&config);
    let intermediates = detection.intermediates.expect("diagnostics requested");

    assert_eq!(intermediates.ni_stack.depth(), 5);
    assert!(intermediates.nir.pixels().all(|p| p.0[0] >= 0.0));
    assert!(intermediates.restored.pixels().all(|p| p.0[0] >= 0.0));
    assert!(intermediates.threshold_mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    assert!(intermediates.labels.get_pixel(10, 10).0[0] >= 1);
}

#[test]
fn intermediates_are_absent_by_default() {
    let detection = run_scenario_b(&scenario_b_config());
    assert!(detection.intermediates.is_none());
}

#[test]
fn conflicting_magnifications_are_rejected() {
    let config = PipelineConfig {
        magnification: MagnificationFlags {
            low: false,
            mid: true,
            high: true,
        },
        ..scenario_b_config()
    };
    let psf = Psf::gaussian(1.0).unwrap();
    let stack = disk_stack(&psf);
    let err = spandex_pipeline::detect(&stack, &psf, &config).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
    assert_eq!(err.status(), Some(Status::InvalidConfiguration));
}

#[test]
fn diagnostics_run_matches_plain_run() {
    let config = scenario_b_config();
    let psf = Psf::gaussian(1.0).unwrap();
    let stack = disk_stack(&psf);
    let plain = spandex_pipeline::detect(&stack, &psf, &config).unwrap();
    let (detection, diagnostics) =
        spandex_pipeline::detect_with_diagnostics(&stack, &psf, &config).unwrap();
    assert_eq!(plain.particles, detection.particles);
    assert_eq!(diagnostics.summary.particle_count, detection.particles.len());
    assert!(diagnostics.particle_filter.is_some());
}
