//! spandex: detect particles in an SP-IRIS z-stack from the command line.
//!
//! Loads the planes and the point spread function from image files, runs
//! the detection pipeline and prints the particle list. Optionally prints
//! per-stage diagnostics and writes the intermediate buffers as PNG.
//!
//! # Usage
//!
//! ```text
//! spandex --psf psf.tif [OPTIONS] <PLANE>...
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod error;
mod export;
mod load;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use spandex_pipeline::{
    Detection, Dimensions, MagnificationFlags, ParticleList, PipelineConfig, PipelineDiagnostics,
    Preconditioner, Status,
};

use crate::error::CliError;

/// Particle detection for SP-IRIS reflectance z-stacks.
///
/// Planes are given in z order. Grayscale 8- and 16-bit images are read as
/// raw intensities.
#[derive(Parser)]
#[command(name = "spandex", version)]
struct Cli {
    /// Plane images in z order (PNG or TIFF).
    #[arg(required = true)]
    planes: Vec<PathBuf>,

    /// Point spread function image.
    #[arg(long)]
    psf: PathBuf,

    /// Background window and lateral smoothing parameter.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SIGMA)]
    sigma: f32,

    /// Objective magnification. Repeat to select several (rejected).
    #[arg(long, value_enum)]
    magnification: Vec<Mag>,

    /// Bernsen contrast threshold (defaults to the magnification preset).
    #[arg(long)]
    contrast_threshold: Option<u32>,

    /// Bernsen neighbourhood radius (defaults to the magnification preset).
    #[arg(long)]
    threshold_radius: Option<u32>,

    /// Deconvolution iteration budget.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// Run deconvolution without the FFT preconditioner.
    #[arg(long)]
    no_preconditioner: bool,

    /// Keep blobs touching the image border.
    #[arg(long)]
    keep_edge_particles: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Print the result as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Collect and print per-stage diagnostics.
    #[arg(long)]
    diagnostics: bool,

    /// Write intermediate buffers as PNG files into this directory.
    #[arg(long)]
    intermediates_dir: Option<PathBuf>,

    /// Log level filter (e.g. `warn`, `info`, `debug`, `spandex_pipeline=trace`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Magnification selection.
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mag {
    /// 10x objective.
    Low,
    /// 20x objective.
    Mid,
    /// 50x objective.
    High,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored. `--intermediates-dir` always
/// turns on intermediate collection.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, CliError> {
    let mut config = if let Some(ref json) = cli.config_json {
        serde_json::from_str(json).map_err(CliError::ConfigJson)?
    } else {
        let defaults = PipelineConfig::default();
        let magnification = if cli.magnification.is_empty() {
            defaults.magnification
        } else {
            MagnificationFlags {
                low: cli.magnification.contains(&Mag::Low),
                mid: cli.magnification.contains(&Mag::Mid),
                high: cli.magnification.contains(&Mag::High),
            }
        };
        PipelineConfig {
            sigma: cli.sigma,
            magnification,
            contrast_threshold_override: cli.contrast_threshold.unwrap_or(0),
            threshold_radius_override: cli.threshold_radius.unwrap_or(0),
            max_iterations: cli.max_iterations,
            preconditioner: if cli.no_preconditioner {
                Preconditioner::None
            } else {
                defaults.preconditioner
            },
            blob_filter: spandex_pipeline::BlobFilter {
                exclude_edge_particles: !cli.keep_edge_particles,
                ..defaults.blob_filter
            },
            ..defaults
        }
    };
    if cli.intermediates_dir.is_some() {
        config.emit_diagnostics = true;
    }
    Ok(config)
}

/// JSON shape of a run's result.
#[derive(Serialize)]
struct Report<'a> {
    status: Status,
    dimensions: Dimensions,
    particles: &'a ParticleList,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<&'a PipelineDiagnostics>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _logger = match flexi_logger::Logger::try_with_str(&cli.log_level)
        .and_then(|logger| logger.log_to_stderr().start())
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}", CliError::from(e));
            return ExitCode::FAILURE;
        }
    };

    match run(&cli) {
        Ok(status) => {
            log::info!("finished with status {status:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<Status, CliError> {
    let config = config_from_cli(cli)?;
    log::debug!("config: {config:?}");

    let stack = load::read_stack(&cli.planes)?;
    let psf = load::read_psf(&cli.psf)?;
    log::info!(
        "stack: {}x{}x{}, psf: {}x{}",
        stack.width(),
        stack.height(),
        stack.depth(),
        psf.buffer().width(),
        psf.buffer().height(),
    );

    let (detection, diagnostics) = if cli.diagnostics {
        let (detection, diagnostics) =
            spandex_pipeline::detect_with_diagnostics(&stack, &psf, &config)?;
        (detection, Some(diagnostics))
    } else {
        (spandex_pipeline::detect(&stack, &psf, &config)?, None)
    };

    if let (Some(dir), Some(intermediates)) = (&cli.intermediates_dir, &detection.intermediates) {
        export::write_intermediates(dir, intermediates)?;
    }

    if cli.json {
        let report = Report {
            status: detection.status,
            dimensions: detection.dimensions,
            particles: &detection.particles,
            diagnostics: diagnostics.as_ref(),
        };
        let json = serde_json::to_string_pretty(&report).map_err(CliError::Serialize)?;
        println!("{json}");
    } else {
        println!("{}", particle_table(&detection));
        if let Some(diagnostics) = &diagnostics {
            println!();
            println!("{}", diagnostics.report());
        }
    }

    Ok(detection.status)
}

/// Format the particle list as a fixed-width table.
fn particle_table(detection: &Detection) -> String {
    let mut lines = vec![format!(
        "{:>5}  {:>8}  {:>8}  {:>5}  {:>6}  {:>6}  {:>11}",
        "#", "x", "y", "width", "height", "area", "circularity"
    )];
    lines.extend(detection.particles.iter().enumerate().map(|(i, p)| {
        format!(
            "{:>5}  {:>8.1}  {:>8.1}  {:>5}  {:>6}  {:>6}  {:>11.3}",
            i + 1,
            p.x,
            p.y,
            p.width,
            p.height,
            p.area,
            p.circularity
        )
    }));
    let summary = match detection.status {
        Status::NoParticlesFound => "No particles found".to_string(),
        _ => format!("{} particle(s)", detection.particles.len()),
    };
    lines.push(summary);
    lines.join("\n")
}
