//! Errors raised by the command-line front end.

use std::path::PathBuf;

use spandex_pipeline::PipelineError;

/// Everything that can stop a `spandex` run.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// An input image could not be opened or decoded.
    #[error("failed to read image {}: {source}", path.display())]
    ReadImage {
        /// The offending file.
        path: PathBuf,
        /// Decoder error.
        source: image::ImageError,
    },

    /// A plane does not match the size of the first plane.
    #[error(
        "plane {} is {width}x{height}, expected {expected_width}x{expected_height}",
        path.display()
    )]
    PlaneSize {
        /// The offending plane.
        path: PathBuf,
        /// Its width.
        width: u32,
        /// Its height.
        height: u32,
        /// Width of the first plane.
        expected_width: u32,
        /// Height of the first plane.
        expected_height: u32,
    },

    /// `--config-json` is not a valid configuration.
    #[error("error parsing --config-json: {0}")]
    ConfigJson(#[source] serde_json::Error),

    /// The JSON report could not be produced.
    #[error("error serializing output: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The pipeline rejected its inputs.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// An intermediate image could not be encoded.
    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        /// Destination file.
        path: PathBuf,
        /// Encoder error.
        source: image::ImageError,
    },

    /// A file or directory could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The logger could not be installed.
    #[error("logger initialization failed: {0}")]
    Logger(#[from] flexi_logger::FlexiLoggerError),
}
