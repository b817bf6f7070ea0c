//! Writing intermediate buffers as PNG files.
//!
//! Floating-point buffers are min/max-stretched to 8 bits, masks are
//! written as-is and the label map is written as 16-bit gray.

use std::path::{Path, PathBuf};

use image::{ExtendedColorType, ImageEncoder, codecs::png::PngEncoder};
use spandex_pipeline::{GrayImage, Intermediates, LabelMap, quantize_to_gray8};

use crate::error::CliError;

/// Encode an 8-bit gray image as PNG bytes.
pub fn encode_gray8(image: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png_bytes = Vec::new();
    PngEncoder::new(&mut png_bytes).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::L8,
    )?;
    Ok(png_bytes)
}

/// Encode a label map as 16-bit gray PNG bytes. Labels above `u16::MAX`
/// saturate.
pub fn encode_labels(labels: &LabelMap) -> Result<Vec<u8>, image::ImageError> {
    let samples: Vec<u8> = labels
        .as_raw()
        .iter()
        .flat_map(|&label| u16::try_from(label).unwrap_or(u16::MAX).to_ne_bytes())
        .collect();
    let mut png_bytes = Vec::new();
    PngEncoder::new(&mut png_bytes).write_image(
        &samples,
        labels.width(),
        labels.height(),
        ExtendedColorType::L16,
    )?;
    Ok(png_bytes)
}

/// Write every intermediate buffer into `dir`, creating it if needed.
///
/// Returns the written paths in the order they were produced.
pub fn write_intermediates(
    dir: &Path,
    intermediates: &Intermediates,
) -> Result<Vec<PathBuf>, CliError> {
    std::fs::create_dir_all(dir).map_err(|source| CliError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::new();
    let mut emit = |name: String,
                    encoded: Result<Vec<u8>, image::ImageError>|
     -> Result<(), CliError> {
        let path = dir.join(name);
        let bytes = encoded.map_err(|source| CliError::Encode {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, &bytes).map_err(|source| CliError::Write {
            path: path.clone(),
            source,
        })?;
        log::info!("wrote {} ({} bytes)", path.display(), bytes.len());
        written.push(path);
        Ok(())
    };

    for (z, plane) in intermediates.ni_stack.planes().iter().enumerate() {
        emit(format!("ni_z{z:02}.png"), encode_gray8(&quantize_to_gray8(plane)))?;
    }
    emit("nir.png".to_string(), encode_gray8(&quantize_to_gray8(&intermediates.nir)))?;
    emit(
        "restored.png".to_string(),
        encode_gray8(&quantize_to_gray8(&intermediates.restored)),
    )?;
    emit(
        "threshold_mask.png".to_string(),
        encode_gray8(&intermediates.threshold_mask),
    )?;
    emit("labels.png".to_string(), encode_labels(&intermediates.labels))?;

    Ok(written)
}
