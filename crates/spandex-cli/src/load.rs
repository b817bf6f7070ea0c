//! Reading planes and the PSF from image files.
//!
//! Grayscale 8- and 16-bit images keep their raw intensities. Anything
//! else is converted to 16-bit luma first.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, Luma, Primitive};
use spandex_pipeline::{ImageStack, PixelBuffer, Psf};

use crate::error::CliError;

/// Open `path` and widen it to a single-precision plane.
pub fn read_plane(path: &Path) -> Result<PixelBuffer, CliError> {
    let image = image::open(path).map_err(|source| CliError::ReadImage {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(to_pixel_buffer(image))
}

/// Read every plane in z order and assemble the stack.
pub fn read_stack(paths: &[PathBuf]) -> Result<ImageStack, CliError> {
    let planes = paths
        .iter()
        .map(|path| read_plane(path).map(|plane| (path.clone(), plane)))
        .collect::<Result<Vec<_>, _>>()?;
    stack_from_planes(planes)
}

/// Read the point spread function image.
pub fn read_psf(path: &Path) -> Result<Psf, CliError> {
    Ok(Psf::new(read_plane(path)?)?)
}

/// Check plane sizes against the first plane and build the stack.
pub fn stack_from_planes(planes: Vec<(PathBuf, PixelBuffer)>) -> Result<ImageStack, CliError> {
    if let Some((_, first)) = planes.first() {
        let (expected_width, expected_height) = first.dimensions();
        if let Some((path, plane)) = planes
            .iter()
            .find(|(_, plane)| plane.dimensions() != (expected_width, expected_height))
        {
            return Err(CliError::PlaneSize {
                path: path.clone(),
                width: plane.width(),
                height: plane.height(),
                expected_width,
                expected_height,
            });
        }
    }
    let planes = planes.into_iter().map(|(_, plane)| plane).collect();
    Ok(ImageStack::new(planes)?)
}

/// Widen a decoded image to `f32` intensities.
pub fn to_pixel_buffer(image: DynamicImage) -> PixelBuffer {
    match image {
        DynamicImage::ImageLuma8(gray) => widen(&gray),
        DynamicImage::ImageLuma16(gray) => widen(&gray),
        other => {
            log::debug!("converting {:?} input to 16-bit luma", other.color());
            widen(&other.into_luma16())
        }
    }
}

fn widen<T>(gray: &ImageBuffer<Luma<T>, Vec<T>>) -> PixelBuffer
where
    T: Primitive + Into<f32>,
{
    PixelBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y).0[0].into()])
    })
}
