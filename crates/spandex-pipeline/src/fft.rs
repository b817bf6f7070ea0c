//! Two-dimensional FFT over row-major `f64` buffers.
//!
//! Row-column decomposition: 1D transforms along every row, transpose,
//! 1D transforms along every (former) column, transpose back. Plans are
//! created once per geometry and reused for every transform.

use std::sync::Arc;

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

/// Cached forward/inverse plans for a `width × height` domain.
pub struct Fft2d {
    width: usize,
    height: usize,
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Fft2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2d")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Fft2d {
    /// Plan transforms for a `width × height` buffer.
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            width,
            height,
            row_forward: planner.plan_fft_forward(width),
            row_inverse: planner.plan_fft_inverse(width),
            col_forward: planner.plan_fft_forward(height),
            col_inverse: planner.plan_fft_inverse(height),
        }
    }

    /// Number of samples in the domain.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.width * self.height
    }

    /// Whether the domain is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward transform of a real buffer.
    #[must_use]
    pub fn forward_real(&self, data: &[f64]) -> Vec<Complex64> {
        let mut spectrum: Vec<Complex64> = data.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        self.forward(&mut spectrum);
        spectrum
    }

    /// Inverse transform, keeping the real part. Scaled by `1 / len`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn inverse_real(&self, mut spectrum: Vec<Complex64>) -> Vec<f64> {
        self.inverse(&mut spectrum);
        let scale = 1.0 / self.len() as f64;
        spectrum.into_iter().map(|c| c.re * scale).collect()
    }

    /// In-place unscaled forward transform.
    pub fn forward(&self, data: &mut Vec<Complex64>) {
        self.transform(data, &*self.row_forward, &*self.col_forward);
    }

    /// In-place unscaled inverse transform.
    pub fn inverse(&self, data: &mut Vec<Complex64>) {
        self.transform(data, &*self.row_inverse, &*self.col_inverse);
    }

    fn transform(&self, data: &mut Vec<Complex64>, rows: &dyn Fft<f64>, cols: &dyn Fft<f64>) {
        if self.is_empty() || data.len() != self.len() {
            return;
        }
        // `process` walks the buffer in chunks of the plan length.
        rows.process(data);
        let mut columns = transpose(data, self.width, self.height);
        cols.process(&mut columns);
        *data = transpose(&columns, self.height, self.width);
    }
}

/// Transpose a row-major `width × height` buffer into `height × width`.
fn transpose(src: &[Complex64], width: usize, height: usize) -> Vec<Complex64> {
    let mut dst = vec![Complex64::default(); src.len()];
    for y in 0..height {
        for x in 0..width {
            dst[x * height + y] = src[y * width + x];
        }
    }
    dst
}
