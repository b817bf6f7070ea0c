//! Nonnegative image restoration with MRNSD.
//!
//! Modified Residual Norm Steepest Descent minimizes `‖Hx − b‖²` subject
//! to `x ≥ 0`, where `H` is convolution with the point spread function.
//! Each step moves along the scaled gradient `s = x ⊙ M⁻¹g` with an exact
//! line search capped so no pixel crosses zero.
//!
//! `H` is applied as a circulant operator on a reflexively padded domain
//! (`x[-1] = x[0]`), via [`Fft2d`]. The padding is as wide as the PSF
//! extends on either side of its centre, so the wraparound never reaches
//! the cropped result.

use image::Luma;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::fft::Fft2d;
use crate::types::{PipelineError, PixelBuffer, Psf};

/// When to stop before the iteration budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum StoppingTolerance {
    /// Always run the full budget.
    Disabled,
    /// Stop once `‖g‖ ≤ √ε · ‖Hᵀb‖`.
    #[default]
    Auto,
    /// Stop once `‖g‖` is at or below the given value.
    Fixed(f64),
}

impl StoppingTolerance {
    pub(crate) fn check(self) -> Result<(), PipelineError> {
        match self {
            Self::Fixed(t) if !(t.is_finite() && t >= 0.0) => Err(PipelineError::InvalidConfig(
                format!("stopping tolerance must be a non-negative number, got {t}"),
            )),
            _ => Ok(()),
        }
    }

    fn resolve(self, transpose_b_norm: f64) -> Option<f64> {
        match self {
            Self::Disabled => None,
            Self::Auto => Some(f64::EPSILON.sqrt() * transpose_b_norm),
            Self::Fixed(t) => Some(t),
        }
    }
}

/// Frequency-domain preconditioning of the descent direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Preconditioner {
    /// Plain gradient, `M = I`.
    None,
    /// `M̂ = |P̂|²` with `P̂ = Ĥ` where `|Ĥ| ≥ tolerance`, else 1.
    ///
    /// `None` picks `0.1 · max|Ĥ|`.
    Fft {
        /// Spectral magnitude below which the PSF is not inverted.
        tolerance: Option<f64>,
    },
}

impl Default for Preconditioner {
    fn default() -> Self {
        Self::Fft { tolerance: None }
    }
}

impl Preconditioner {
    /// Fraction of the peak spectral magnitude used as automatic tolerance.
    pub const AUTO_TOLERANCE_FRACTION: f64 = 0.1;

    pub(crate) fn check(self) -> Result<(), PipelineError> {
        match self {
            Self::Fft { tolerance: Some(t) } if !(t.is_finite() && t > 0.0) => {
                Err(PipelineError::InvalidConfig(format!(
                    "preconditioner tolerance must be positive, got {t}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Resolved deconvolver settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeconvolutionOptions {
    /// Iteration budget.
    pub max_iterations: u32,
    /// Early-stopping rule.
    pub stopping_tolerance: StoppingTolerance,
    /// Descent direction scaling.
    pub preconditioner: Preconditioner,
    /// Restored values below this are set to zero.
    pub output_threshold: Option<f64>,
}

impl Default for DeconvolutionOptions {
    fn default() -> Self {
        Self {
            max_iterations: 9,
            stopping_tolerance: StoppingTolerance::default(),
            preconditioner: Preconditioner::default(),
            output_threshold: None,
        }
    }
}

/// Why the iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The iteration budget was spent.
    IterationLimit,
    /// The gradient norm fell to the stopping tolerance.
    Converged,
    /// The scaled gradient was not a descent direction.
    NonDescent,
    /// The step length was not finite (`H s = 0`).
    Degenerate,
}

/// Output of [`mrnsd`].
#[derive(Debug, Clone)]
pub struct Restoration {
    /// Restored image, same size as the input, all values `≥ 0`.
    pub image: PixelBuffer,
    /// Iterations performed.
    pub iterations: u32,
    /// Gradient norm when the iteration ended.
    pub gradient_norm: f64,
    /// Why the iteration ended.
    pub stop_reason: StopReason,
}

/// Restore `blurred` against `psf`.
#[must_use = "returns the restored image"]
pub fn mrnsd(blurred: &PixelBuffer, psf: &Psf, options: &DeconvolutionOptions) -> Restoration {
    let (w, h) = blurred.dimensions();
    let kernel = Kernel::from_psf(psf);
    let domain = Padding::new(w as usize, h as usize, &kernel);
    let operator = Operator::new(&domain, &kernel, options.preconditioner);

    let b = domain.pad(blurred);
    let (x, outcome) = iterate(&operator, &b, options);

    if outcome.stop_reason == StopReason::NonDescent {
        log::warn!(
            "deconvolution stopped after {} iteration(s): no descent direction",
            outcome.iterations,
        );
    }

    let floor = options.output_threshold.unwrap_or(0.0);
    let image = PixelBuffer::from_fn(w, h, |px, py| {
        let v = x[domain.index(px as usize + domain.pad_x, py as usize + domain.pad_y)];
        #[allow(clippy::cast_possible_truncation)]
        let restored = if v < floor { 0.0 } else { v.max(0.0) as f32 };
        Luma([restored])
    });

    Restoration {
        image,
        iterations: outcome.iterations,
        gradient_norm: outcome.gradient_norm,
        stop_reason: outcome.stop_reason,
    }
}

/// PSF normalized to unit sum with its centre at the first maximum.
struct Kernel {
    width: usize,
    height: usize,
    cx: usize,
    cy: usize,
    values: Vec<f64>,
}

impl Kernel {
    fn from_psf(psf: &Psf) -> Self {
        let buffer = psf.buffer();
        let width = buffer.width() as usize;
        let height = buffer.height() as usize;
        let raw: Vec<f64> = buffer.pixels().map(|p| f64::from(p.0[0])).collect();
        let sum: f64 = raw.iter().sum();

        let mut peak = 0;
        for (i, &v) in raw.iter().enumerate() {
            if v > raw[peak] {
                peak = i;
            }
        }

        Self {
            width,
            height,
            cx: peak % width.max(1),
            cy: peak / width.max(1),
            values: raw.into_iter().map(|v| v / sum).collect(),
        }
    }
}

/// Geometry of the padded working domain.
struct Padding {
    width: usize,
    height: usize,
    pad_x: usize,
    pad_y: usize,
    padded_width: usize,
    padded_height: usize,
}

impl Padding {
    fn new(width: usize, height: usize, kernel: &Kernel) -> Self {
        let pad_x = kernel.cx.max(kernel.width - 1 - kernel.cx);
        let pad_y = kernel.cy.max(kernel.height - 1 - kernel.cy);
        Self {
            width,
            height,
            pad_x,
            pad_y,
            padded_width: width + 2 * pad_x,
            padded_height: height + 2 * pad_y,
        }
    }

    const fn len(&self) -> usize {
        self.padded_width * self.padded_height
    }

    const fn index(&self, x: usize, y: usize) -> usize {
        y * self.padded_width + x
    }

    /// Symmetric extension of `image` into the padded domain.
    #[allow(clippy::cast_possible_wrap)]
    fn pad(&self, image: &PixelBuffer) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.len());
        for y in 0..self.padded_height {
            let sy = reflect(y as isize - self.pad_y as isize, self.height);
            for x in 0..self.padded_width {
                let sx = reflect(x as isize - self.pad_x as isize, self.width);
                #[allow(clippy::cast_possible_truncation)]
                let sample = image.get_pixel(sx as u32, sy as u32).0[0];
                out.push(f64::from(sample));
            }
        }
        out
    }
}

/// Fold `i` into `0..n` by mirroring about the edges, repeating the edge
/// sample (`-1 → 0`, `n → n − 1`).
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
const fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let m = i.rem_euclid(2 * n);
    (if m < n { m } else { 2 * n - 1 - m }) as usize
}

/// `H`, `Hᵀ` and `M⁻¹` in the frequency domain.
struct Operator {
    fft: Fft2d,
    otf: Vec<Complex64>,
    inverse_preconditioner: Option<Vec<f64>>,
}

impl Operator {
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn new(domain: &Padding, kernel: &Kernel, preconditioner: Preconditioner) -> Self {
        let (pw, ph) = (domain.padded_width, domain.padded_height);
        let mut shifted = vec![0.0; domain.len()];
        for ky in 0..kernel.height {
            let y = (ky as isize - kernel.cy as isize).rem_euclid(ph as isize) as usize;
            for kx in 0..kernel.width {
                let x = (kx as isize - kernel.cx as isize).rem_euclid(pw as isize) as usize;
                shifted[y * pw + x] += kernel.values[ky * kernel.width + kx];
            }
        }

        let fft = Fft2d::new(pw, ph);
        let otf = fft.forward_real(&shifted);

        let inverse_preconditioner = match preconditioner {
            Preconditioner::None => None,
            Preconditioner::Fft { tolerance } => {
                let peak = otf.iter().map(|c| c.norm()).fold(0.0, f64::max);
                let tol = tolerance.unwrap_or(Preconditioner::AUTO_TOLERANCE_FRACTION * peak);
                Some(
                    otf.iter()
                        .map(|c| {
                            let magnitude = c.norm();
                            if magnitude >= tol && magnitude > 0.0 {
                                1.0 / (magnitude * magnitude)
                            } else {
                                1.0
                            }
                        })
                        .collect(),
                )
            }
        };

        Self {
            fft,
            otf,
            inverse_preconditioner,
        }
    }

    fn apply(&self, x: &[f64]) -> Vec<f64> {
        let mut spectrum = self.fft.forward_real(x);
        for (s, h) in spectrum.iter_mut().zip(&self.otf) {
            *s *= h;
        }
        self.fft.inverse_real(spectrum)
    }

    fn apply_transpose(&self, x: &[f64]) -> Vec<f64> {
        let mut spectrum = self.fft.forward_real(x);
        for (s, h) in spectrum.iter_mut().zip(&self.otf) {
            *s *= h.conj();
        }
        self.fft.inverse_real(spectrum)
    }

    fn precondition(&self, g: &[f64]) -> Vec<f64> {
        let Some(inverse) = &self.inverse_preconditioner else {
            return g.to_vec();
        };
        let mut spectrum = self.fft.forward_real(g);
        for (s, m) in spectrum.iter_mut().zip(inverse) {
            *s *= *m;
        }
        self.fft.inverse_real(spectrum)
    }
}

struct Outcome {
    iterations: u32,
    gradient_norm: f64,
    stop_reason: StopReason,
}

/// The MRNSD loop on the padded domain.
fn iterate(op: &Operator, b: &[f64], options: &DeconvolutionOptions) -> (Vec<f64>, Outcome) {
    let mut x: Vec<f64> = b.iter().map(|&v| v.max(0.0)).collect();
    let residual: Vec<f64> = op.apply(&x).iter().zip(b).map(|(hx, bi)| hx - bi).collect();
    let mut g = op.apply_transpose(&residual);

    let tolerance = options
        .stopping_tolerance
        .resolve(norm(&op.apply_transpose(b)));

    let mut iterations = 0;
    let mut gradient_norm = norm(&g);
    let stop_reason = loop {
        if iterations >= options.max_iterations {
            break StopReason::IterationLimit;
        }
        if tolerance.is_some_and(|t| gradient_norm <= t) {
            break StopReason::Converged;
        }

        let d = op.precondition(&g);
        let s: Vec<f64> = x.iter().zip(&d).map(|(xi, di)| xi * di).collect();
        let gamma = dot(&g, &s);
        if gamma <= 0.0 {
            break StopReason::NonDescent;
        }

        let w = op.apply(&s);
        let theta = gamma / dot(&w, &w);
        if !theta.is_finite() {
            break StopReason::Degenerate;
        }
        let alpha = x
            .iter()
            .zip(&s)
            .filter(|&(_, &si)| si > 0.0)
            .map(|(xi, si)| xi / si)
            .fold(theta, f64::min);

        for (xi, si) in x.iter_mut().zip(&s) {
            *xi = (*xi - alpha * si).max(0.0);
        }
        let correction = op.apply_transpose(&w);
        for (gi, ci) in g.iter_mut().zip(&correction) {
            *gi -= alpha * ci;
        }

        iterations += 1;
        gradient_norm = norm(&g);
    };

    (
        x,
        Outcome {
            iterations,
            gradient_norm,
            stop_reason,
        },
    )
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spot(w: u32, h: u32, cx: u32, cy: u32) -> PixelBuffer {
        let mut img = PixelBuffer::new(w, h);
        img.put_pixel(cx, cy, Luma([1.0]));
        crate::blur::gaussian_blur(&img, 1.0)
    }

    fn residual_norm(op: &Operator, x: &[f64], b: &[f64]) -> f64 {
        let hx = op.apply(x);
        norm(&hx.iter().zip(b).map(|(a, c)| a - c).collect::<Vec<_>>())
    }

    #[test]
    fn reflect_repeats_edge_sample() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(3, 5), 3);
        assert_eq!(reflect(-3, 1), 0);
    }

    #[test]
    fn kernel_centres_on_first_maximum() {
        let buffer =
            PixelBuffer::from_fn(4, 3, |x, y| Luma([if y == 1 && x >= 1 { 2.0 } else { 1.0 }]));
        let kernel = Kernel::from_psf(&Psf::new(buffer).unwrap());
        assert_eq!((kernel.cx, kernel.cy), (1, 1));
        assert!((kernel.values.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn padding_covers_kernel_extent() {
        let kernel = Kernel::from_psf(&Psf::gaussian(1.0).unwrap());
        let domain = Padding::new(10, 6, &kernel);
        assert_eq!((domain.pad_x, domain.pad_y), (4, 4));
        assert_eq!((domain.padded_width, domain.padded_height), (18, 14));
    }

    #[test]
    fn identity_psf_returns_input() {
        let psf = Psf::new(PixelBuffer::from_pixel(1, 1, Luma([3.0]))).unwrap();
        let input = PixelBuffer::from_fn(5, 4, |x, y| Luma([(x + y) as f32]));
        let out = mrnsd(&input, &psf, &DeconvolutionOptions::default());
        assert_eq!(out.iterations, 0);
        assert_eq!(out.stop_reason, StopReason::Converged);
        for (a, b) in out.image.pixels().zip(input.pixels()) {
            assert!((a.0[0] - b.0[0]).abs() < 1e-4);
        }
    }

    #[test]
    fn zero_input_stops_immediately() {
        let psf = Psf::gaussian(1.0).unwrap();
        let out = mrnsd(&PixelBuffer::new(6, 6), &psf, &DeconvolutionOptions::default());
        assert_eq!(out.iterations, 0);
        assert!(out.image.pixels().all(|p| p.0[0].abs() < f32::EPSILON));
    }

    #[test]
    fn output_is_nonnegative_and_same_size() {
        let psf = Psf::gaussian(1.0).unwrap();
        let input = PixelBuffer::from_fn(12, 9, |x, y| Luma([((x * 5 + y * 3) % 7) as f32 - 2.0]));
        let out = mrnsd(&input, &psf, &DeconvolutionOptions::default());
        assert_eq!(out.image.dimensions(), (12, 9));
        assert!(out.image.pixels().all(|p| p.0[0] >= 0.0));
        assert!(out.iterations <= 9);
    }

    #[test]
    fn restoration_sharpens_a_blurred_spot() {
        let psf = Psf::gaussian(1.0).unwrap();
        let input = spot(15, 15, 7, 7);
        let options = DeconvolutionOptions {
            stopping_tolerance: StoppingTolerance::Disabled,
            preconditioner: Preconditioner::None,
            ..DeconvolutionOptions::default()
        };
        let out = mrnsd(&input, &psf, &options);
        assert!(out.iterations > 0);
        assert!(out.image.get_pixel(7, 7).0[0] > input.get_pixel(7, 7).0[0]);
    }

    #[test]
    fn residual_does_not_increase() {
        let psf = Psf::gaussian(1.0).unwrap();
        let image = spot(11, 11, 5, 5);
        let kernel = Kernel::from_psf(&psf);
        let domain = Padding::new(11, 11, &kernel);
        for preconditioner in [Preconditioner::None, Preconditioner::default()] {
            let op = Operator::new(&domain, &kernel, preconditioner);
            let b = domain.pad(&image);
            let start: Vec<f64> = b.iter().map(|&v| v.max(0.0)).collect();
            let options = DeconvolutionOptions {
                max_iterations: 5,
                stopping_tolerance: StoppingTolerance::Disabled,
                preconditioner,
                output_threshold: None,
            };
            let (x, _) = iterate(&op, &b, &options);
            assert!(residual_norm(&op, &x, &b) <= residual_norm(&op, &start, &b) + 1e-12);
        }
    }

    #[test]
    fn large_fixed_tolerance_converges_immediately() {
        let psf = Psf::gaussian(1.0).unwrap();
        let options = DeconvolutionOptions {
            stopping_tolerance: StoppingTolerance::Fixed(1e9),
            ..DeconvolutionOptions::default()
        };
        let out = mrnsd(&spot(9, 9, 4, 4), &psf, &options);
        assert_eq!(out.iterations, 0);
        assert_eq!(out.stop_reason, StopReason::Converged);
    }

    #[test]
    fn output_threshold_zeroes_small_values() {
        let psf = Psf::gaussian(1.0).unwrap();
        let options = DeconvolutionOptions {
            output_threshold: Some(0.05),
            ..DeconvolutionOptions::default()
        };
        let out = mrnsd(&spot(13, 13, 6, 6), &psf, &options);
        assert!(out.image.pixels().all(|p| p.0[0] <= 0.0 || p.0[0] >= 0.05));
        assert!(out.image.get_pixel(6, 6).0[0] > 0.0);
    }

    #[test]
    fn option_checks() {
        assert!(StoppingTolerance::Fixed(-1.0).check().is_err());
        assert!(StoppingTolerance::Fixed(f64::NAN).check().is_err());
        assert!(StoppingTolerance::Fixed(0.0).check().is_ok());
        assert!(Preconditioner::Fft { tolerance: Some(0.0) }.check().is_err());
        assert!(Preconditioner::Fft { tolerance: Some(0.2) }.check().is_ok());
        assert!(Preconditioner::None.check().is_ok());
    }
}
