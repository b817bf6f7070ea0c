//! Rank filters: median over a square window, max/min over a disk.
//!
//! All windows are clipped at the image border, so edge pixels only see
//! in-bounds samples.
//!
//! The disk follows the common microscopy convention: offset `(dx, dy)` is
//! inside a disk of radius `r` when `dx² + dy² ≤ r² + 1`. Radius 1 is
//! therefore the full 3×3 square and radius 0 the 5-pixel cross.

use image::{GrayImage, Luma};
use imageproc::morphology::{Mask, grayscale_dilate, grayscale_erode};

use crate::types::PixelBuffer;

/// Largest disk radius a [`Mask`] can hold (side `2r + 1 ≤ 511`).
pub const MAX_DISK_RADIUS: u32 = 255;

/// Median over a `(2r+1)²` square window clipped to the image.
///
/// For an even sample count the upper median (`sorted[n / 2]`) is taken.
/// Samples are ordered with [`f32::total_cmp`], so NaN never panics and
/// sorts after every finite value.
///
/// The window slides in a serpentine scan. Each step adds and removes one
/// row or column of samples in a rank counter, so the cost per pixel is
/// `O(r log n)` rather than the `O(r²)` of rebuilding the window.
#[must_use = "returns the filtered image"]
pub fn median_filter_square(image: &PixelBuffer, radius: u32) -> PixelBuffer {
    let (w, h) = image.dimensions();
    let values = image.as_raw();
    if values.is_empty() {
        return PixelBuffer::new(w, h);
    }
    let (width, height, r) = (w as usize, h as usize, radius as usize);

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_unstable_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut rank = vec![0; values.len()];
    for (position, &pixel) in order.iter().enumerate() {
        rank[pixel] = position;
    }

    let span = |c: usize, limit: usize| c.saturating_sub(r)..=(c + r).min(limit - 1);
    let mut window = RankCounter::new(values.len());
    let column = |window: &mut RankCounter, x: usize, y: usize, delta: i32| {
        for yy in span(y, height) {
            window.update(rank[yy * width + x], delta);
        }
    };

    let mut medians = vec![0.0; values.len()];
    let mut x = 0;
    for xx in span(0, width) {
        column(&mut window, xx, 0, 1);
    }
    for y in 0..height {
        if y > 0 {
            for xx in span(x, width) {
                if y > r {
                    window.update(rank[(y - 1 - r) * width + xx], -1);
                }
                if y + r < height {
                    window.update(rank[(y + r) * width + xx], 1);
                }
            }
        }
        let rightward = y % 2 == 0;
        loop {
            medians[y * width + x] = values[order[window.kth(window.len / 2)]];
            if rightward {
                if x + 1 == width {
                    break;
                }
                if x >= r {
                    column(&mut window, x - r, y, -1);
                }
                if x + 1 + r < width {
                    column(&mut window, x + 1 + r, y, 1);
                }
                x += 1;
            } else {
                if x == 0 {
                    break;
                }
                if x + r < width {
                    column(&mut window, x + r, y, -1);
                }
                if x > r {
                    column(&mut window, x - 1 - r, y, 1);
                }
                x -= 1;
            }
        }
    }

    PixelBuffer::from_fn(w, h, |x, y| Luma([medians[y as usize * width + x as usize]]))
}

/// Multiset of ranks in `0..n` backed by a Fenwick tree.
struct RankCounter {
    tree: Vec<u32>,
    len: usize,
}

impl RankCounter {
    fn new(n: usize) -> Self {
        Self {
            tree: vec![0; n + 1],
            len: 0,
        }
    }

    fn update(&mut self, rank: usize, delta: i32) {
        if delta > 0 {
            self.len += 1;
        } else {
            self.len -= 1;
        }
        let mut i = rank + 1;
        while i < self.tree.len() {
            self.tree[i] = self.tree[i].wrapping_add_signed(delta);
            i += i & i.wrapping_neg();
        }
    }

    /// The `k`-th smallest rank present (0-based).
    fn kth(&self, k: usize) -> usize {
        let n = self.tree.len() - 1;
        let mut pos = 0;
        let mut remaining = k;
        let mut step = if n == 0 { 0 } else { 1 << n.ilog2() };
        while step > 0 {
            let next = pos + step;
            if next <= n && (self.tree[next] as usize) <= remaining {
                pos = next;
                remaining -= self.tree[next] as usize;
            }
            step >>= 1;
        }
        pos
    }
}

/// The disk of `radius` as a morphology mask. Radii above
/// [`MAX_DISK_RADIUS`] saturate.
#[must_use]
pub fn disk_mask(radius: u32) -> Mask {
    let r = radius.min(MAX_DISK_RADIUS);
    let r2 = r * r + 1;
    let half = r2.isqrt();
    let side = 2 * half + 1;
    let image = GrayImage::from_fn(side, side, |x, y| {
        let (dx, dy) = (x.abs_diff(half), y.abs_diff(half));
        Luma([if dx * dx + dy * dy <= r2 { 255 } else { 0 }])
    });
    let centre = u8::try_from(half).unwrap_or(u8::MAX);
    Mask::from_image(&image, centre, centre)
}

/// Local maximum over a disk of `radius`.
#[must_use = "returns the filtered image"]
pub fn max_filter_disk(image: &GrayImage, radius: u32) -> GrayImage {
    grayscale_dilate(image, &disk_mask(radius))
}

/// Local minimum over a disk of `radius`.
#[must_use = "returns the filtered image"]
pub fn min_filter_disk(image: &GrayImage, radius: u32) -> GrayImage {
    grayscale_erode(image, &disk_mask(radius))
}
