//! Marker-controlled watershed inside a binary mask.
//!
//! The restored image is inverted so particles become basins. Every
//! regional minimum inside the mask seeds a region, and regions grow by
//! priority flooding (lowest level first, ties in insertion order). A
//! pixel reached by two different regions becomes a dam with label 0,
//! which splits touching particles once the labels are binarized again.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::types::{LabelMap, PixelBuffer};

/// Pixel neighbourhood used for plateaus and flooding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Connectivity {
    /// Edge-adjacent neighbours only.
    #[default]
    Four,
    /// Edge- and corner-adjacent neighbours.
    Eight,
}

impl Connectivity {
    const fn offsets(self) -> &'static [(i64, i64)] {
        match self {
            Self::Four => &[(0, -1), (-1, 0), (1, 0), (0, 1)],
            Self::Eight => &[
                (-1, -1),
                (0, -1),
                (1, -1),
                (-1, 0),
                (1, 0),
                (-1, 1),
                (0, 1),
                (1, 1),
            ],
        }
    }
}

/// Result of [`watershed`].
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Region labels, 0 for background and dams.
    pub labels: LabelMap,
    /// Number of regions (seeded minima).
    pub regions: u32,
    /// Number of dam pixels inside the mask.
    pub dams: u64,
}

/// Mirror intensities about the midpoint of their range: `min + max − v`.
#[must_use = "returns the inverted image"]
pub fn invert(image: &PixelBuffer) -> PixelBuffer {
    let (min, max) = image
        .pixels()
        .map(|p| p.0[0])
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if max < min {
        return image.clone();
    }
    PixelBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([min + max - image.get_pixel(x, y).0[0]])
    })
}

/// Flood `surface` from its regional minima, restricted to `mask != 0`.
#[must_use = "returns the segmentation"]
pub fn watershed(
    surface: &PixelBuffer,
    mask: &GrayImage,
    connectivity: Connectivity,
) -> Segmentation {
    let grid = Grid::new(surface, mask, connectivity);
    let mut labels = vec![0u32; grid.len()];
    let regions = seed_minima(&grid, &mut labels);
    let dams = flood(&grid, &mut labels);

    let (w, h) = surface.dimensions();
    let labels = LabelMap::from_raw(w, h, labels).unwrap_or_else(|| LabelMap::new(w, h));
    Segmentation {
        labels,
        regions,
        dams,
    }
}

/// Every labelled pixel becomes 255; background and dams stay 0.
#[must_use = "returns the binary mask"]
pub fn binarize_labels(labels: &LabelMap) -> GrayImage {
    GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
        Luma([if labels.get_pixel(x, y).0[0] >= 1 { 255 } else { 0 }])
    })
}

/// Flat view of the inputs with neighbour lookup.
struct Grid<'a> {
    width: usize,
    height: usize,
    values: &'a [f32],
    mask: &'a [u8],
    offsets: &'static [(i64, i64)],
}

impl<'a> Grid<'a> {
    fn new(surface: &'a PixelBuffer, mask: &'a GrayImage, connectivity: Connectivity) -> Self {
        Self {
            width: surface.width() as usize,
            height: surface.height() as usize,
            values: surface.as_raw(),
            mask: mask.as_raw(),
            offsets: connectivity.offsets(),
        }
    }

    const fn len(&self) -> usize {
        self.width * self.height
    }

    fn inside(&self, i: usize) -> bool {
        self.mask.get(i).is_some_and(|&m| m != 0)
    }

    /// Masked neighbours of `i`.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn neighbours(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        let x = (i % self.width) as i64;
        let y = (i / self.width) as i64;
        self.offsets.iter().filter_map(move |&(dx, dy)| {
            let (nx, ny) = (x + dx, y + dy);
            if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                return None;
            }
            let j = ny as usize * self.width + nx as usize;
            self.inside(j).then_some(j)
        })
    }
}

/// Label every regional-minimum plateau in raster first-seen order.
///
/// A plateau is a connected set of equal-valued masked pixels; it is a
/// regional minimum when no masked neighbour is strictly lower.
fn seed_minima(grid: &Grid<'_>, labels: &mut [u32]) -> u32 {
    let mut visited = vec![false; grid.len()];
    let mut plateau = Vec::new();
    let mut stack = Vec::new();
    let mut next_label = 0;

    for start in 0..grid.len() {
        if visited[start] || !grid.inside(start) {
            continue;
        }
        let level = grid.values[start];
        plateau.clear();
        stack.push(start);
        visited[start] = true;
        let mut is_minimum = true;

        while let Some(i) = stack.pop() {
            plateau.push(i);
            for j in grid.neighbours(i) {
                match grid.values[j].total_cmp(&level) {
                    Ordering::Less => is_minimum = false,
                    Ordering::Equal if !visited[j] => {
                        visited[j] = true;
                        stack.push(j);
                    }
                    _ => {}
                }
            }
        }

        if is_minimum {
            next_label += 1;
            for &i in &plateau {
                labels[i] = next_label;
            }
        }
    }
    next_label
}

/// Heap entry. Ordered so the lowest level, then the earliest insertion,
/// is popped first from a max-heap.
struct Queued {
    level: f32,
    order: u64,
    index: usize,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .total_cmp(&self.level)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Grow the seeded regions over the rest of the mask. Returns the number
/// of dam pixels.
fn flood(grid: &Grid<'_>, labels: &mut [u32]) -> u64 {
    let mut queued = vec![false; grid.len()];
    let mut heap = BinaryHeap::new();
    let mut order = 0u64;

    let mut enqueue = |heap: &mut BinaryHeap<Queued>,
                       queued: &mut [bool],
                       labels: &[u32],
                       i: usize| {
        for j in grid.neighbours(i) {
            if !queued[j] && labels[j] == 0 {
                queued[j] = true;
                heap.push(Queued {
                    level: grid.values[j],
                    order,
                    index: j,
                });
                order += 1;
            }
        }
    };

    for i in 0..grid.len() {
        if labels[i] != 0 {
            queued[i] = true;
        }
    }
    for i in 0..grid.len() {
        if labels[i] != 0 {
            enqueue(&mut heap, &mut queued, labels, i);
        }
    }

    let mut dams = 0;
    while let Some(Queued { index, .. }) = heap.pop() {
        let mut label = 0;
        let mut conflict = false;
        for j in grid.neighbours(index) {
            let l = labels[j];
            if l == 0 {
                continue;
            }
            if label == 0 {
                label = l;
            } else if l != label {
                conflict = true;
                break;
            }
        }

        if conflict || label == 0 {
            dams += 1;
            continue;
        }
        labels[index] = label;
        enqueue(&mut heap, &mut queued, labels, index);
    }
    dams
}
