//! Connected-component extraction and shape filtering.
//!
//! Components are 8-connected and reported in raster order of their first
//! pixel. Each component's outer boundary is traced along pixel edges to
//! measure its perimeter, from which the circularity `4π·area/perimeter²`
//! follows. Diagonal steps are approximated by discounting every counted
//! corner by `2 − √2`.

use image::Luma;
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::types::{GrayImage, LabelMap, ParticleCandidate, ParticleList, PipelineError};

/// Size and shape bounds for accepted blobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobFilter {
    /// Smallest accepted area in pixels (inclusive).
    pub min_area: u32,
    /// Largest accepted area in pixels (inclusive).
    pub max_area: u32,
    /// Smallest accepted circularity (inclusive).
    pub min_circularity: f64,
    /// Largest accepted circularity (inclusive).
    pub max_circularity: f64,
    /// Drop blobs whose bounding box touches the image border.
    pub exclude_edge_particles: bool,
}

impl Default for BlobFilter {
    fn default() -> Self {
        Self {
            min_area: 0,
            max_area: 400,
            min_circularity: 0.40,
            max_circularity: 1.0,
            exclude_edge_particles: true,
        }
    }
}

impl BlobFilter {
    pub(crate) fn check(self) -> Result<(), PipelineError> {
        if self.min_area > self.max_area {
            return Err(PipelineError::InvalidConfig(format!(
                "blob area bounds are inverted: {} > {}",
                self.min_area, self.max_area,
            )));
        }
        let in_unit = |c: f64| (0.0..=1.0).contains(&c);
        if !(in_unit(self.min_circularity)
            && in_unit(self.max_circularity)
            && self.min_circularity <= self.max_circularity)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "circularity bounds must satisfy 0 <= min <= max <= 1, got {}..{}",
                self.min_circularity, self.max_circularity,
            )));
        }
        Ok(())
    }

    /// Whether `blob` passes every bound.
    #[must_use]
    pub fn accepts(&self, blob: &Blob) -> bool {
        (self.min_area..=self.max_area).contains(&blob.area)
            && blob.circularity >= self.min_circularity
            && blob.circularity <= self.max_circularity
            && !(self.exclude_edge_particles && blob.touches_edge)
    }
}

/// Measurements of one connected component.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// Bounding-box left edge.
    pub x: u32,
    /// Bounding-box top edge.
    pub y: u32,
    /// Bounding-box width.
    pub width: u32,
    /// Bounding-box height.
    pub height: u32,
    /// Pixel count.
    pub area: u32,
    /// Traced outer perimeter with corner correction.
    pub perimeter: f64,
    /// `4π·area/perimeter²`, clamped to 1.
    pub circularity: f64,
    /// Whether the bounding box touches the image border.
    pub touches_edge: bool,
}

impl Blob {
    /// The particle reported for this blob.
    #[must_use]
    pub fn candidate(&self) -> ParticleCandidate {
        ParticleCandidate {
            x: f64::from(self.x),
            y: f64::from(self.y),
            width: self.width,
            height: self.height,
            area: self.area,
            circularity: self.circularity,
        }
    }
}

/// Output of [`detect_blobs`].
#[derive(Debug, Clone)]
pub struct BlobDetection {
    /// Accepted blobs as particles, in component order.
    pub candidates: ParticleList,
    /// Number of components before filtering.
    pub components: usize,
}

/// Measure every component of `mask` and keep those `filter` accepts.
#[must_use = "returns the detected blobs"]
pub fn detect_blobs(mask: &GrayImage, filter: &BlobFilter) -> BlobDetection {
    let blobs = find_blobs(mask);
    let candidates = blobs
        .iter()
        .filter(|blob| filter.accepts(blob))
        .map(Blob::candidate)
        .collect();
    BlobDetection {
        candidates,
        components: blobs.len(),
    }
}

/// Every 8-connected foreground component, ordered by first pixel.
#[must_use = "returns the measured blobs"]
pub fn find_blobs(mask: &GrayImage) -> Vec<Blob> {
    struct Accumulator {
        label: u32,
        first: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
        area: u32,
    }

    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let (w, h) = labels.dimensions();

    let mut slots: Vec<Option<usize>> = Vec::new();
    let mut components: Vec<Accumulator> = Vec::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0];
        if label == 0 {
            continue;
        }
        let slot = label as usize;
        if slots.len() <= slot {
            slots.resize(slot + 1, None);
        }
        let index = *slots[slot].get_or_insert_with(|| {
            components.push(Accumulator {
                label,
                first: (x, y),
                min: (x, y),
                max: (x, y),
                area: 0,
            });
            components.len() - 1
        });
        let c = &mut components[index];
        c.min = (c.min.0.min(x), c.min.1.min(y));
        c.max = (c.max.0.max(x), c.max.1.max(y));
        c.area += 1;
    }

    components
        .into_iter()
        .map(|c| {
            let perimeter = traced_perimeter(&labels, c.label, c.first);
            let width = c.max.0 - c.min.0 + 1;
            let height = c.max.1 - c.min.1 + 1;
            Blob {
                x: c.min.0,
                y: c.min.1,
                width,
                height,
                area: c.area,
                perimeter,
                circularity: circularity(c.area, perimeter),
                touches_edge: c.min.0 == 0 || c.min.1 == 0 || c.max.0 + 1 == w || c.max.1 + 1 == h,
            }
        })
        .collect()
}

/// `4π·area/perimeter²`, clamped to 1; 0 for a zero perimeter.
#[must_use]
pub fn circularity(area: u32, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 0.0;
    }
    (4.0 * std::f64::consts::PI * f64::from(area) / (perimeter * perimeter)).min(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heading {
    East,
    South,
    West,
    North,
}

impl Heading {
    const fn left(self) -> Self {
        match self {
            Self::East => Self::North,
            Self::South => Self::East,
            Self::West => Self::South,
            Self::North => Self::West,
        }
    }

    const fn right(self) -> Self {
        match self {
            Self::East => Self::South,
            Self::South => Self::West,
            Self::West => Self::North,
            Self::North => Self::East,
        }
    }

    const fn step(self) -> (i64, i64) {
        match self {
            Self::East => (1, 0),
            Self::South => (0, 1),
            Self::West => (-1, 0),
            Self::North => (0, -1),
        }
    }

    /// Pixels ahead-left and ahead-right of corner `(vx, vy)`.
    const fn ahead(self, vx: i64, vy: i64) -> ((i64, i64), (i64, i64)) {
        match self {
            Self::East => ((vx, vy - 1), (vx, vy)),
            Self::South => ((vx, vy), (vx - 1, vy)),
            Self::West => ((vx - 1, vy), (vx - 1, vy - 1)),
            Self::North => ((vx - 1, vy - 1), (vx, vy - 1)),
        }
    }
}

/// Walk the outer boundary of component `label` along pixel edges, object
/// on the right, and return its corner-corrected length.
///
/// `first` must be the component's first pixel in raster order, so its
/// top-left corner is on the outer boundary.
fn traced_perimeter(labels: &LabelMap, label: u32, first: (u32, u32)) -> f64 {
    let (w, h) = labels.dimensions();
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let is_object = |(px, py): (i64, i64)| {
        px >= 0
            && py >= 0
            && px < i64::from(w)
            && py < i64::from(h)
            && labels.get_pixel(px as u32, py as u32).0[0] == label
    };

    let start = (i64::from(first.0), i64::from(first.1));
    let (mut vx, mut vy) = start;
    let mut heading = Heading::East;
    let mut runs: Vec<u32> = Vec::new();
    let mut run_heading = heading;
    let mut run = 0;

    let limit = 4 * (u64::from(w) + 1) * (u64::from(h) + 1);
    for _ in 0..limit {
        let (dx, dy) = heading.step();
        vx += dx;
        vy += dy;
        if heading == run_heading {
            run += 1;
        } else {
            runs.push(run);
            run_heading = heading;
            run = 1;
        }

        let (left, right) = heading.ahead(vx, vy);
        heading = if is_object(left) {
            heading.left()
        } else if is_object(right) {
            heading
        } else {
            heading.right()
        };

        if (vx, vy) == start && heading == Heading::East {
            break;
        }
    }
    runs.push(run);

    corner_corrected_length(&runs)
}

/// Total length minus `2 − √2` per counted corner.
///
/// `runs` are the straight side lengths of a closed polygon, starting with
/// the side that leaves the first vertex. A vertex counts as a corner when
/// its incoming side is longer than one pixel or the previous vertex was
/// not counted.
fn corner_corrected_length(runs: &[u32]) -> f64 {
    let total: u64 = runs.iter().map(|&r| u64::from(r)).sum();
    let mut corners = 0u32;
    let mut previous_counted = false;
    for i in 0..runs.len() {
        let incoming = runs[(i + runs.len() - 1) % runs.len()];
        previous_counted = if incoming > 1 || !previous_counted {
            corners += 1;
            true
        } else {
            false
        };
    }
    #[allow(clippy::cast_precision_loss)]
    let total = total as f64;
    f64::from(corners).mul_add(-(2.0 - std::f64::consts::SQRT_2), total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> GrayImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        GrayImage::from_fn(w, h, |x, y| {
            Luma([if rows[y as usize].as_bytes()[x as usize] == b'#' { 255 } else { 0 }])
        })
    }

    #[test]
    fn single_pixel_perimeter() {
        let blobs = find_blobs(&mask_from(&["...", ".#.", "..."]));
        assert_eq!(blobs.len(), 1);
        let b = &blobs[0];
        assert_eq!((b.x, b.y, b.width, b.height, b.area), (1, 1, 1, 1, 1));
        assert!((b.perimeter - (4.0 - 2.0 * (2.0 - std::f64::consts::SQRT_2))).abs() < 1e-9);
        assert!((b.circularity - 1.0).abs() < 1e-12);
        assert!(!b.touches_edge);
    }

    #[test]
    fn square_counts_four_corners() {
        let blobs = find_blobs(&mask_from(&[".....", ".###.", ".###.", ".###.", "....."]));
        let expected = 12.0 - 4.0 * (2.0 - std::f64::consts::SQRT_2);
        assert!((blobs[0].perimeter - expected).abs() < 1e-9);
        assert_eq!(blobs[0].area, 9);
    }

    #[test]
    fn thin_line_is_not_circular() {
        let blobs = find_blobs(&mask_from(&["............", ".##########.", "............"]));
        let b = &blobs[0];
        let expected = 22.0 - 3.0 * (2.0 - std::f64::consts::SQRT_2);
        assert!((b.perimeter - expected).abs() < 1e-9);
        assert!(b.circularity < 0.40);
        assert!(!BlobFilter::default().accepts(b));
    }

    #[test]
    fn diagonal_pixels_form_one_component() {
        let blobs = find_blobs(&mask_from(&[".....", ".#...", "..#..", "...#.", "....."]));
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 3);
        assert_eq!((blobs[0].width, blobs[0].height), (3, 3));
        assert!(blobs[0].perimeter > 0.0);
    }

    #[test]
    fn components_ordered_by_first_pixel() {
        let blobs = find_blobs(&mask_from(&[
            "........", ".....##.", ".##..##.", ".##.....", "........",
        ]));
        assert_eq!(blobs.len(), 2);
        assert_eq!((blobs[0].x, blobs[0].y), (5, 1));
        assert_eq!((blobs[1].x, blobs[1].y), (1, 2));
    }

    #[test]
    fn ring_perimeter_is_outer_boundary() {
        let blobs = find_blobs(&mask_from(&[
            ".......", ".#####.", ".#...#.", ".#...#.", ".#...#.", ".#####.", ".......",
        ]));
        let expected = 20.0 - 4.0 * (2.0 - std::f64::consts::SQRT_2);
        assert!((blobs[0].perimeter - expected).abs() < 1e-9);
        assert_eq!(blobs[0].area, 16);
    }

    #[test]
    fn edge_blobs_are_flagged_and_excluded() {
        let mask = mask_from(&["##...", "##...", ".....", "...#.", "....."]);
        let detection = detect_blobs(&mask, &BlobFilter::default());
        assert_eq!(detection.components, 2);
        assert_eq!(detection.candidates.len(), 1);
        assert!((detection.candidates[0].x - 3.0).abs() < f64::EPSILON);

        let keep = BlobFilter {
            exclude_edge_particles: false,
            ..BlobFilter::default()
        };
        assert_eq!(detect_blobs(&mask, &keep).candidates.len(), 2);
    }

    #[test]
    fn area_bounds_are_inclusive() {
        let mask = mask_from(&[".....", ".##..", ".##..", "....."]);
        let filter = BlobFilter {
            min_area: 4,
            max_area: 4,
            ..BlobFilter::default()
        };
        assert_eq!(detect_blobs(&mask, &filter).candidates.len(), 1);
        let filter = BlobFilter {
            max_area: 3,
            ..BlobFilter::default()
        };
        assert!(detect_blobs(&mask, &filter).candidates.is_empty());
    }

    #[test]
    fn empty_mask_has_no_blobs() {
        let detection = detect_blobs(&GrayImage::new(6, 6), &BlobFilter::default());
        assert_eq!(detection.components, 0);
        assert!(detection.candidates.is_empty());
    }

    #[test]
    fn filter_check_rejects_inverted_bounds() {
        let bad_area = BlobFilter {
            min_area: 10,
            max_area: 5,
            ..BlobFilter::default()
        };
        assert!(bad_area.check().is_err());
        let bad_circ = BlobFilter {
            min_circularity: 0.9,
            max_circularity: 0.5,
            ..BlobFilter::default()
        };
        assert!(bad_circ.check().is_err());
        assert!(BlobFilter::default().check().is_ok());
    }

    #[test]
    fn zero_perimeter_has_zero_circularity() {
        assert!(circularity(5, 0.0).abs() < f64::EPSILON);
    }
}
