//! Post-filtering of detected particles.
//!
//! The last stage runs every candidate through a [`ParticleFilter`]. The
//! configured [`ParticleFilterKind`] covers the serializable strategies;
//! any closure over `&ParticleCandidate` works as an ad-hoc filter.

use serde::{Deserialize, Serialize};

use crate::types::{ParticleCandidate, ParticleList};

/// A keep/drop decision per candidate.
pub trait ParticleFilter {
    /// Whether `candidate` is kept.
    fn retain(&self, candidate: &ParticleCandidate) -> bool;

    /// Keep the accepted candidates, preserving their order.
    #[must_use = "returns the filtered list"]
    fn apply(&self, mut particles: ParticleList) -> ParticleList {
        particles.retain(|c| self.retain(c));
        particles
    }
}

impl<F> ParticleFilter for F
where
    F: Fn(&ParticleCandidate) -> bool,
{
    fn retain(&self, candidate: &ParticleCandidate) -> bool {
        self(candidate)
    }
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Region {
    /// Whether pixel `(px, py)` lies inside the rectangle.
    #[must_use]
    pub fn contains(&self, px: i64, py: i64) -> bool {
        let (x, y) = (i64::from(self.x), i64::from(self.y));
        px >= x && py >= y && px < x + i64::from(self.width) && py < y + i64::from(self.height)
    }
}

/// Available post-filter strategies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParticleFilterKind {
    /// Keep every candidate.
    #[default]
    PassThrough,
    /// Drop candidates whose (rounded) position falls in any region.
    ExcludeRegions(Vec<Region>),
}

impl ParticleFilter for ParticleFilterKind {
    #[allow(clippy::cast_possible_truncation)]
    fn retain(&self, candidate: &ParticleCandidate) -> bool {
        match self {
            Self::PassThrough => true,
            Self::ExcludeRegions(regions) => {
                let (px, py) = (candidate.x.round() as i64, candidate.y.round() as i64);
                !regions.iter().any(|r| r.contains(px, py))
            }
        }
    }
}
