//! Threshold a diff map and decide whether the sample shows motion.
//!
//! Both cutoffs are strict: a cell equal to `diff_threshold` is unchanged, and
//! a ratio equal to `motion_pixel_ratio` is not motion.

use tokio::time::Instant;

use crate::capture::FrameGeometry;
use crate::error::MotionError;
use crate::motion::gray::DiffMap;

pub const MASK_ON: u8 = 255;

/// Result of classifying one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub timestamp: Instant,
    /// Changed cells over total cells, in [0, 1]
    pub changed_pixel_ratio: f64,
    pub is_motion: bool,
}

/// Binary raster: `MASK_ON` where the diff exceeded the cutoff, 0 elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdMask {
    geometry: FrameGeometry,
    cells: Vec<u8>,
}

impl ThresholdMask {
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn count_changed(&self) -> usize {
        self.cells.iter().filter(|&&c| c != 0).count()
    }
}

pub fn threshold(diff: &DiffMap, diff_threshold: u8) -> ThresholdMask {
    ThresholdMask {
        geometry: diff.geometry(),
        cells: diff
            .cells()
            .iter()
            .map(|&d| if d > diff_threshold { MASK_ON } else { 0 })
            .collect(),
    }
}

/// Pure: identical inputs always yield an identical sample.
pub fn classify(
    diff: &DiffMap,
    diff_threshold: u8,
    motion_pixel_ratio: f64,
    timestamp: Instant,
) -> Result<MotionSample, MotionError> {
    let total = diff.geometry().area();
    if total == 0 {
        return Err(MotionError::InvalidGeometry(diff.geometry()));
    }

    let changed = diff.cells().iter().filter(|&&d| d > diff_threshold).count();
    let changed_pixel_ratio = changed as f64 / total as f64;

    Ok(MotionSample {
        timestamp,
        changed_pixel_ratio,
        is_motion: changed_pixel_ratio > motion_pixel_ratio,
    })
}
