//! Grayscale reduction and frame differencing.

use crate::capture::{Frame, FrameGeometry, PixelFormat};
use crate::error::{AcquisitionFailure, MotionError};

// BT.601 luma weights in 14-bit fixed point
const R_WEIGHT: u32 = 4899;
const G_WEIGHT: u32 = 9617;
const B_WEIGHT: u32 = 1868;
const SHIFT: u32 = 14;
const ROUND: u32 = 1 << (SHIFT - 1);

#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((R_WEIGHT * r as u32 + G_WEIGHT * g as u32 + B_WEIGHT * b as u32 + ROUND) >> SHIFT) as u8
}

/// Single-channel intensity raster, immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    geometry: FrameGeometry,
    data: Vec<u8>,
}

impl GrayFrame {
    /// Build from raw intensities; `None` if the length doesn't match the geometry.
    pub fn from_raw(geometry: FrameGeometry, data: Vec<u8>) -> Option<Self> {
        (data.len() == geometry.area()).then_some(Self { geometry, data })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Per-cell absolute difference of two temporally adjacent gray frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffMap {
    geometry: FrameGeometry,
    cells: Vec<u8>,
}

impl DiffMap {
    pub fn from_cells(geometry: FrameGeometry, cells: Vec<u8>) -> Option<Self> {
        (cells.len() == geometry.area()).then_some(Self { geometry, cells })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }
}

/// Reduce a frame to luma. Same input bytes always give the same output bytes.
pub fn to_gray(frame: &Frame) -> Result<GrayFrame, AcquisitionFailure> {
    let geometry = frame.geometry();
    if geometry.is_empty() {
        return Err(MotionError::InvalidGeometry(geometry).into());
    }

    let format = frame.format();
    let expected = geometry.area() * format.bytes_per_pixel();
    let src = frame
        .data
        .get(..expected)
        .ok_or(AcquisitionFailure::Truncated {
            geometry,
            expected,
            actual: frame.data.len(),
        })?;

    let data = match format {
        PixelFormat::Gray8 => src.to_vec(),
        PixelFormat::Rgb24 => src.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect(),
        PixelFormat::Bgr24 => src.chunks_exact(3).map(|p| luma(p[2], p[1], p[0])).collect(),
        PixelFormat::Rgba32 => src.chunks_exact(4).map(|p| luma(p[0], p[1], p[2])).collect(),
        PixelFormat::Yuyv4 => src.iter().step_by(2).copied().collect(),
    };

    Ok(GrayFrame { geometry, data })
}

/// Diff `current` against the stored previous frame.
///
/// Returns `Ok(None)` on a first tick. A geometry change is reported as
/// `DimensionMismatch`; the caller is expected to drop its previous frame.
pub fn difference(
    current: &GrayFrame,
    previous: Option<&GrayFrame>,
) -> Result<Option<DiffMap>, MotionError> {
    let Some(previous) = previous else {
        return Ok(None);
    };

    if previous.geometry != current.geometry {
        return Err(MotionError::DimensionMismatch {
            previous: previous.geometry,
            current: current.geometry,
        });
    }

    let cells = current
        .data
        .iter()
        .zip(&previous.data)
        .map(|(a, b)| a.abs_diff(*b))
        .collect();

    Ok(Some(DiffMap {
        geometry: current.geometry,
        cells,
    }))
}
