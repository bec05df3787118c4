//! Still-image export for motion events and on-demand status queries.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tracing::instrument;

use crate::capture::{Frame, PixelFormat};
use crate::error::{AcquisitionFailure, SnapshotError};
use crate::motion::ThresholdMask;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Encode a frame as baseline JPEG.
#[instrument(skip(frame), fields(sequence = frame.meta.sequence))]
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes, SnapshotError> {
    if !(1..=100).contains(&quality) {
        return Err(SnapshotError::Quality(quality));
    }

    let geometry = frame.geometry();
    let expected = geometry.area() * frame.format().bytes_per_pixel();
    let src = frame
        .data
        .get(..expected)
        .ok_or(AcquisitionFailure::Truncated {
            geometry,
            expected,
            actual: frame.data.len(),
        })?;

    let (pixels, color) = match frame.format() {
        PixelFormat::Gray8 => (src.to_vec(), ExtendedColorType::L8),
        PixelFormat::Rgb24 => (src.to_vec(), ExtendedColorType::Rgb8),
        PixelFormat::Bgr24 => (
            src.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect(),
            ExtendedColorType::Rgb8,
        ),
        // JPEG has no alpha channel
        PixelFormat::Rgba32 => (
            src.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect(),
            ExtendedColorType::Rgb8,
        ),
        PixelFormat::Yuyv4 => (yuyv_to_rgb(src), ExtendedColorType::Rgb8),
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        &pixels,
        geometry.width,
        geometry.height,
        color,
    )?;
    Ok(Bytes::from(out))
}

/// Encode a threshold mask as an 8-bit grayscale PNG (motion overlay).
pub fn encode_mask_png(mask: &ThresholdMask) -> Result<Bytes, SnapshotError> {
    let geometry = mask.geometry();
    let mut out = Vec::new();
    PngEncoder::new(&mut out).write_image(
        mask.cells(),
        geometry.width,
        geometry.height,
        ExtendedColorType::L8,
    )?;
    Ok(Bytes::from(out))
}

fn yuyv_to_rgb(src: &[u8]) -> Vec<u8> {
    let pixels = src.len() / 2;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for i in 0..pixels {
        let pair = (i / 2) * 4;
        let y = src[i * 2] as i32;
        let u = src.get(pair + 1).copied().unwrap_or(128) as i32 - 128;
        let v = src.get(pair + 3).copied().unwrap_or(128) as i32 - 128;

        // BT.601 full-range, 8-bit fixed point
        let r = y + ((359 * v) >> 8);
        let g = y - ((88 * u + 183 * v) >> 8);
        let b = y + ((454 * u) >> 8);
        rgb.extend_from_slice(&[clamp(r), clamp(g), clamp(b)]);
    }
    rgb
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
