use jpeg_decoder::Decoder;

use super::frame::{CaptureFormat, FrameGeometry, PixelFormat};
use crate::error::AcquisitionFailure;

/// A device buffer turned into a raw payload the motion engine understands.
#[derive(Debug)]
pub struct Decoded {
    pub pixels: Vec<u8>,
    pub format: PixelFormat,
    /// Size of this frame. For MJPEG it comes from the image header and may
    /// differ from what was negotiated if the device switched resolution.
    pub geometry: FrameGeometry,
}

pub fn decode_frame(
    data: &[u8],
    format: CaptureFormat,
    negotiated: FrameGeometry,
) -> Result<Decoded, AcquisitionFailure> {
    match format {
        CaptureFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| AcquisitionFailure::Decode(e.to_string()))?;
            let info = decoder
                .info()
                .ok_or_else(|| AcquisitionFailure::Decode("missing jpeg header".into()))?;
            let format = match info.pixel_format {
                jpeg_decoder::PixelFormat::L8 => PixelFormat::Gray8,
                jpeg_decoder::PixelFormat::RGB24 => PixelFormat::Rgb24,
                other => {
                    return Err(AcquisitionFailure::Decode(format!(
                        "unsupported jpeg layout {other:?}"
                    )))
                }
            };
            Ok(Decoded {
                pixels,
                format,
                geometry: FrameGeometry::new(u32::from(info.width), u32::from(info.height)),
            })
        }
        // Luma is read straight from the packed samples; the buffer carries no size
        CaptureFormat::Yuyv => Ok(Decoded {
            pixels: data.to_vec(),
            format: PixelFormat::Yuyv4,
            geometry: negotiated,
        }),
    }
}
