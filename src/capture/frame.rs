use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::AcquisitionFailure;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across tasks without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Monotonic acquisition instant, the session's tick clock
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub geometry: FrameGeometry,
    pub format: PixelFormat,
    /// Wall-clock acquisition time, used for captions only
    pub captured_at: SystemTime,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Raw pixel layouts a frame can carry once it reaches the motion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Gray8,
    /// Packed 4:2:2, two bytes per pixel with luma on even offsets
    Yuyv4,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Gray8 => 1,
            PixelFormat::Yuyv4 => 2,
        }
    }
}

/// Formats negotiated with a capture device, before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Mjpeg,
    Yuyv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixel cells
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Frame {
    /// Wrap a raw payload, checking it covers the declared geometry.
    pub fn new(
        data: impl Into<Bytes>,
        geometry: FrameGeometry,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self, AcquisitionFailure> {
        let data = data.into();
        let expected = geometry.area() * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(AcquisitionFailure::Truncated {
                geometry,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                geometry,
                format,
                captured_at: SystemTime::now(),
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        })
    }

    /// Override the acquisition instant (sources with their own clock, tests).
    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.meta.geometry
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("geometry", &self.meta.geometry)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
