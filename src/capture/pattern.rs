//! Synthetic source: a bright block sliding across a flat field.
//!
//! Handy for running the daemon without a camera attached.

use tracing::debug;

use crate::capture::source::{FrameSource, SourceHandle};
use crate::capture::{Frame, FrameGeometry, PixelFormat};
use crate::error::{AcquisitionError, AcquisitionFailure};

pub const PATTERN_SCHEME: &str = "pattern://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPattern {
    pub geometry: FrameGeometry,
    /// Edge length of the moving square
    pub block: u32,
    pub background: u8,
    pub foreground: u8,
    /// Horizontal displacement per frame; zero keeps the scene static
    pub step: u32,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self {
            geometry: FrameGeometry::new(320, 240),
            block: 48,
            background: 16,
            foreground: 220,
            step: 8,
        }
    }
}

impl TestPattern {
    /// Render frame `n` as RGBA.
    pub fn render(&self, n: u64) -> Vec<u8> {
        let FrameGeometry { width, height } = self.geometry;
        let block = self.block.min(width).min(height);
        let travel = u64::from(width - block) + 1;
        let x0 = ((n * u64::from(self.step)) % travel) as u32;
        let y0 = (height - block) / 2;

        let mut data = Vec::with_capacity(self.geometry.area() * 4);
        for y in 0..height {
            for x in 0..width {
                let inside = (x0..x0 + block).contains(&x) && (y0..y0 + block).contains(&y);
                let v = if inside { self.foreground } else { self.background };
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        data
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestPatternSource {
    pattern: TestPattern,
}

impl TestPatternSource {
    pub fn new(pattern: TestPattern) -> Self {
        Self { pattern }
    }
}

impl FrameSource for TestPatternSource {
    type Handle = TestPatternHandle;

    async fn open(&self, source_id: &str) -> Result<Self::Handle, AcquisitionError> {
        if !source_id.starts_with(PATTERN_SCHEME) {
            return Err(AcquisitionError::Unavailable {
                source_id: source_id.to_string(),
                reason: format!("expected a {PATTERN_SCHEME} id"),
            });
        }
        if self.pattern.geometry.is_empty() {
            return Err(AcquisitionError::UnusableGeometry {
                source_id: source_id.to_string(),
                geometry: self.pattern.geometry,
            });
        }

        debug!("Opened test pattern {} at {}", source_id, self.pattern.geometry);
        Ok(TestPatternHandle {
            pattern: self.pattern,
            sequence: 0,
        })
    }
}

pub struct TestPatternHandle {
    pattern: TestPattern,
    sequence: u64,
}

impl SourceHandle for TestPatternHandle {
    fn geometry(&self) -> FrameGeometry {
        self.pattern.geometry
    }

    async fn acquire_frame(&mut self) -> Result<Frame, AcquisitionFailure> {
        let data = self.pattern.render(self.sequence);
        self.sequence += 1;
        Frame::new(data, self.pattern.geometry, PixelFormat::Rgba32, self.sequence)
    }

    async fn close(self) {
        debug!("Closed test pattern after {} frames", self.sequence);
    }
}
