#[cfg(feature = "v4l2")]
pub mod decode;
pub mod frame;
pub mod pattern;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{CaptureFormat, Frame, FrameGeometry, FrameMetadata, PixelFormat};
pub use pattern::{TestPattern, TestPatternSource};
pub use source::{FrameSource, SourceHandle};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
