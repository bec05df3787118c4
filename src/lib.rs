//! Vigilo: camera motion watcher.
//!
//! Each active source runs its own sampling loop: acquire a frame, reduce it to
//! gray, diff against the previous sample, threshold, classify by changed-pixel
//! ratio, and pass confirmed motion through a cooldown gate before handing a
//! JPEG snapshot to the notification sink.

pub mod capture;
pub mod config;
pub mod error;
pub mod motion;
pub mod notify;
pub mod session;
pub mod snapshot;
pub mod supervisor;

pub use capture::{Frame, FrameGeometry, PixelFormat};
pub use config::{Config, ConfigHandle, DetectionConfig};
pub use error::{AcquisitionError, AcquisitionFailure, MotionError};
pub use notify::{MotionEvent, NotificationSink};
pub use session::{SessionState, SessionStatus, SourceSession};
pub use supervisor::Supervisor;
