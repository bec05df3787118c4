//! Error taxonomy for the sampling engine.
//!
//! Open-time failures are fatal to a session, everything raised inside a tick
//! is recovered by the session itself and never crosses into another session.

use thiserror::Error;

use crate::capture::FrameGeometry;

/// Failure to open a source. Fatal: the session moves to `Stopped`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("source {source_id} is unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    #[error("permission denied opening source {source_id}")]
    PermissionDenied { source_id: String },

    #[error("source {source_id} reported unusable geometry {geometry}")]
    UnusableGeometry {
        source_id: String,
        geometry: FrameGeometry,
    },
}

/// Transient per-tick failure to pull a frame. The session stays `Streaming`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionFailure {
    #[error("stream ended")]
    StreamEnded,

    #[error("device error: {0}")]
    Device(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("frame payload is {actual} bytes, geometry {geometry} needs {expected}")]
    Truncated {
        geometry: FrameGeometry,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Motion(#[from] MotionError),
}

/// Errors raised by the differencer and classifier.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MotionError {
    #[error("frame geometry changed from {previous} to {current}")]
    DimensionMismatch {
        previous: FrameGeometry,
        current: FrameGeometry,
    },

    #[error("zero-area frame {0}")]
    InvalidGeometry(FrameGeometry),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("jpeg quality {0} outside 1..=100")]
    Quality(u8),

    #[error(transparent)]
    Frame(#[from] AcquisitionFailure),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("source {0} is already active")]
    AlreadyActive(String),

    #[error("source {0} is not active")]
    NotActive(String),

    #[error("source {0} has not produced a frame yet")]
    NoFrame(String),

    #[error("activation of {0} was cancelled by shutdown")]
    Cancelled(String),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
