//! Frame Source contract: open a device by id, pull frames, close it.

use std::future::Future;

use crate::capture::{Frame, FrameGeometry};
use crate::error::{AcquisitionError, AcquisitionFailure};

/// Factory for per-session handles.
pub trait FrameSource: Send + Sync + 'static {
    type Handle: SourceHandle;

    /// Open the device behind `source_id`. Geometry must be known once this returns.
    fn open(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Self::Handle, AcquisitionError>> + Send;
}

/// An opened device, exclusively owned by one session.
pub trait SourceHandle: Send + 'static {
    fn geometry(&self) -> FrameGeometry;

    /// Pull the next frame. Failures are transient; the session retries next tick.
    fn acquire_frame(&mut self) -> impl Future<Output = Result<Frame, AcquisitionFailure>> + Send;

    /// Release the device. Called exactly once when the session stops.
    fn close(self) -> impl Future<Output = ()> + Send;
}
