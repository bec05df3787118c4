//! V4L2 device source.
//!
//! The device and its mmap stream live on a dedicated capture thread; the
//! async handle asks it for one frame per tick over a flume channel.

use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decode::{decode_frame, Decoded};
use crate::capture::source::{FrameSource, SourceHandle};
use crate::capture::{CaptureFormat, Frame, FrameGeometry};
use crate::error::{AcquisitionError, AcquisitionFailure};

/// How long `close` waits for the capture thread before leaving it behind.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn fourcc(format: CaptureFormat) -> FourCC {
    match format {
        CaptureFormat::Mjpeg => FourCC::new(b"MJPG"),
        CaptureFormat::Yuyv => FourCC::new(b"YUYV"),
    }
}

#[derive(Debug, Clone)]
pub struct V4l2Source {
    pub width: u32,
    pub height: u32,
    pub format: CaptureFormat,
    pub buffer_count: u32,
    /// Longest wait for one buffer before the tick counts as failed
    pub frame_timeout: Duration,
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: CaptureFormat::Mjpeg,
            buffer_count: 4,
            frame_timeout: Duration::from_secs(2),
        }
    }
}

type FrameReply = flume::Sender<Result<Frame, AcquisitionFailure>>;

impl FrameSource for V4l2Source {
    type Handle = V4l2Handle;

    async fn open(&self, source_id: &str) -> Result<Self::Handle, AcquisitionError> {
        info!("Opening V4L2 device {}", source_id);

        let (ready_tx, ready_rx) = flume::bounded(1);
        let (request_tx, request_rx) = flume::bounded::<FrameReply>(1);
        let settings = self.clone();
        let path = source_id.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("capture:{source_id}"))
            .spawn(move || capture_thread(path, settings, ready_tx, request_rx))
            .map_err(|e| AcquisitionError::Unavailable {
                source_id: source_id.to_string(),
                reason: e.to_string(),
            })?;

        let geometry = match ready_rx.recv_async().await {
            Ok(Ok(geometry)) => geometry,
            Ok(Err(e)) => return Err(open_error(source_id, e)),
            Err(_) => {
                return Err(AcquisitionError::Unavailable {
                    source_id: source_id.to_string(),
                    reason: "capture thread exited during open".into(),
                })
            }
        };

        if geometry.is_empty() {
            return Err(AcquisitionError::UnusableGeometry {
                source_id: source_id.to_string(),
                geometry,
            });
        }

        Ok(V4l2Handle {
            geometry,
            requests: request_tx,
            thread: Some(thread),
        })
    }
}

fn open_error(source_id: &str, e: io::Error) -> AcquisitionError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => AcquisitionError::PermissionDenied {
            source_id: source_id.to_string(),
        },
        _ => AcquisitionError::Unavailable {
            source_id: source_id.to_string(),
            reason: e.to_string(),
        },
    }
}

fn capture_thread(
    path: String,
    settings: V4l2Source,
    ready: flume::Sender<io::Result<FrameGeometry>>,
    requests: flume::Receiver<FrameReply>,
) {
    let opened = Device::with_path(&path).and_then(|device| {
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device doesn't support video capture",
            ));
        }

        let mut fmt = device.format()?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = fourcc(settings.format);
        // The driver may adjust the request; trust what it reports back
        let actual = device.set_format(&fmt)?;
        let geometry = FrameGeometry::new(actual.width, actual.height);

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, settings.buffer_count)?;
        stream.set_timeout(settings.frame_timeout);
        Ok((device, stream, geometry))
    });

    let (_device, mut stream, geometry) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(geometry)).is_err() {
        return;
    }
    info!(
        "Capture stream started on {} with {} buffers",
        path, settings.buffer_count
    );

    let mut sequence = 0u64;
    // Ends when the handle drops its request sender
    while let Ok(reply) = requests.recv() {
        let result = stream
            .next()
            .map_err(dequeue_failure)
            .and_then(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                let Decoded {
                    pixels,
                    format,
                    geometry,
                } = decode_frame(&buf[..used], settings.format, geometry)?;
                sequence += 1;
                let mut frame = Frame::new(pixels, geometry, format, sequence)?;
                if let Some(meta_mut) = std::sync::Arc::get_mut(&mut frame.meta) {
                    meta_mut.device_timestamp = Some(
                        Duration::from_secs(meta.timestamp.sec as u64)
                            + Duration::from_micros(meta.timestamp.usec as u64),
                    );
                }
                Ok(frame)
            });

        if reply.send(result).is_err() {
            debug!("Frame requester for {} went away", path);
        }
    }

    info!("Capture stream on {} stopped", path);
}

fn dequeue_failure(e: io::Error) -> AcquisitionFailure {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            AcquisitionFailure::Device("timed out waiting for a frame".into())
        }
        _ => AcquisitionFailure::Device(e.to_string()),
    }
}

/// Join the capture thread, giving up after `limit`. Returns whether it exited.
async fn join_capture_thread(thread: JoinHandle<()>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(move || thread.join())).await {
        Ok(Ok(Ok(()))) => true,
        Ok(_) => {
            warn!("Capture thread panicked");
            false
        }
        Err(_) => {
            warn!("Capture thread still blocked after {:?}, leaving it behind", limit);
            false
        }
    }
}

pub struct V4l2Handle {
    geometry: FrameGeometry,
    requests: flume::Sender<FrameReply>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle for V4l2Handle {
    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    async fn acquire_frame(&mut self) -> Result<Frame, AcquisitionFailure> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.requests
            .send_async(reply_tx)
            .await
            .map_err(|_| AcquisitionFailure::StreamEnded)?;
        reply_rx
            .recv_async()
            .await
            .map_err(|_| AcquisitionFailure::StreamEnded)?
    }

    async fn close(self) {
        let V4l2Handle {
            requests, thread, ..
        } = self;
        drop(requests);
        if let Some(thread) = thread {
            if join_capture_thread(thread, JOIN_TIMEOUT).await {
                debug!("Capture thread joined");
            }
        }
    }
}
