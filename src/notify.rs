//! Notification Sink contract and the in-process sinks the daemon uses.
//!
//! Delivery is fire-and-forget: the sampling loop hands the event over and
//! moves on. Retrying a failed delivery is the sink's business.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A confirmed, debounced motion notification.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    pub source_id: Arc<str>,
    /// Tick clock instant of the sample that was admitted
    pub timestamp: Instant,
    pub captured_at: SystemTime,
    pub changed_pixel_ratio: f64,
    pub sequence: u64,
    /// Encoded JPEG of the frame that triggered the event
    pub snapshot: Bytes,
}

pub trait NotificationSink: Send + Sync + 'static {
    /// Must not block the caller.
    fn notify(&self, event: MotionEvent);
}

impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    fn notify(&self, event: MotionEvent) {
        (**self).notify(event)
    }
}

/// Forwards events into a bounded flume channel, dropping them when it is full.
#[derive(Clone)]
pub struct ChannelSink {
    tx: flume::Sender<MotionEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<MotionEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: MotionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                let source = event.source_id.to_string();
                metrics::counter!("vigilo_events_dropped_total", "source" => source).increment(1);
                warn!("Notification queue full, dropping event from {}", event.source_id);
            }
            Err(flume::TrySendError::Disconnected(event)) => {
                debug!("No notification consumer, dropping event from {}", event.source_id);
            }
        }
    }
}

/// Logs each event with its caption; useful when nothing else is wired up.
#[derive(Debug, Clone)]
pub struct LogSink {
    prefix: String,
}

impl LogSink {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl NotificationSink for LogSink {
    fn notify(&self, event: MotionEvent) {
        info!(
            source = %event.source_id,
            ratio = event.changed_pixel_ratio,
            bytes = event.snapshot.len(),
            "{}",
            caption(&event, &self.prefix)
        );
    }
}

/// "`<prefix> HH:MM:SS`" in UTC, the text that accompanies a snapshot.
pub fn caption(event: &MotionEvent, prefix: &str) -> String {
    let at = OffsetDateTime::from(event.captured_at);
    let clock = at
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| "--:--:--".into());
    format!("{prefix} {clock}")
}
