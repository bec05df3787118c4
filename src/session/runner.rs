//! The async sampling loop: one task per active source.
//!
//! Ticks never overlap. The next tick is scheduled one interval after the
//! previous one completes, so a slow tick stretches the cadence instead of
//! queueing work behind it.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{Frame, FrameSource, SourceHandle};
use crate::config::ConfigHandle;
use crate::error::AcquisitionError;
use crate::motion::ThresholdMask;
use crate::notify::{MotionEvent, NotificationSink};
use crate::session::{SessionState, SessionStatus, SourceSession, TickOutcome};
use crate::snapshot::{encode_jpeg, DEFAULT_JPEG_QUALITY};

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    pub jpeg_quality: u8,
    /// Stop the session after this many failed ticks in a row; `None` retries forever
    pub max_consecutive_failures: Option<u32>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_consecutive_failures: None,
        }
    }
}

/// Latest tick products, published for pull-style queries.
#[derive(Default)]
struct Latest {
    frame: ArcSwapOption<Frame>,
    mask: ArcSwapOption<ThresholdMask>,
}

/// Owner-side handle of a running session.
///
/// Dropping it also stops the loop, since the loop watches the shutdown sender.
pub struct SessionHandle {
    source_id: Arc<str>,
    status: watch::Receiver<SessionStatus>,
    latest: Arc<Latest>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn source_id(&self) -> &Arc<str> {
        &self.source_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that changes after every tick.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Most recently acquired frame, for on-demand snapshots.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.latest.frame.load_full()
    }

    /// Threshold mask of the latest classified tick, when `keep_mask` is on.
    pub fn latest_mask(&self) -> Option<Arc<ThresholdMask>> {
        self.latest.mask.load_full()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait until the device and buffers are released.
    pub async fn deactivate(self) -> SessionStatus {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Session {} task failed: {}", self.source_id, e);
        }
        let status = self.status.borrow().clone();
        status
    }
}

/// Open `source_id` and spawn its sampling loop.
///
/// An open failure is fatal for the session and returned to the caller.
#[instrument(skip(source, config, sink, options))]
pub async fn start_session<S: FrameSource>(
    source: &S,
    source_id: &str,
    config: ConfigHandle,
    sink: Arc<dyn NotificationSink>,
    options: RunnerOptions,
) -> Result<SessionHandle, AcquisitionError> {
    let mut session = SourceSession::new(source_id, &config.load());

    let handle = match source.open(source_id).await {
        Ok(handle) => handle,
        Err(e) => {
            session.stop();
            error!("Failed to open {}: {}", source_id, e);
            return Err(e);
        }
    };

    session.begin_streaming(handle.geometry());
    info!("Session {} streaming at {}", source_id, handle.geometry());

    let (status_tx, status_rx) = watch::channel(session.status());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let latest = Arc::new(Latest::default());

    let task = tokio::spawn(run_loop(
        session,
        handle,
        config,
        sink,
        options,
        status_tx,
        shutdown_rx,
        latest.clone(),
    ));

    Ok(SessionHandle {
        source_id: source_id.into(),
        status: status_rx,
        latest,
        shutdown: shutdown_tx,
        task,
    })
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(source = %session.source_id()))]
async fn run_loop<H: SourceHandle>(
    mut session: SourceSession,
    mut handle: H,
    config: ConfigHandle,
    sink: Arc<dyn NotificationSink>,
    options: RunnerOptions,
    status: watch::Sender<SessionStatus>,
    mut shutdown: watch::Receiver<bool>,
    latest: Arc<Latest>,
) {
    let label = session.source_id().to_string();

    while !*shutdown.borrow() {
        // One snapshot per tick; updates land on the next tick
        let cfg = config.load();
        let tick_start = Instant::now();

        let acquired = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = handle.acquire_frame() => frame,
        };

        match acquired {
            Ok(frame) => {
                latest.frame.store(Some(Arc::new(frame.clone())));
                let outcome = session.process_frame(&frame, &cfg, tick_start);
                handle_outcome(&mut session, outcome, &frame, &*sink, &options, &latest, &label);
            }
            Err(e) => {
                session.record_failure();
                metrics::counter!("vigilo_acquisition_failures_total", "source" => label.clone())
                    .increment(1);
                warn!("Tick failed to acquire a frame: {}", e);
            }
        }

        let elapsed = tick_start.elapsed();
        let interval = cfg.sample_interval();
        session.record_tick(elapsed, interval);
        metrics::counter!("vigilo_ticks_total", "source" => label.clone()).increment(1);
        metrics::histogram!("vigilo_tick_time_us", "source" => label.clone())
            .record(elapsed.as_micros() as f64);
        if elapsed > interval {
            let missed = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u64;
            metrics::counter!("vigilo_ticks_skipped_total", "source" => label.clone())
                .increment(missed);
            debug!("Tick took {:?}, skipped {} due ticks", elapsed, missed);
        }
        status.send_replace(session.status());

        if let Some(limit) = options.max_consecutive_failures {
            if session.stats().consecutive_failures >= limit {
                error!(
                    "Giving up after {} consecutive failed ticks",
                    session.stats().consecutive_failures
                );
                break;
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = sleep(interval) => {}
        }
    }

    // Release in a fixed order whatever ended the loop
    session.stop();
    latest.frame.store(None);
    latest.mask.store(None);
    handle.close().await;
    status.send_replace(session.status());
    info!("Session stopped after {} ticks", session.stats().ticks);
}

fn handle_outcome(
    session: &mut SourceSession,
    outcome: TickOutcome,
    frame: &Frame,
    sink: &dyn NotificationSink,
    options: &RunnerOptions,
    latest: &Latest,
    label: &str,
) {
    match outcome {
        TickOutcome::Primed => debug!("Reference frame stored"),
        TickOutcome::Sampled {
            sample,
            admitted,
            mask,
        } => {
            if let Some(mask) = mask {
                latest.mask.store(Some(Arc::new(mask)));
            }
            if sample.is_motion {
                metrics::counter!("vigilo_motion_samples_total", "source" => label.to_string())
                    .increment(1);
            }
            if !admitted {
                return;
            }

            let snapshot = match encode_jpeg(frame, options.jpeg_quality) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    session.record_snapshot_failure();
                    warn!("Motion confirmed but snapshot encoding failed: {}", e);
                    return;
                }
            };

            info!(
                ratio = sample.changed_pixel_ratio,
                bytes = snapshot.len(),
                "Motion event"
            );
            metrics::counter!("vigilo_motion_events_total", "source" => label.to_string())
                .increment(1);
            sink.notify(MotionEvent {
                source_id: session.source_id().clone(),
                timestamp: sample.timestamp,
                captured_at: frame.meta.captured_at,
                changed_pixel_ratio: sample.changed_pixel_ratio,
                sequence: frame.meta.sequence,
                snapshot,
            });
            session.record_emitted();
        }
        TickOutcome::Reset(e) => debug!("Reference dropped: {}", e),
        TickOutcome::Failed(e) => {
            metrics::counter!("vigilo_acquisition_failures_total", "source" => label.to_string())
                .increment(1);
            warn!("Frame rejected: {}", e);
        }
        TickOutcome::Inactive => {
            debug_assert_ne!(session.state(), SessionState::Streaming);
        }
    }
}
