//! Per-source session state and the synchronous body of one sampling tick.
//!
//! `SourceSession` owns the single previous gray frame of its source. Each tick
//! compares against it and swaps in the new one; nothing else ever sees it.

pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::capture::{Frame, FrameGeometry};
use crate::config::DetectionConfig;
use crate::error::{AcquisitionFailure, MotionError};
use crate::motion::{classify, difference, threshold, to_gray, DebounceGate, GrayFrame};
use crate::motion::{MotionSample, ThresholdMask};

pub use runner::{start_session, RunnerOptions, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, source not opened yet
    Idle,
    Streaming,
    /// Terminal; buffers and device released
    Stopped,
}

/// Counters kept alongside the metrics facade, readable per session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    /// Ticks that ran longer than the sample interval
    pub overruns: u64,
    pub worst_tick: Duration,
    pub acquisition_failures: u64,
    pub consecutive_failures: u32,
    pub dimension_resets: u64,
    pub motion_samples: u64,
    /// Events handed to the sink
    pub events_emitted: u64,
    pub events_suppressed: u64,
    /// Admitted samples dropped because their snapshot could not be encoded
    pub snapshot_failures: u64,
}

/// What one tick produced.
#[derive(Debug)]
pub enum TickOutcome {
    /// No reference frame yet; this frame became the reference
    Primed,
    Sampled {
        sample: MotionSample,
        /// The debounce gate let this sample through
        admitted: bool,
        mask: Option<ThresholdMask>,
    },
    /// Geometry changed; the session starts over from a first tick
    Reset(MotionError),
    Failed(AcquisitionFailure),
    /// The session isn't streaming
    Inactive,
}

/// Point-in-time view of a session for status queries.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub source_id: Arc<str>,
    pub state: SessionState,
    pub geometry: Option<FrameGeometry>,
    pub last_sample: Option<MotionSample>,
    pub last_motion: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    pub stats: SessionStats,
}

impl SessionStatus {
    /// True while the last motion sample is younger than `window`.
    pub fn motion_active(&self, now: Instant, window: Duration) -> bool {
        self.last_motion
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}

pub struct SourceSession {
    source_id: Arc<str>,
    state: SessionState,
    geometry: Option<FrameGeometry>,
    previous: Option<GrayFrame>,
    gate: DebounceGate,
    last_sample: Option<MotionSample>,
    last_motion: Option<Instant>,
    stats: SessionStats,
}

impl SourceSession {
    pub fn new(source_id: impl Into<Arc<str>>, config: &DetectionConfig) -> Self {
        Self {
            source_id: source_id.into(),
            state: SessionState::Idle,
            geometry: None,
            previous: None,
            gate: DebounceGate::new(config.debounce_interval()),
            last_sample: None,
            last_motion: None,
            stats: SessionStats::default(),
        }
    }

    pub fn source_id(&self) -> &Arc<str> {
        &self.source_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn has_reference(&self) -> bool {
        self.previous.is_some()
    }

    /// Idle -> Streaming once the source is open and its geometry known.
    pub fn begin_streaming(&mut self, geometry: FrameGeometry) {
        if self.state == SessionState::Idle {
            self.geometry = Some(geometry);
            self.state = SessionState::Streaming;
        }
    }

    /// Run differencer, classifier and gate over one acquired frame.
    ///
    /// `now` is the tick clock; it stamps the sample and drives the gate.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        config: &DetectionConfig,
        now: Instant,
    ) -> TickOutcome {
        if self.state != SessionState::Streaming {
            return TickOutcome::Inactive;
        }
        self.gate.set_interval(config.debounce_interval());

        let gray = match to_gray(frame) {
            Ok(gray) => gray,
            Err(e) => {
                self.record_failure();
                return TickOutcome::Failed(e);
            }
        };

        let diff = match difference(&gray, self.previous.as_ref()) {
            Ok(diff) => diff,
            Err(e) => {
                warn!(source = %self.source_id, "{}, restarting from a first tick", e);
                self.previous = None;
                self.geometry = Some(gray.geometry());
                self.stats.dimension_resets += 1;
                self.stats.consecutive_failures = 0;
                return TickOutcome::Reset(e);
            }
        };

        // Swap the reference; the old generation is dropped here
        self.previous = Some(gray);
        self.stats.consecutive_failures = 0;

        let Some(diff) = diff else {
            return TickOutcome::Primed;
        };

        let sample = match classify(&diff, config.diff_threshold, config.motion_pixel_ratio, now) {
            Ok(sample) => sample,
            Err(e) => {
                let failure = AcquisitionFailure::from(e);
                self.record_failure();
                return TickOutcome::Failed(failure);
            }
        };
        let mask = config
            .keep_mask
            .then(|| threshold(&diff, config.diff_threshold));

        self.last_sample = Some(sample);
        let admitted = self.gate.admit(now, sample.is_motion);
        if sample.is_motion {
            debug!(
                source = %self.source_id,
                ratio = sample.changed_pixel_ratio,
                admitted,
                "Motion sample"
            );
            self.last_motion = Some(now);
            self.stats.motion_samples += 1;
            if !admitted {
                self.stats.events_suppressed += 1;
            }
        }

        TickOutcome::Sampled {
            sample,
            admitted,
            mask,
        }
    }

    /// Note a failed tick; the stored reference frame is left untouched.
    pub fn record_failure(&mut self) {
        self.stats.acquisition_failures += 1;
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
    }

    /// An admitted sample reached the sink.
    pub fn record_emitted(&mut self) {
        self.stats.events_emitted += 1;
    }

    /// An admitted sample was dropped before reaching the sink.
    pub fn record_snapshot_failure(&mut self) {
        self.stats.snapshot_failures += 1;
    }

    pub fn record_tick(&mut self, elapsed: Duration, interval: Duration) {
        self.stats.ticks += 1;
        if elapsed > interval {
            self.stats.overruns += 1;
        }
        if elapsed > self.stats.worst_tick {
            self.stats.worst_tick = elapsed;
        }
    }

    /// Enter the terminal state, releasing the reference frame.
    pub fn stop(&mut self) {
        self.previous = None;
        self.gate.reset();
        self.state = SessionState::Stopped;
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            source_id: self.source_id.clone(),
            state: self.state,
            geometry: self.geometry,
            last_sample: self.last_sample,
            last_motion: self.last_motion,
            cooldown_until: self.gate.cooldown_until(),
            stats: self.stats.clone(),
        }
    }
}
