#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigilo::capture::{Frame, FrameGeometry, FrameSource, PixelFormat, SourceHandle};
use vigilo::config::DetectionConfig;
use vigilo::error::{AcquisitionError, AcquisitionFailure};

pub enum Step {
    Frame(Frame),
    Fail(AcquisitionFailure),
    /// Frame that takes this long to arrive
    Slow(Duration, Frame),
}

/// Source whose handles replay a fixed list of steps, then repeat the last frame.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    scripts: Arc<Mutex<HashMap<String, Vec<Step>>>>,
    open_delays: Arc<Mutex<HashMap<String, Duration>>>,
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    pub acquired: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn with_script(self, source_id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(source_id.to_string(), steps);
        self
    }

    /// Make `open(source_id)` take `delay` before it succeeds or fails.
    pub fn with_open_delay(self, source_id: &str, delay: Duration) -> Self {
        self.open_delays
            .lock()
            .unwrap()
            .insert(source_id.to_string(), delay);
        self
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl FrameSource for ScriptedSource {
    type Handle = ScriptedHandle;

    async fn open(&self, source_id: &str) -> Result<Self::Handle, AcquisitionError> {
        let delay = self.open_delays.lock().unwrap().get(source_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .remove(source_id)
            .ok_or_else(|| AcquisitionError::Unavailable {
                source_id: source_id.to_string(),
                reason: "no such device".into(),
            })?;

        let geometry = steps
            .iter()
            .find_map(|s| match s {
                Step::Frame(f) | Step::Slow(_, f) => Some(f.geometry()),
                Step::Fail(_) => None,
            })
            .unwrap_or_default();

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedHandle {
            geometry,
            steps: steps.into(),
            last: None,
            closed: self.closed.clone(),
            acquired: self.acquired.clone(),
        })
    }
}

pub struct ScriptedHandle {
    geometry: FrameGeometry,
    steps: VecDeque<Step>,
    last: Option<Frame>,
    closed: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
}

impl SourceHandle for ScriptedHandle {
    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    async fn acquire_frame(&mut self) -> Result<Frame, AcquisitionFailure> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => {
                self.last = Some(frame.clone());
                Ok(frame)
            }
            Some(Step::Slow(delay, frame)) => {
                tokio::time::sleep(delay).await;
                self.last = Some(frame.clone());
                Ok(frame)
            }
            Some(Step::Fail(e)) => Err(e),
            None => self.last.clone().ok_or(AcquisitionFailure::StreamEnded),
        }
    }

    async fn close(self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Solid RGBA frame.
pub fn solid(width: u32, height: u32, value: u8, sequence: u64) -> Frame {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..width * height {
        data.extend_from_slice(&[value, value, value, 255]);
    }
    Frame::new(data, FrameGeometry::new(width, height), PixelFormat::Rgba32, sequence).unwrap()
}

/// Black RGBA frame with a `size`-square block of `value` in the top-left corner.
pub fn with_block(width: u32, height: u32, size: u32, value: u8, sequence: u64) -> Frame {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = if x < size && y < size { value } else { 0 };
            data.extend_from_slice(&[v, v, v, 255]);
        }
    }
    Frame::new(data, FrameGeometry::new(width, height), PixelFormat::Rgba32, sequence).unwrap()
}

pub fn detection(sample_interval_ms: u64, debounce_interval_ms: u64) -> DetectionConfig {
    DetectionConfig {
        diff_threshold: 30,
        motion_pixel_ratio: 0.02,
        sample_interval_ms,
        debounce_interval_ms,
        ..DetectionConfig::default()
    }
}
