//! Registry of active sources, one independent sampling loop each.
//!
//! The registry lock only guards map lookups and swaps. Opening a device and
//! stopping a session happen outside it, so a camera that is slow to open or
//! close never stalls queries about the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::capture::FrameSource;
use crate::config::ConfigHandle;
use crate::error::SupervisorError;
use crate::notify::NotificationSink;
use crate::session::{start_session, RunnerOptions, SessionHandle, SessionStatus};
use crate::snapshot::encode_jpeg;

type Registry = HashMap<Arc<str>, Slot>;

enum Slot {
    /// `activate` is opening the device; the value identifies that call
    Opening(u64),
    Running(SessionHandle),
}

/// Removes an `Opening` marker unless the activation completed.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    source_id: Arc<str>,
    ticket: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(registry.get(&self.source_id), Some(Slot::Opening(t)) if *t == self.ticket) {
            registry.remove(&self.source_id);
        }
    }
}

pub struct Supervisor<S: FrameSource> {
    source: S,
    config: ConfigHandle,
    sink: Arc<dyn NotificationSink>,
    options: RunnerOptions,
    sessions: Mutex<Registry>,
    tickets: AtomicU64,
}

impl<S: FrameSource> Supervisor<S> {
    pub fn new(
        source: S,
        config: ConfigHandle,
        sink: Arc<dyn NotificationSink>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            source,
            config,
            sink,
            options,
            sessions: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open `source_id` and start sampling it.
    ///
    /// A session whose loop already ended on its own is replaced. An id that is
    /// still being opened counts as active.
    #[instrument(skip(self))]
    pub async fn activate(&self, source_id: &str) -> Result<SessionStatus, SupervisorError> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let id: Arc<str> = source_id.into();

        let stale = {
            let mut registry = self.registry();
            match registry.get(source_id) {
                Some(Slot::Opening(_)) => {
                    return Err(SupervisorError::AlreadyActive(source_id.to_string()))
                }
                Some(Slot::Running(handle)) if !handle.is_finished() => {
                    return Err(SupervisorError::AlreadyActive(source_id.to_string()))
                }
                _ => {}
            }
            registry.insert(id.clone(), Slot::Opening(ticket))
        };
        let mut reservation = Reservation {
            registry: &self.sessions,
            source_id: id.clone(),
            ticket,
            armed: true,
        };

        if let Some(Slot::Running(stale)) = stale {
            let status = stale.deactivate().await;
            warn!("Replacing ended session {} ({:?})", source_id, status.state);
        }

        let handle = start_session(
            &self.source,
            source_id,
            self.config.clone(),
            self.sink.clone(),
            self.options,
        )
        .await?;
        let status = handle.status();

        let orphan = {
            let mut registry = self.registry();
            if matches!(registry.get(source_id), Some(Slot::Opening(t)) if *t == ticket) {
                registry.insert(id, Slot::Running(handle));
                reservation.armed = false;
                info!("Activated {} ({} registered)", source_id, registry.len());
                None
            } else {
                Some(handle)
            }
        };

        match orphan {
            None => Ok(status),
            // Shut down while the device was opening
            Some(handle) => {
                handle.deactivate().await;
                Err(SupervisorError::Cancelled(source_id.to_string()))
            }
        }
    }

    /// Stop sampling `source_id` and release its device.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, source_id: &str) -> Result<SessionStatus, SupervisorError> {
        let handle = {
            let mut registry = self.registry();
            if !matches!(registry.get(source_id), Some(Slot::Running(_))) {
                return Err(SupervisorError::NotActive(source_id.to_string()));
            }
            match registry.remove(source_id) {
                Some(Slot::Running(handle)) => handle,
                _ => return Err(SupervisorError::NotActive(source_id.to_string())),
            }
        };

        let status = handle.deactivate().await;
        info!("Deactivated {}", source_id);
        Ok(status)
    }

    pub async fn status(&self, source_id: &str) -> Result<SessionStatus, SupervisorError> {
        match self.registry().get(source_id) {
            Some(Slot::Running(handle)) => Ok(handle.status()),
            _ => Err(SupervisorError::NotActive(source_id.to_string())),
        }
    }

    /// Statuses of all running sessions, ordered by source id.
    pub async fn list(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<_> = self
            .registry()
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(handle) => Some(handle.status()),
                Slot::Opening(_) => None,
            })
            .collect();
        statuses.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        statuses
    }

    pub async fn motion_active(&self, source_id: &str) -> Result<bool, SupervisorError> {
        let status = self.status(source_id).await?;
        Ok(status.motion_active(Instant::now(), self.config.load().motion_active()))
    }

    /// Encode the latest frame of `source_id` on demand.
    pub async fn latest_snapshot(&self, source_id: &str) -> Result<Bytes, SupervisorError> {
        let frame = match self.registry().get(source_id) {
            Some(Slot::Running(handle)) => handle.latest_frame(),
            _ => return Err(SupervisorError::NotActive(source_id.to_string())),
        }
        .ok_or_else(|| SupervisorError::NoFrame(source_id.to_string()))?;

        Ok(encode_jpeg(&frame, self.options.jpeg_quality)?)
    }

    /// Stop every session. Activations still opening their device are cancelled.
    pub async fn shutdown(&self) -> Vec<SessionStatus> {
        let drained: Vec<_> = self.registry().drain().map(|(_, slot)| slot).collect();
        let mut statuses = Vec::with_capacity(drained.len());
        for slot in drained {
            if let Slot::Running(handle) = slot {
                statuses.push(handle.deactivate().await);
            }
        }
        info!("All {} sessions stopped", statuses.len());
        statuses
    }
}
