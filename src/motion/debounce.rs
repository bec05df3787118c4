//! Fixed-window cooldown between notifications.

use std::time::Duration;

use tokio::time::Instant;

/// Admits at most one motion sample per cooldown window.
///
/// The window opens at the admitted sample and is not extended by motion seen
/// while it is open.
#[derive(Debug, Clone)]
pub struct DebounceGate {
    interval: Duration,
    cooldown_until: Option<Instant>,
}

impl DebounceGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cooldown_until: None,
        }
    }

    pub fn admit(&mut self, now: Instant, is_motion: bool) -> bool {
        if !is_motion {
            return false;
        }

        match self.cooldown_until {
            Some(until) if now < until => false,
            _ => {
                self.cooldown_until = Some(now + self.interval);
                true
            }
        }
    }

    /// Applies from the next admitted sample; an open window keeps its end.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn reset(&mut self) {
        self.cooldown_until = None;
    }
}
