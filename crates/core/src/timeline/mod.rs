use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

/// Millisecond time source shared by the controllers and the router.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since an arbitrary, fixed origin. Never decreases.
    fn now_ms(&self) -> f64;
}

/// Monotonic clock anchored at the moment it was started.
///
/// Built on [`tokio::time::Instant`] so paused runtimes in tests advance it
/// together with timers.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    origin: Instant,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::start()
    }
}

impl Clock for PlaybackClock {
    fn now_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hand-driven clock for deterministic tests and offline replays.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, millis: f64) {
        if let Ok(mut slot) = self.millis.lock() {
            *slot = millis;
        }
    }

    pub fn advance(&self, delta_ms: f64) {
        if let Ok(mut slot) = self.millis.lock() {
            *slot = (*slot + delta_ms.max(0.0)).max(0.0);
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.millis.lock().map(|slot| *slot).unwrap_or(0.0)
    }
}
