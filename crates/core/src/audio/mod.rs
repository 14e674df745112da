//! Audio graph lifecycle for the live and file pipelines.
//!
//! Both controllers own a [`SpectrumSource`] and drive the same envelope
//! pipeline over it from a single tick task (see `runner`). A run id guards
//! every asynchronous continuation: `start`, `stop` and friends advance the
//! id, and a task that observes a newer id exits without touching anything.

mod capture;
mod decode;
#[cfg(feature = "cpal")]
mod device;
mod playback;
mod runner;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use futures::future::BoxFuture;
use serde::Serialize;

use crate::{
    analysis::{BandLevels, BandPeaksDb, PerBand},
    envelope::BandTrigger,
    Result, TriggerRigError,
};

pub use capture::{CaptureBackend, CaptureController, CaptureStatus, UnavailableBackend};
pub use decode::{decode_wav, DecodedAudio};
#[cfg(feature = "cpal")]
pub use device::CpalBackend;
pub use playback::{AssetLoader, FsAssetLoader, PlaybackController, PlaybackStatus};

/// How often the display snapshot is refreshed.
pub const DISPLAY_INTERVAL_MS: f64 = 100.0;

/// A per-frame spectrum provider: a live input device or a decoded buffer.
pub trait SpectrumSource: Send {
    fn sample_rate(&self) -> f64;

    fn fft_size(&self) -> usize;

    /// Writes the current per-bin magnitudes in dB into `out_db`.
    fn read_spectrum(&mut self, out_db: &mut Vec<f32>) -> Result<()>;

    /// Releases the device or buffer. Called exactly once before the source
    /// is dropped.
    fn close(&mut self);
}

/// Downstream sink for band onsets.
pub trait TriggerEmitter: Send + Sync {
    fn emit(&self, trigger: BandTrigger) -> BoxFuture<'_, Result<()>>;
}

impl<F, Fut> TriggerEmitter for F
where
    F: Fn(BandTrigger) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn emit(&self, trigger: BandTrigger) -> BoxFuture<'_, Result<()>> {
        Box::pin(self(trigger))
    }
}

/// Levels shown on screen, refreshed independently of the tick rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelsSnapshot {
    pub levels: BandLevels,
    pub peaks_db: BandPeaksDb,
    pub updated_ms: Option<f64>,
}

impl Default for LevelsSnapshot {
    fn default() -> Self {
        Self {
            levels: PerBand::splat(0.0),
            peaks_db: PerBand::splat(f64::NEG_INFINITY),
            updated_ms: None,
        }
    }
}

/// Issues strictly increasing run ids.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunCounter {
    current: Arc<AtomicU64>,
}

impl RunCounter {
    /// Starts a new run, invalidating every token issued before.
    pub(crate) fn advance(&self) -> RunToken {
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        RunToken {
            current: self.current.clone(),
            id,
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Identity of one run, checked after every suspension point.
#[derive(Debug, Clone)]
pub(crate) struct RunToken {
    current: Arc<AtomicU64>,
    id: u64,
}

impl RunToken {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.id
    }
}

/// The source slot shared between a controller and its tick task.
pub(crate) type SourceSlot = Arc<Mutex<Option<Box<dyn SpectrumSource>>>>;

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| TriggerRigError::msg(format!("{what} has been poisoned")))
}

/// Closes and drops whatever source currently sits in `slot`.
pub(crate) fn release_source(slot: &SourceSlot) {
    if let Some(mut source) = take_shared(slot) {
        source.close();
    }
}

pub(crate) fn set_shared<T>(mutex: &Mutex<T>, value: T) {
    match mutex.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

/// Writes `value` only while `token` is current. The check runs under the
/// lock, so a newer run that writes after advancing always wins.
pub(crate) fn set_shared_if_current<T>(mutex: &Mutex<T>, token: &RunToken, value: T) -> bool {
    let mut guard = match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !token.is_current() {
        return false;
    }
    *guard = value;
    true
}

pub(crate) fn take_shared<T>(mutex: &Mutex<Option<T>>) -> Option<T> {
    match mutex.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

pub(crate) fn read_shared<T: Clone>(mutex: &Mutex<T>) -> T {
    match mutex.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_tokens_go_stale_on_advance() {
        let runs = RunCounter::default();
        let first = runs.advance();
        assert!(first.is_current());
        let second = runs.advance();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert!(second.id() > first.id());
        assert_eq!(runs.current(), second.id());
    }

    #[test]
    fn stale_runs_cannot_overwrite_shared_state() {
        let runs = RunCounter::default();
        let status = Mutex::new("idle");
        let old = runs.advance();
        assert!(set_shared_if_current(&status, &old, "error"));

        let newer = runs.advance();
        set_shared(&status, "running");
        assert!(!set_shared_if_current(&status, &old, "error"));
        assert_eq!(read_shared(&status), "running");
        assert!(set_shared_if_current(&status, &newer, "error"));
    }
}
