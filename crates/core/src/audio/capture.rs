use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::AudioConfig,
    envelope::DetectionParams,
    timeline::{Clock, PlaybackClock},
    Result, TriggerRigError,
};

use super::{
    read_shared, release_source,
    runner::{self, RunContext},
    set_shared, set_shared_if_current, take_shared, LevelsSnapshot, RunCounter, SourceSlot,
    SpectrumSource, TriggerEmitter,
};

/// Lifecycle of the live capture pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum CaptureStatus {
    Idle,
    Starting,
    Running,
    Error(String),
    /// Hardware is bypassed; nothing is captured or emitted.
    Mock,
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureStatus::Idle => f.write_str("idle"),
            CaptureStatus::Starting => f.write_str("starting"),
            CaptureStatus::Running => f.write_str("running"),
            CaptureStatus::Error(message) => write!(f, "error: {message}"),
            CaptureStatus::Mock => f.write_str("mock"),
        }
    }
}

/// Opens a live input and exposes it as a spectrum source.
pub trait CaptureBackend: Send + Sync {
    fn open<'a>(
        &'a self,
        device_id: Option<&'a str>,
        audio: &'a AudioConfig,
    ) -> BoxFuture<'a, Result<Box<dyn SpectrumSource>>>;
}

/// Backend used when the host has no capture API compiled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBackend;

impl CaptureBackend for UnavailableBackend {
    fn open<'a>(
        &'a self,
        _device_id: Option<&'a str>,
        _audio: &'a AudioConfig,
    ) -> BoxFuture<'a, Result<Box<dyn SpectrumSource>>> {
        Box::pin(async {
            Err(TriggerRigError::capability(
                "audio capture API unavailable",
            ))
        })
    }
}

/// Owns the live input and the tick task driving it.
///
/// All methods take `&self` so enable and disable requests may interleave;
/// the run id decides which one wins.
pub struct CaptureController {
    backend: Arc<dyn CaptureBackend>,
    emitter: Arc<dyn TriggerEmitter>,
    clock: Arc<dyn Clock>,
    audio: AudioConfig,
    params: Arc<Mutex<DetectionParams>>,
    mock: bool,
    runs: RunCounter,
    status: Arc<Mutex<CaptureStatus>>,
    snapshot: Arc<Mutex<LevelsSnapshot>>,
    active: Mutex<Option<SourceSlot>>,
}

impl CaptureController {
    pub fn new(backend: Arc<dyn CaptureBackend>, emitter: Arc<dyn TriggerEmitter>) -> Self {
        Self {
            backend,
            emitter,
            clock: Arc::new(PlaybackClock::start()),
            audio: AudioConfig::default(),
            params: Arc::new(Mutex::new(DetectionParams::default())),
            mock: false,
            runs: RunCounter::default(),
            status: Arc::new(Mutex::new(CaptureStatus::Idle)),
            snapshot: Arc::new(Mutex::new(LevelsSnapshot::default())),
            active: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_detection(self, params: DetectionParams) -> Self {
        self.set_detection(params);
        self
    }

    pub fn with_mock(mut self, mock: bool) -> Self {
        self.mock = mock;
        self
    }

    /// Applies to the running pipeline from its next tick.
    pub fn set_detection(&self, params: DetectionParams) {
        set_shared(&self.params, params);
    }

    pub fn detection(&self) -> DetectionParams {
        read_shared(&self.params)
    }

    pub fn status(&self) -> CaptureStatus {
        read_shared(&self.status)
    }

    pub fn levels(&self) -> LevelsSnapshot {
        read_shared(&self.snapshot)
    }

    pub fn run_id(&self) -> u64 {
        self.runs.current()
    }

    /// Tears down any previous run, then opens `device_id` (or the default
    /// input) and starts ticking. `enabled = false` behaves like `stop`.
    ///
    /// A start that is superseded while the device is opening closes what it
    /// opened and returns `Ok`.
    pub async fn start(&self, enabled: bool, device_id: Option<&str>) -> Result<()> {
        let token = self.runs.advance();
        self.teardown();

        if !enabled {
            set_shared(&self.status, CaptureStatus::Idle);
            return Ok(());
        }
        if self.mock {
            info!(run_id = token.id(), "capture running in mock mode");
            set_shared(&self.status, CaptureStatus::Mock);
            return Ok(());
        }

        set_shared(&self.status, CaptureStatus::Starting);
        let opened = self.backend.open(device_id, &self.audio).await;
        if !token.is_current() {
            if let Ok(mut source) = opened {
                source.close();
            }
            debug!(run_id = token.id(), "superseded while opening the input");
            return Ok(());
        }

        let source = match opened {
            Ok(source) => source,
            Err(err) => {
                warn!(run_id = token.id(), %err, "capture failed to start");
                set_shared(&self.status, CaptureStatus::Error(err.to_string()));
                return Err(err);
            }
        };

        let slot: SourceSlot = Arc::new(Mutex::new(Some(source)));
        set_shared(&self.active, Some(slot.clone()));
        set_shared(&self.status, CaptureStatus::Running);
        info!(run_id = token.id(), device = device_id.unwrap_or("default"), "capture running");

        let status = self.status.clone();
        runner::spawn_run(
            RunContext {
                token,
                source: slot,
                snapshot: self.snapshot.clone(),
                emitter: self.emitter.clone(),
                clock: self.clock.clone(),
                params: self.params.clone(),
                frame_interval: Duration::from_millis(self.audio.frame_interval_ms),
            },
            move |token, message| {
                set_shared_if_current(&status, token, CaptureStatus::Error(message));
            },
        );
        Ok(())
    }

    pub fn stop(&self) {
        let token = self.runs.advance();
        self.teardown();
        set_shared(&self.status, CaptureStatus::Idle);
        debug!(run_id = token.id(), "capture stopped");
    }

    fn teardown(&self) {
        if let Some(slot) = take_shared(&self.active) {
            release_source(&slot);
        }
        set_shared(&self.snapshot, LevelsSnapshot::default());
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.runs.advance();
        self.teardown();
    }
}

impl fmt::Debug for CaptureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureController")
            .field("status", &self.status())
            .field("run_id", &self.run_id())
            .field("mock", &self.mock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{audio::runner::test_support::PulseSource, envelope::BandTrigger};

    #[derive(Default)]
    struct PulseBackend {
        delay: Duration,
        fail_after: Option<usize>,
        opened: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl PulseBackend {
        fn closed(&self) -> Vec<bool> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .map(|flag| flag.load(Ordering::SeqCst))
                .collect()
        }
    }

    impl CaptureBackend for PulseBackend {
        fn open<'a>(
            &'a self,
            _device_id: Option<&'a str>,
            _audio: &'a AudioConfig,
        ) -> BoxFuture<'a, Result<Box<dyn SpectrumSource>>> {
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let mut source = PulseSource::new(2);
                source.fail_after = self.fail_after;
                self.opened.lock().unwrap().push(source.closed.clone());
                Ok(Box::new(source) as Box<dyn SpectrumSource>)
            })
        }
    }

    fn collector() -> (Arc<dyn TriggerEmitter>, Arc<Mutex<Vec<BandTrigger>>>) {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        let emitter = move |trigger: BandTrigger| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(trigger);
                Ok::<(), TriggerRigError>(())
            }
        };
        (Arc::new(emitter), hits)
    }

    fn params() -> DetectionParams {
        DetectionParams {
            min_interval_ms: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_capture_api_is_an_error_status() {
        let (emitter, _) = collector();
        let controller = CaptureController::new(Arc::new(UnavailableBackend), emitter);

        let err = controller.start(true, None).await.unwrap_err();
        assert!(matches!(err, TriggerRigError::Capability(_)));
        assert_eq!(
            controller.status(),
            CaptureStatus::Error("capability unavailable: audio capture API unavailable".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mock_mode_bypasses_the_backend() {
        let (emitter, hits) = collector();
        let controller = CaptureController::new(Arc::new(UnavailableBackend), emitter).with_mock(true);

        controller.start(true, None).await.unwrap();
        assert_eq!(controller.status(), CaptureStatus::Mock);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hits.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_stopped_and_releases_the_input() {
        let backend = Arc::new(PulseBackend::default());
        let (emitter, hits) = collector();
        let controller = CaptureController::new(backend.clone(), emitter).with_detection(params());

        controller.start(true, Some("mic")).await.unwrap();
        assert_eq!(controller.status(), CaptureStatus::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!hits.lock().unwrap().is_empty());
        assert!(controller.levels().updated_ms.is_some());

        controller.stop();
        assert_eq!(controller.status(), CaptureStatus::Idle);
        assert_eq!(backend.closed(), vec![true]);

        let count = hits.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.lock().unwrap().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_tears_down_the_previous_run_first() {
        let backend = Arc::new(PulseBackend::default());
        let (emitter, _) = collector();
        let controller = CaptureController::new(backend.clone(), emitter);

        controller.start(true, None).await.unwrap();
        let first = controller.run_id();
        controller.start(true, None).await.unwrap();
        assert!(controller.run_id() > first);
        assert_eq!(backend.closed(), vec![true, false]);

        controller.start(false, None).await.unwrap();
        assert_eq!(controller.status(), CaptureStatus::Idle);
        assert_eq!(backend.closed(), vec![true, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_opening_discards_the_stale_start() {
        let backend = Arc::new(PulseBackend {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let (emitter, hits) = collector();
        let controller = CaptureController::new(backend.clone(), emitter);

        let (started, ()) = tokio::join!(controller.start(true, None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.stop();
        });
        started.unwrap();

        assert_eq!(controller.status(), CaptureStatus::Idle);
        assert_eq!(backend.closed(), vec![true]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hits.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn source_failure_moves_to_error() {
        let backend = Arc::new(PulseBackend {
            fail_after: Some(2),
            ..Default::default()
        });
        let (emitter, _) = collector();
        let controller = CaptureController::new(backend.clone(), emitter);

        controller.start(true, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(controller.status(), CaptureStatus::Error(ref m) if m.contains("device unplugged")));
        assert_eq!(backend.closed(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_controller_releases_the_input() {
        let backend = Arc::new(PulseBackend::default());
        let (emitter, _) = collector();
        let controller = CaptureController::new(backend.clone(), emitter);
        controller.start(true, None).await.unwrap();

        drop(controller);
        assert_eq!(backend.closed(), vec![true]);
    }
}
