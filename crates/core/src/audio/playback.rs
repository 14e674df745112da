use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    analysis::SpectrumAnalyser,
    config::AudioConfig,
    envelope::DetectionParams,
    timeline::{Clock, PlaybackClock},
    Result, TriggerRigError,
};

use super::{
    decode_wav, read_shared, release_source,
    runner::{self, RunContext},
    set_shared, set_shared_if_current, take_shared, DecodedAudio, LevelsSnapshot, RunCounter,
    RunToken, SourceSlot, SpectrumSource, TriggerEmitter,
};

/// Lifecycle of the file playback pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PlaybackStatus {
    Idle,
    Loading,
    #[serde(rename_all = "camelCase")]
    Ready { duration_sec: f64 },
    #[serde(rename_all = "camelCase")]
    Playing { duration_sec: f64 },
    Error { message: String },
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackStatus::Idle => f.write_str("idle"),
            PlaybackStatus::Loading => f.write_str("loading"),
            PlaybackStatus::Ready { duration_sec } => write!(f, "ready ({duration_sec:.2}s)"),
            PlaybackStatus::Playing { duration_sec } => write!(f, "playing ({duration_sec:.2}s)"),
            PlaybackStatus::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// Reads raw asset bytes.
pub trait AssetLoader: Send + Sync {
    fn load<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Loads assets from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAssetLoader;

impl AssetLoader for FsAssetLoader {
    fn load<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { Ok(tokio::fs::read(path).await?) })
    }
}

/// Where playback resumes from.
#[derive(Debug, Clone, Copy, Default)]
struct Playhead {
    offset_sec: f64,
    started_ms: Option<f64>,
}

impl Playhead {
    fn position_sec(&self, clock: &dyn Clock, duration_sec: f64) -> f64 {
        let elapsed = self
            .started_ms
            .map(|started| ((clock.now_ms() - started) / 1000.0).max(0.0))
            .unwrap_or(0.0);
        let position = self.offset_sec + elapsed;
        if duration_sec > 0.0 {
            position % duration_sec
        } else {
            0.0
        }
    }
}

/// Reads the looped buffer at the wall-clock playhead.
struct BufferSource {
    audio: Arc<DecodedAudio>,
    analyser: SpectrumAnalyser,
    clock: Arc<dyn Clock>,
    playhead: Playhead,
    window: Vec<f32>,
}

impl SpectrumSource for BufferSource {
    fn sample_rate(&self) -> f64 {
        f64::from(self.audio.sample_rate)
    }

    fn fft_size(&self) -> usize {
        self.analyser.fft_size()
    }

    fn read_spectrum(&mut self, out_db: &mut Vec<f32>) -> Result<()> {
        let len = self.audio.samples.len();
        if len == 0 {
            return Err(TriggerRigError::decode("buffer is empty"));
        }

        let position = self
            .playhead
            .position_sec(self.clock.as_ref(), self.audio.duration_sec());
        let end = (position * self.sample_rate()) as usize % len;
        let size = self.analyser.fft_size();
        let start = (end + len * (size / len + 1) - size) % len;

        self.window.clear();
        self.window
            .extend((0..size).map(|i| self.audio.samples[(start + i) % len]));
        self.analyser.analyse(&self.window, out_db)
    }

    fn close(&mut self) {
        self.window.clear();
        self.analyser.reset();
    }
}

/// Owns a decoded asset and the looped playback run over it.
pub struct PlaybackController {
    loader: Arc<dyn AssetLoader>,
    emitter: Arc<dyn TriggerEmitter>,
    clock: Arc<dyn Clock>,
    audio: AudioConfig,
    params: Arc<Mutex<DetectionParams>>,
    runs: RunCounter,
    status: Arc<Mutex<PlaybackStatus>>,
    snapshot: Arc<Mutex<LevelsSnapshot>>,
    active: Mutex<Option<SourceSlot>>,
    buffer: Mutex<Option<Arc<DecodedAudio>>>,
    playhead: Mutex<Playhead>,
}

impl PlaybackController {
    pub fn new(loader: Arc<dyn AssetLoader>, emitter: Arc<dyn TriggerEmitter>) -> Self {
        Self {
            loader,
            emitter,
            clock: Arc::new(PlaybackClock::start()),
            audio: AudioConfig::default(),
            params: Arc::new(Mutex::new(DetectionParams::default())),
            runs: RunCounter::default(),
            status: Arc::new(Mutex::new(PlaybackStatus::Idle)),
            snapshot: Arc::new(Mutex::new(LevelsSnapshot::default())),
            active: Mutex::new(None),
            buffer: Mutex::new(None),
            playhead: Mutex::new(Playhead::default()),
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

    /// Applies to the running pipeline from its next tick.
    pub fn set_detection(&self, params: DetectionParams) {
        set_shared(&self.params, params);
    }

    pub fn status(&self) -> PlaybackStatus {
        read_shared(&self.status)
    }

    pub fn levels(&self) -> LevelsSnapshot {
        read_shared(&self.snapshot)
    }

    pub fn run_id(&self) -> u64 {
        self.runs.current()
    }

    pub fn duration_sec(&self) -> Option<f64> {
        read_shared(&self.buffer).map(|audio| audio.duration_sec())
    }

    /// Playhead within the looped asset, 0 when nothing is loaded.
    pub fn position_sec(&self) -> f64 {
        let Some(duration) = self.duration_sec() else {
            return 0.0;
        };
        read_shared(&self.playhead).position_sec(self.clock.as_ref(), duration)
    }

    /// Loads and decodes `path`, replacing whatever was loaded before.
    pub async fn load(&self, path: &Path) -> Result<()> {
        self.load_run(path).await.map(|_| ())
    }

    /// `load` followed by `play`. `enabled = false` behaves like `stop`.
    pub async fn start(&self, enabled: bool, path: Option<&Path>) -> Result<()> {
        if !enabled {
            self.stop();
            return Ok(());
        }
        let path = path.ok_or(TriggerRigError::InvalidInput("no asset path given"))?;
        match self.load_run(path).await? {
            Some(token) if token.is_current() => self.play(),
            _ => Ok(()),
        }
    }

    /// Starts or resumes the looped run. A no-op while already playing.
    pub fn play(&self) -> Result<()> {
        let Some(audio) = read_shared(&self.buffer) else {
            return Err(TriggerRigError::InvalidInput("no asset loaded"));
        };
        if matches!(self.status(), PlaybackStatus::Playing { .. }) {
            return Ok(());
        }

        let token = self.runs.advance();
        self.release_run();

        let analyser = match SpectrumAnalyser::new(
            audio.sample_rate,
            self.audio.fft_size,
            self.audio.smoothing_time_constant,
        ) {
            Ok(analyser) => analyser,
            Err(err) => return Err(self.fail(&token, err)),
        };

        let playhead = {
            let mut playhead = self.lock_playhead();
            playhead.started_ms = Some(self.clock.now_ms());
            *playhead
        };
        let source = BufferSource {
            audio: audio.clone(),
            analyser,
            clock: self.clock.clone(),
            playhead,
            window: Vec::new(),
        };

        let source: Box<dyn SpectrumSource> = Box::new(source);
        let slot: SourceSlot = Arc::new(Mutex::new(Some(source)));
        set_shared(&self.active, Some(slot.clone()));
        let duration_sec = audio.duration_sec();
        set_shared(&self.status, PlaybackStatus::Playing { duration_sec });
        info!(run_id = token.id(), duration_sec, offset_sec = playhead.offset_sec, "playback started");

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
                set_shared_if_current(&status, token, PlaybackStatus::Error { message });
            },
        );
        Ok(())
    }

    /// Stops the run but keeps the asset and the playhead: `playing → ready`.
    pub fn pause(&self) {
        let PlaybackStatus::Playing { duration_sec } = self.status() else {
            return;
        };
        let token = self.runs.advance();
        self.release_run();
        {
            let mut playhead = self.lock_playhead();
            playhead.offset_sec = playhead.position_sec(self.clock.as_ref(), duration_sec);
            playhead.started_ms = None;
        }
        set_shared(&self.status, PlaybackStatus::Ready { duration_sec });
        debug!(run_id = token.id(), "playback paused");
    }

    /// Stops the run and drops the asset.
    pub fn stop(&self) {
        let token = self.runs.advance();
        self.teardown();
        set_shared(&self.status, PlaybackStatus::Idle);
        debug!(run_id = token.id(), "playback stopped");
    }

    async fn load_run(&self, path: &Path) -> Result<Option<RunToken>> {
        let token = self.runs.advance();
        self.teardown();
        set_shared(&self.status, PlaybackStatus::Loading);

        let bytes = self.loader.load(path).await;
        if !token.is_current() {
            debug!(run_id = token.id(), path = %path.display(), "superseded while loading");
            return Ok(None);
        }

        let audio = match bytes.and_then(|bytes| decode_wav(&bytes)) {
            Ok(audio) => Arc::new(audio),
            Err(err) => return Err(self.fail(&token, err)),
        };

        let duration_sec = audio.duration_sec();
        set_shared(&self.buffer, Some(audio));
        set_shared(&self.playhead, Playhead::default());
        set_shared(&self.status, PlaybackStatus::Ready { duration_sec });
        info!(run_id = token.id(), path = %path.display(), duration_sec, "asset loaded");
        Ok(Some(token))
    }

    fn fail(&self, token: &RunToken, err: TriggerRigError) -> TriggerRigError {
        warn!(run_id = token.id(), %err, "playback failed");
        set_shared_if_current(
            &self.status,
            token,
            PlaybackStatus::Error {
                message: err.to_string(),
            },
        );
        err
    }

    fn lock_playhead(&self) -> std::sync::MutexGuard<'_, Playhead> {
        match self.playhead.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release_run(&self) {
        if let Some(slot) = take_shared(&self.active) {
            release_source(&slot);
        }
    }

    fn teardown(&self) {
        self.release_run();
        set_shared(&self.buffer, None);
        set_shared(&self.playhead, Playhead::default());
        set_shared(&self.snapshot, LevelsSnapshot::default());
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.runs.advance();
        self.release_run();
    }
}

impl fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackController")
            .field("status", &self.status())
            .field("run_id", &self.run_id())
            .finish_non_exhaustive()
    }
}
