use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use trigger_rig_core::{
    audio::{CaptureBackend, FsAssetLoader},
    config::JsonFileSettings,
    routing::EVENT_QUEUE_CAPACITY,
    AppConfig, CaptureController, ConfigResolver, DetectionParams, EventForwarder, EventRouter,
    InputEvent, InputSourceType, PerformanceSet, PipelineKind, PlaybackClock, PlaybackController,
};

fn main() -> trigger_rig_core::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Live {
                common,
                device,
                mock,
            } => run_live(common, device, mock).await,
            Commands::Play {
                common,
                file,
                seconds,
            } => run_play(common, file, seconds).await,
            Commands::Route { common, events } => run_route(common, events).await,
        }
    })
}

/// Configuration, set and router shared by every subcommand.
struct Session {
    config: AppConfig,
    resolver: ConfigResolver,
    router: EventRouter,
}

impl Session {
    fn open(common: &CommonArgs) -> trigger_rig_core::Result<Self> {
        let config = AppConfig::load_or_default(common.config.as_deref())?;
        let set = match &common.set {
            Some(path) => PerformanceSet::load(path)?,
            None => PerformanceSet::default(),
        };
        let resolver = match &common.settings {
            Some(path) => ConfigResolver::new(Arc::new(JsonFileSettings::load(path)?)),
            None => ConfigResolver::default(),
        };

        let mut router = EventRouter::new(set, &config, Arc::new(PlaybackClock::start()));
        let initial = common
            .track
            .clone()
            .or_else(|| router.set().tracks.first().map(|track| track.id.clone()));
        if let Some(track_id) = initial {
            router.activate_track(&track_id)?;
            tracing::info!(track = %track_id, "active track");
        }

        Ok(Self {
            config,
            resolver,
            router,
        })
    }

    /// Detection parameters for the active track.
    fn detection(&self, kind: PipelineKind) -> DetectionParams {
        self.resolver
            .track_detection(kind, self.router.active_track(), &self.config.detection)
    }

    /// Routes `event` and returns whether it switched tracks.
    fn route(&mut self, event: &InputEvent) -> bool {
        let report = self.router.route(event);
        tracing::info!(%report, "routed");
        report.selected_track().is_some()
    }
}

async fn run_live(common: CommonArgs, device: Option<String>, mock: bool) -> trigger_rig_core::Result<()> {
    let mut session = Session::open(&common)?;
    let params = session.detection(PipelineKind::Live);
    tracing::info!(
        ?params,
        device = device.as_deref().unwrap_or("default"),
        mock,
        "starting live capture"
    );

    let (forwarder, mut rx) = EventForwarder::channel(InputSourceType::Audio, EVENT_QUEUE_CAPACITY);
    let controller = CaptureController::new(
        capture_backend(),
        Arc::new(forwarder),
    )
    .with_audio(session.config.audio.clone())
    .with_detection(params)
    .with_mock(mock);

    if let Err(err) = controller.start(true, device.as_deref()).await {
        tracing::error!(%err, "live capture unavailable");
        return Err(err);
    }

    let mut status = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if session.route(&event) {
                    controller.set_detection(session.detection(PipelineKind::Live));
                }
            }
            _ = status.tick() => {
                let levels = controller.levels();
                tracing::info!(status = %controller.status(), levels = ?levels.levels, "capture");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.stop();
    Ok(())
}

async fn run_play(common: CommonArgs, file: PathBuf, seconds: u64) -> trigger_rig_core::Result<()> {
    let mut session = Session::open(&common)?;
    let params = session.detection(PipelineKind::File);

    let (forwarder, mut rx) = EventForwarder::channel(InputSourceType::File, EVENT_QUEUE_CAPACITY);
    let controller = PlaybackController::new(
        Arc::new(FsAssetLoader),
        Arc::new(forwarder),
    )
    .with_audio(session.config.audio.clone())
    .with_detection(params);

    controller.start(true, Some(&file)).await?;
    tracing::info!(file = %file.display(), status = %controller.status(), seconds, "playing");

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut routed = 0_usize;
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if session.route(&event) {
                    controller.set_detection(session.detection(PipelineKind::File));
                }
                routed += 1;
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!(routed, position_sec = controller.position_sec(), "playback finished");
    controller.stop();
    Ok(())
}

async fn run_route(common: CommonArgs, events: Option<PathBuf>) -> trigger_rig_core::Result<()> {
    let mut session = Session::open(&common)?;
    match events {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            route_lines(&mut session, BufReader::new(file)).await
        }
        None => route_lines(&mut session, BufReader::new(tokio::io::stdin())).await,
    }
}

/// Routes newline-delimited JSON events and prints one report per event.
async fn route_lines<R>(session: &mut Session, reader: R) -> trigger_rig_core::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0_usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: InputEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(line = line_no, %err, "skipping malformed event");
                continue;
            }
        };
        let report = session.router.route(&event);
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

#[cfg(feature = "cpal")]
fn capture_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(trigger_rig_core::audio::CpalBackend)
}

#[cfg(not(feature = "cpal"))]
fn capture_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(trigger_rig_core::audio::UnavailableBackend)
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio and controller driven trigger router", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Application configuration (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Performance set to route against (JSON).
    #[arg(short, long)]
    set: Option<PathBuf>,
    /// Persisted detection settings (JSON object of `audio.*`/`file.*` keys).
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Track to activate on startup; defaults to the first track of the set.
    #[arg(short, long)]
    track: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture from an input device and route band onsets.
    Live {
        #[command(flatten)]
        common: CommonArgs,
        /// Input device name; the default input when omitted.
        #[arg(short, long)]
        device: Option<String>,
        /// Bypass the audio hardware.
        #[arg(long)]
        mock: bool,
    },
    /// Loop a WAV file through the playback pipeline.
    Play {
        #[command(flatten)]
        common: CommonArgs,
        /// WAV file to play.
        file: PathBuf,
        /// How long to play before exiting.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Route newline-delimited JSON events from a file or stdin.
    Route {
        #[command(flatten)]
        common: CommonArgs,
        /// Event file; stdin when omitted.
        events: Option<PathBuf>,
    },
}
