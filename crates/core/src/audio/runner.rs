use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::{
    analysis::{analyze_bands, Band},
    envelope::{BandTrigger, DetectionParams, SignalEnvelopePipeline},
    timeline::Clock,
};

use super::{
    lock, read_shared, release_source, LevelsSnapshot, RunToken, SourceSlot, TriggerEmitter,
    DISPLAY_INTERVAL_MS,
};

/// Everything one run of the tick loop needs.
pub(crate) struct RunContext {
    pub token: RunToken,
    pub source: SourceSlot,
    pub snapshot: Arc<Mutex<LevelsSnapshot>>,
    pub emitter: Arc<dyn TriggerEmitter>,
    pub clock: Arc<dyn Clock>,
    /// Read every tick, so changes reach a running pipeline.
    pub params: Arc<Mutex<DetectionParams>>,
    pub frame_interval: Duration,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunEnd {
    /// A newer run or a stop took over.
    Superseded,
    /// The source slot was emptied underneath the task.
    SourceReleased,
    Failed(String),
}

/// Ticks once per frame until the run goes stale. Bands are processed in
/// [`Band::ALL`] order and each emission is awaited before the next band, so
/// a tick completes before the next one is scheduled.
pub(crate) async fn run_pipeline(ctx: RunContext) -> RunEnd {
    let RunContext {
        token,
        source,
        snapshot,
        emitter,
        clock,
        params,
        frame_interval,
    } = ctx;

    let mut applied = read_shared(&params);
    let mut pipeline = SignalEnvelopePipeline::new(applied);
    let mut spectrum = Vec::new();
    let mut last_publish: Option<f64> = None;
    let mut ticker = tokio::time::interval(frame_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(run_id = token.id(), params = ?applied, "pipeline run started");

    loop {
        ticker.tick().await;
        if !token.is_current() {
            return RunEnd::Superseded;
        }
        let latest = read_shared(&params);
        if latest != applied {
            debug!(run_id = token.id(), params = ?latest, "detection parameters changed");
            pipeline.set_params(latest);
            applied = latest;
        }

        let analysis = {
            let mut slot = match lock(&source, "spectrum source") {
                Ok(slot) => slot,
                Err(err) => return RunEnd::Failed(err.to_string()),
            };
            let Some(active) = slot.as_mut() else {
                return RunEnd::SourceReleased;
            };
            if let Err(err) = active.read_spectrum(&mut spectrum) {
                return RunEnd::Failed(err.to_string());
            }
            analyze_bands(&spectrum, active.sample_rate(), active.fft_size())
        };

        for band in Band::ALL {
            if !token.is_current() {
                return RunEnd::Superseded;
            }
            let step = pipeline.process_band(band, analysis.rms.get(band), clock.now_ms());
            if !step.fired {
                continue;
            }

            let trigger = BandTrigger {
                band,
                velocity: step.velocity,
            };
            trace!(run_id = token.id(), %band, velocity = step.velocity, "band onset");
            if let Err(err) = emitter.emit(trigger).await {
                debug!(run_id = token.id(), %band, %err, "emission failed, trigger dropped");
            }
        }

        if !token.is_current() {
            return RunEnd::Superseded;
        }
        let now = clock.now_ms();
        let due = last_publish
            .map(|last| now - last >= DISPLAY_INTERVAL_MS)
            .unwrap_or(true);
        if due {
            last_publish = Some(now);
            if let Ok(mut shown) = snapshot.lock() {
                *shown = LevelsSnapshot {
                    levels: pipeline.levels(),
                    peaks_db: analysis.peaks_db,
                    updated_ms: Some(now),
                };
            }
        }
    }
}

/// Spawns the tick loop. When the run fails while still current, its source
/// is released and `on_failure` receives the token and the message. The
/// token has to be checked again where the failure is published.
pub(crate) fn spawn_run<F>(ctx: RunContext, on_failure: F) -> JoinHandle<()>
where
    F: FnOnce(&RunToken, String) + Send + 'static,
{
    let token = ctx.token.clone();
    let source = ctx.source.clone();
    tokio::spawn(async move {
        let end = run_pipeline(ctx).await;
        debug!(run_id = token.id(), ?end, "pipeline run ended");
        if let RunEnd::Failed(message) = end {
            if token.is_current() {
                warn!(run_id = token.id(), %message, "pipeline run failed");
                release_source(&source);
                on_failure(&token, message);
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use crate::{audio::SpectrumSource, Result, TriggerRigError};

    /// Alternates between a loud and a silent low-band frame.
    pub struct PulseSource {
        pub frames: usize,
        pub loud_every: usize,
        pub closed: Arc<AtomicBool>,
        pub reads: Arc<AtomicUsize>,
        pub fail_after: Option<usize>,
    }

    impl PulseSource {
        pub fn new(loud_every: usize) -> Self {
            Self {
                frames: 0,
                loud_every,
                closed: Arc::new(AtomicBool::new(false)),
                reads: Arc::new(AtomicUsize::new(0)),
                fail_after: None,
            }
        }
    }

    impl SpectrumSource for PulseSource {
        fn sample_rate(&self) -> f64 {
            1000.0
        }

        fn fft_size(&self) -> usize {
            10
        }

        fn read_spectrum(&mut self, out_db: &mut Vec<f32>) -> Result<()> {
            if self.fail_after.map(|n| self.frames >= n).unwrap_or(false) {
                return Err(TriggerRigError::capability("device unplugged"));
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            let loud = self.frames % self.loud_every == 0;
            self.frames += 1;
            out_db.clear();
            // Bin 0 is 0 Hz (low band), the rest stay silent.
            out_db.push(if loud { -6.0 } else { f32::NEG_INFINITY });
            out_db.extend(std::iter::repeat(f32::NEG_INFINITY).take(4));
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
