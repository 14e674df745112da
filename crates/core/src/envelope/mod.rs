//! Adaptive envelope normalisation and onset gating.
//!
//! Every band runs the same two stages per frame. The [`AdaptiveNormalizer`]
//! divides the raw RMS by a decaying peak estimate so quiet and loud material
//! land in the same `[0, 1]` velocity range. The [`OnsetGate`] is a two-state
//! hysteresis machine that emits once on a rising edge and refuses to emit
//! again until the velocity has genuinely decayed.

use serde::{Deserialize, Serialize};

use crate::analysis::{Band, BandAnalysis, BandLevels, PerBand};

pub const SHORT_PEAK_DECAY: f64 = 0.995;
pub const LONG_PEAK_DECAY: f64 = 0.99995;
/// Share of the long peak that acts as a noise floor for the denominator.
pub const LONG_PEAK_FLOOR_RATIO: f64 = 0.5;
/// Absolute floor of the denominator, -50 dBFS.
pub const ABS_FLOOR_DB: f64 = -50.0;
const MIN_DENOMINATOR: f64 = 1e-12;

pub const RELEASE_RATIO: f64 = 0.67;
pub const REARM_ON_DROP_RATIO: f64 = 0.85;

pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MIN_INTERVAL_MS: f64 = 120.0;

/// Reference gain per band. User gains are applied as a plain ratio against
/// these values, so a user gain equal to the default leaves velocity untouched.
pub fn default_gain(band: Band) -> f64 {
    match band {
        Band::Low => 6.0,
        Band::Medium => 14.0,
        Band::High => 18.0,
    }
}

pub fn default_gains() -> PerBand<f64> {
    PerBand {
        low: default_gain(Band::Low),
        medium: default_gain(Band::Medium),
        high: default_gain(Band::High),
    }
}

fn abs_floor() -> f64 {
    10.0_f64.powf(ABS_FLOOR_DB / 20.0)
}

/// Per-band envelope and gate state. Owned by a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeState {
    pub raw_rms_lin: f64,
    pub short_peak: f64,
    pub long_peak: f64,
    pub armed: bool,
    pub peak_while_disarmed: f64,
    pub last_emit_ms: Option<f64>,
}

impl Default for EnvelopeState {
    fn default() -> Self {
        Self {
            raw_rms_lin: 0.0,
            short_peak: 0.0,
            long_peak: 0.0,
            armed: true,
            peak_while_disarmed: 0.0,
            last_emit_ms: None,
        }
    }
}

/// Turns raw band RMS into a bounded velocity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveNormalizer {
    user_gains: PerBand<f64>,
}

impl Default for AdaptiveNormalizer {
    fn default() -> Self {
        Self::new(default_gains())
    }
}

impl AdaptiveNormalizer {
    pub fn new(user_gains: PerBand<f64>) -> Self {
        Self { user_gains }
    }

    pub fn user_gain(&self, band: Band) -> f64 {
        self.user_gains.get(band)
    }

    /// Updates the peak trackers in `state` and returns the velocity in `[0, 1]`.
    pub fn process(&self, band: Band, state: &mut EnvelopeState, raw_rms: f64) -> f64 {
        let raw_rms = if raw_rms.is_finite() { raw_rms.max(0.0) } else { 0.0 };
        state.raw_rms_lin = raw_rms;
        state.short_peak = raw_rms.max(state.short_peak * SHORT_PEAK_DECAY);
        state.long_peak = raw_rms.max(state.long_peak * LONG_PEAK_DECAY);

        let denom = state
            .short_peak
            .max(state.long_peak * LONG_PEAK_FLOOR_RATIO)
            .max(abs_floor());
        let normalized = if denom > MIN_DENOMINATOR {
            raw_rms / denom
        } else {
            0.0
        };

        let ratio = self.user_gain(band) / default_gain(band);
        clamp01(normalized * ratio)
    }
}

/// Hysteresis gate with a per-band rate limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetGate {
    threshold: f64,
    min_interval_ms: f64,
}

impl Default for OnsetGate {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_MIN_INTERVAL_MS)
    }
}

impl OnsetGate {
    pub fn new(threshold: f64, min_interval_ms: f64) -> Self {
        Self {
            threshold,
            min_interval_ms,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn min_interval_ms(&self) -> f64 {
        self.min_interval_ms
    }

    /// Advances the gate and returns `true` when this frame is an onset.
    pub fn process(&self, state: &mut EnvelopeState, velocity: f64, now_ms: f64) -> bool {
        if state.armed {
            let cooled_down = state
                .last_emit_ms
                .map(|last| now_ms - last >= self.min_interval_ms)
                .unwrap_or(true);
            if velocity >= self.threshold && cooled_down {
                state.armed = false;
                state.peak_while_disarmed = velocity;
                state.last_emit_ms = Some(now_ms);
                return true;
            }
            return false;
        }

        state.peak_while_disarmed = state.peak_while_disarmed.max(velocity);
        if velocity < self.threshold * RELEASE_RATIO
            || velocity < state.peak_while_disarmed * REARM_ON_DROP_RATIO
        {
            state.armed = true;
            state.peak_while_disarmed = 0.0;
        }
        false
    }
}

/// Resolved detection parameters for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub threshold: f64,
    pub min_interval_ms: f64,
    pub gains: PerBand<f64>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            gains: default_gains(),
        }
    }
}

/// A band onset handed to the emission sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandTrigger {
    #[serde(rename = "channelName")]
    pub band: Band,
    pub velocity: f64,
}

/// Outcome of one band within a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandStep {
    pub velocity: f64,
    pub fired: bool,
}

/// Normaliser and gate chained over the three bands, with the state they own.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelopePipeline {
    normalizer: AdaptiveNormalizer,
    gate: OnsetGate,
    states: PerBand<EnvelopeState>,
    levels: BandLevels,
}

impl Default for SignalEnvelopePipeline {
    fn default() -> Self {
        Self::new(DetectionParams::default())
    }
}

impl SignalEnvelopePipeline {
    pub fn new(params: DetectionParams) -> Self {
        Self {
            normalizer: AdaptiveNormalizer::new(params.gains),
            gate: OnsetGate::new(params.threshold, params.min_interval_ms),
            states: PerBand::splat(EnvelopeState::default()),
            levels: PerBand::splat(0.0),
        }
    }

    pub fn gate(&self) -> &OnsetGate {
        &self.gate
    }

    pub fn state(&self, band: Band) -> &EnvelopeState {
        match band {
            Band::Low => &self.states.low,
            Band::Medium => &self.states.medium,
            Band::High => &self.states.high,
        }
    }

    /// Most recent velocity per band.
    pub fn levels(&self) -> BandLevels {
        self.levels
    }

    /// Swaps gains, threshold and cooldown while keeping the running peaks
    /// and gate state.
    pub fn set_params(&mut self, params: DetectionParams) {
        self.normalizer = AdaptiveNormalizer::new(params.gains);
        self.gate = OnsetGate::new(params.threshold, params.min_interval_ms);
    }

    pub fn reset(&mut self) {
        self.states = PerBand::splat(EnvelopeState::default());
        self.levels = PerBand::splat(0.0);
    }

    pub fn process_band(&mut self, band: Band, raw_rms: f64, now_ms: f64) -> BandStep {
        let state = self.states.get_mut(band);
        let velocity = self.normalizer.process(band, state, raw_rms);
        let fired = self.gate.process(state, velocity, now_ms);
        *self.levels.get_mut(band) = velocity;
        BandStep { velocity, fired }
    }

    /// Runs a whole frame with a single timestamp, bands in [`Band::ALL`] order.
    pub fn process_frame(&mut self, analysis: &BandAnalysis, now_ms: f64) -> Vec<BandTrigger> {
        Band::ALL
            .into_iter()
            .filter_map(|band| {
                let step = self.process_band(band, analysis.rms.get(band), now_ms);
                step.fired.then_some(BandTrigger {
                    band,
                    velocity: step.velocity,
                })
            })
            .collect()
    }
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
