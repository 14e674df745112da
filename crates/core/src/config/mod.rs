use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod de;

pub(crate) use de::{
    lenient, lenient_gains, lenient_list, lenient_number, lenient_slot, lenient_slot_map,
};

use crate::{
    analysis::{Band, PerBand, DEFAULT_SMOOTHING_TIME_CONSTANT},
    envelope::{default_gain, DetectionParams, DEFAULT_MIN_INTERVAL_MS, DEFAULT_THRESHOLD},
    mapping::{InputSourceType, NoteMatchMode},
    set::Track,
    Result,
};

/// Top-level configuration structure for the application. Malformed values
/// fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(deserialize_with = "lenient")]
    pub audio: AudioConfig,
    /// Detection values for every track. Values set on a track win, and
    /// both take precedence over persisted settings.
    #[serde(deserialize_with = "lenient")]
    pub detection: DetectionOverrides,
    #[serde(deserialize_with = "lenient")]
    pub mappings: MappingConfig,
    #[serde(deserialize_with = "lenient")]
    pub input_type: InputSourceType,
    #[serde(deserialize_with = "lenient")]
    pub note_match_mode: NoteMatchMode,
    #[serde(deserialize_with = "lenient")]
    pub sequencer_mode: bool,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Loads `path` when given, falling back to defaults when it is absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawAudioConfig")]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    /// Period of the processing tick, standing in for the display refresh.
    pub frame_interval_ms: u64,
    pub smoothing_time_constant: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            fft_size: 2048,
            frame_interval_ms: 16,
            smoothing_time_constant: DEFAULT_SMOOTHING_TIME_CONSTANT,
        }
    }
}

/// [`AudioConfig`] as read from disk, every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawAudioConfig {
    #[serde(deserialize_with = "lenient")]
    sample_rate: Option<u32>,
    #[serde(deserialize_with = "lenient")]
    fft_size: Option<usize>,
    #[serde(deserialize_with = "lenient")]
    frame_interval_ms: Option<u64>,
    #[serde(deserialize_with = "lenient_number")]
    smoothing_time_constant: Option<f64>,
}

impl From<RawAudioConfig> for AudioConfig {
    fn from(raw: RawAudioConfig) -> Self {
        let defaults = Self::default();
        Self {
            sample_rate: raw.sample_rate.unwrap_or(defaults.sample_rate),
            fft_size: raw.fft_size.unwrap_or(defaults.fft_size),
            frame_interval_ms: raw.frame_interval_ms.unwrap_or(defaults.frame_interval_ms),
            smoothing_time_constant: raw
                .smoothing_time_constant
                .map(|value| value as f32)
                .unwrap_or(defaults.smoothing_time_constant),
        }
    }
}

/// Explicitly supplied detection values; `None` defers to persisted
/// settings and then to the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionOverrides {
    #[serde(deserialize_with = "lenient_number")]
    pub threshold: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub min_interval_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_gains")]
    pub gains: PerBand<Option<f64>>,
}

impl DetectionOverrides {
    /// Values set here, with the gaps filled from `fallback`.
    pub fn or(self, fallback: DetectionOverrides) -> Self {
        Self {
            threshold: self.threshold.or(fallback.threshold),
            min_interval_ms: self.min_interval_ms.or(fallback.min_interval_ms),
            gains: PerBand {
                low: self.gains.low.or(fallback.gains.low),
                medium: self.gains.medium.or(fallback.gains.medium),
                high: self.gains.high.or(fallback.gains.high),
            },
        }
    }
}

/// Which pipeline a set of settings belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Live,
    File,
}

impl PipelineKind {
    /// Key prefix used for persisted settings.
    pub fn prefix(self) -> &'static str {
        match self {
            PipelineKind::Live => "audio",
            PipelineKind::File => "file",
        }
    }
}

/// Slot number (as a string key) to trigger value.
pub type SlotTable = BTreeMap<String, Value>;

/// MIDI tables are split by note match mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MidiTables {
    #[serde(deserialize_with = "lenient")]
    pub pitch_class: SlotTable,
    #[serde(deserialize_with = "lenient")]
    pub exact_note: SlotTable,
}

impl MidiTables {
    pub fn for_mode(&self, mode: NoteMatchMode) -> &SlotTable {
        match mode {
            NoteMatchMode::PitchClass => &self.pitch_class,
            NoteMatchMode::ExactNote => &self.exact_note,
        }
    }
}

/// Slot tables for every input source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceTables {
    #[serde(deserialize_with = "lenient")]
    pub midi: MidiTables,
    #[serde(deserialize_with = "lenient")]
    pub osc: SlotTable,
    #[serde(deserialize_with = "lenient")]
    pub audio: SlotTable,
    #[serde(deserialize_with = "lenient")]
    pub file: SlotTable,
    #[serde(deserialize_with = "lenient")]
    pub websocket: SlotTable,
}

impl SourceTables {
    /// The table consulted for `source`; MIDI picks the one for `mode`.
    pub fn table(&self, source: InputSourceType, mode: NoteMatchMode) -> Option<&SlotTable> {
        match source {
            InputSourceType::Midi => Some(self.midi.for_mode(mode)),
            InputSourceType::Osc => Some(&self.osc),
            InputSourceType::Audio => Some(&self.audio),
            InputSourceType::File => Some(&self.file),
            InputSourceType::Websocket => Some(&self.websocket),
            InputSourceType::Unknown => None,
        }
    }
}

/// Global per-source trigger tables. Read-only to the routing engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MappingConfig {
    /// Track slot to the value that selects the track.
    #[serde(deserialize_with = "lenient")]
    pub track_mappings: SourceTables,
    /// Channel slot to the value that fires the channel.
    #[serde(deserialize_with = "lenient")]
    pub channel_mappings: SourceTables,
}

/// Persisted settings, keyed by dotted names such as `audio.threshold`.
pub trait SettingsStore: Send + Sync + fmt::Debug {
    fn read(&self, key: &str) -> Option<Value>;
}

/// In-memory settings, also used to stub persistence in tests.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.write(key, value);
        self
    }

    pub fn write(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.into(), value.into());
        }
    }
}

impl SettingsStore for MemorySettings {
    fn read(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }
}

/// Settings read once from a flat JSON object on disk.
#[derive(Debug, Default)]
pub struct JsonFileSettings {
    values: serde_json::Map<String, Value>,
}

impl JsonFileSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Anything other than a JSON object yields empty settings.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let values = match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            other => {
                tracing::warn!(kind = ?other, "settings file is not an object, ignoring");
                serde_json::Map::new()
            }
        };
        Ok(Self { values })
    }
}

impl SettingsStore for JsonFileSettings {
    fn read(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

/// Resolves detection parameters with precedence explicit value, then
/// persisted setting, then default. Non-finite values at any layer are skipped.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    store: Arc<dyn SettingsStore>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(Arc::new(MemorySettings::new()))
    }
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub fn threshold(&self, kind: PipelineKind, explicit: Option<f64>) -> f64 {
        self.resolve(explicit, &format!("{}.threshold", kind.prefix()), DEFAULT_THRESHOLD)
            .clamp(0.0, 1.0)
    }

    pub fn min_interval_ms(&self, kind: PipelineKind, explicit: Option<f64>) -> f64 {
        self.resolve(
            explicit,
            &format!("{}.minIntervalMs", kind.prefix()),
            DEFAULT_MIN_INTERVAL_MS,
        )
        .max(0.0)
    }

    pub fn gain(&self, kind: PipelineKind, band: Band, explicit: Option<f64>) -> f64 {
        self.resolve(
            explicit,
            &format!("{}.gain.{}", kind.prefix(), band.as_str()),
            default_gain(band),
        )
        .max(0.0)
    }

    /// Parameters for `track`: its own values first, then `global`, then
    /// persisted settings and defaults.
    pub fn track_detection(
        &self,
        kind: PipelineKind,
        track: Option<&Track>,
        global: &DetectionOverrides,
    ) -> DetectionParams {
        let overrides = match track {
            Some(track) => track.detection.or(*global),
            None => *global,
        };
        self.detection(kind, &overrides)
    }

    pub fn detection(&self, kind: PipelineKind, overrides: &DetectionOverrides) -> DetectionParams {
        DetectionParams {
            threshold: self.threshold(kind, overrides.threshold),
            min_interval_ms: self.min_interval_ms(kind, overrides.min_interval_ms),
            gains: PerBand {
                low: self.gain(kind, Band::Low, overrides.gains.low),
                medium: self.gain(kind, Band::Medium, overrides.gains.medium),
                high: self.gain(kind, Band::High, overrides.gains.high),
            },
        }
    }

    fn resolve(&self, explicit: Option<f64>, key: &str, default: f64) -> f64 {
        explicit
            .filter(|value| value.is_finite())
            .or_else(|| self.store.read(key).as_ref().and_then(finite_number))
            .unwrap_or(default)
    }
}

/// Reads a finite number out of a JSON value, accepting numeric strings.
pub fn finite_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}
