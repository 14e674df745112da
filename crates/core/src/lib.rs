//! Core library for the Trigger Rig performance instrument.
//!
//! Two halves meet here. The signal half turns live or file audio into
//! per-band onset triggers (`analysis`, `envelope`, `audio`). The routing
//! half turns discrete input events into track switches, channel flashes and
//! recorded hits (`mapping`, `routing`, `record`, `set`). Configuration and
//! errors are shared by both.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod envelope;
pub mod error;
pub mod mapping;
pub mod record;
pub mod routing;
pub mod set;
pub mod timeline;

pub use analysis::{analyze_bands, Band, BandAnalysis, BandLevels, PerBand, SpectrumAnalyser};
pub use audio::{
    CaptureController, CaptureStatus, LevelsSnapshot, PlaybackController, PlaybackStatus,
    SpectrumSource, TriggerEmitter,
};
pub use config::{AppConfig, AudioConfig, ConfigResolver, PipelineKind, SettingsStore};
pub use envelope::{BandTrigger, DetectionParams, SignalEnvelopePipeline};
pub use error::{Result, TriggerRigError};
pub use mapping::{InputSourceType, NoteMatchMode, TriggerKey, TriggerMapBuilder, TriggerMapSet};
pub use record::{Recorder, RecordingSettings, RecordingStateEntry};
pub use routing::{EventForwarder, EventRouter, InputEvent, RouteOutcome, RouteReport};
pub use set::{ModuleInstance, PerformanceSet, Track};
pub use timeline::{Clock, ManualClock, PlaybackClock};
