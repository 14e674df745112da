//! Resolution of raw input events into track selection and channel flashes.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    audio::TriggerEmitter,
    config::{AppConfig, MappingConfig},
    envelope::BandTrigger,
    mapping::{InputSourceType, NoteMatchMode, TriggerKey, TriggerMapBuilder, TriggerMapSet},
    record::{Recorder, RecordingSettings, RecordingStateEntry, TrackRecording},
    set::{PerformanceSet, Track},
    timeline::Clock,
    Result, TriggerRigError,
};

/// How long a UI flash lasts.
pub const FLASH_DURATION_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    TrackSelection,
    MethodTrigger,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::TrackSelection => "track-selection",
            EventKind::MethodTrigger => "method-trigger",
            EventKind::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventData {
    pub note: Option<f64>,
    pub channel: Option<i64>,
    pub address: Option<String>,
    pub identifier: Option<String>,
    pub channel_name: Option<String>,
    pub value: Option<Value>,
    pub timestamp: Option<f64>,
}

/// An externally supplied input event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: InputSourceType,
    #[serde(default)]
    pub data: EventData,
}

impl InputEvent {
    pub fn midi_note(kind: EventKind, note: i64) -> Self {
        Self {
            kind,
            source: InputSourceType::Midi,
            data: EventData {
                note: Some(note as f64),
                ..Default::default()
            },
        }
    }

    pub fn osc(kind: EventKind, address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            kind,
            source: InputSourceType::Osc,
            data: EventData {
                channel_name: Some(address.clone()),
                address: Some(address),
                ..Default::default()
            },
        }
    }

    /// Method trigger coming from an audio-origin pipeline.
    pub fn band_trigger(source: InputSourceType, trigger: BandTrigger) -> Self {
        Self {
            kind: EventKind::MethodTrigger,
            source,
            data: EventData {
                channel_name: Some(trigger.band.as_str().to_string()),
                value: serde_json::Number::from_f64(trigger.velocity).map(Value::Number),
                ..Default::default()
            },
        }
    }

    /// Integral MIDI note number, if the event carries one.
    fn note(&self) -> Option<i64> {
        self.data
            .note
            .filter(|note| note.is_finite() && note.fract() == 0.0)
            .map(|note| note as i64)
    }

    fn note_key(&self, mode: NoteMatchMode) -> Option<TriggerKey> {
        self.note().map(|note| mode.key(note))
    }

    fn channel_name_key(&self) -> Option<TriggerKey> {
        self.data
            .channel_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(TriggerKey::new)
    }

    /// Key a track-selection event is looked up by.
    fn selection_key(&self, mode: NoteMatchMode) -> Option<TriggerKey> {
        match self.source {
            InputSourceType::Midi => self.note_key(mode),
            InputSourceType::Osc | InputSourceType::Websocket => self
                .data
                .address
                .as_deref()
                .or(self.data.identifier.as_deref())
                .filter(|literal| !literal.is_empty())
                .map(TriggerKey::new),
            InputSourceType::Audio | InputSourceType::File => self.channel_name_key(),
            InputSourceType::Unknown => None,
        }
    }
}

/// Something the UI should flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FlashTarget {
    #[serde(rename_all = "camelCase")]
    Module { track_id: String, instance_id: String },
    #[serde(rename_all = "camelCase")]
    Channel { track_id: String, channel: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashSignal {
    pub target: FlashTarget,
    pub duration_ms: u64,
}

impl FlashSignal {
    fn new(target: FlashTarget) -> Self {
        Self {
            target,
            duration_ms: FLASH_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IgnoreReason {
    SequencerMode,
    UnknownType,
    UnknownSource,
    NoActiveTrack,
    NoTriggerKey,
    NoMatch,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IgnoreReason::SequencerMode => "sequencer mode is active",
            IgnoreReason::UnknownType => "unknown event type",
            IgnoreReason::UnknownSource => "unknown source",
            IgnoreReason::NoActiveTrack => "no active track",
            IgnoreReason::NoTriggerKey => "event carries no trigger key",
            IgnoreReason::NoMatch => "no mapping matched",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RouteOutcome {
    Ignored {
        reason: IgnoreReason,
        key: Option<TriggerKey>,
    },
    #[serde(rename_all = "camelCase")]
    TrackSelected {
        track_id: String,
        track_name: String,
        previous_track_id: Option<String>,
        discarded_take: bool,
    },
    #[serde(rename_all = "camelCase")]
    ChannelsTriggered {
        track_id: String,
        channels: BTreeSet<String>,
        recorded: usize,
    },
}

/// Everything the router decided about one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteReport {
    pub kind: EventKind,
    pub source: InputSourceType,
    pub outcome: RouteOutcome,
    pub flashes: Vec<FlashSignal>,
}

impl RouteReport {
    fn ignored(event: &InputEvent, reason: IgnoreReason, key: Option<TriggerKey>) -> Self {
        Self {
            kind: event.kind,
            source: event.source,
            outcome: RouteOutcome::Ignored { reason, key },
            flashes: Vec::new(),
        }
    }

    /// Track the router switched to, if any.
    pub fn selected_track(&self) -> Option<&str> {
        match &self.outcome {
            RouteOutcome::TrackSelected { track_id, .. } => Some(track_id),
            _ => None,
        }
    }

    pub fn flashed_channels(&self) -> BTreeSet<String> {
        match &self.outcome {
            RouteOutcome::ChannelsTriggered { channels, .. } => channels.clone(),
            _ => BTreeSet::new(),
        }
    }
}

impl fmt::Display for RouteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} event from {}: ", self.kind, self.source)?;
        match &self.outcome {
            RouteOutcome::Ignored { reason, key } => {
                write!(f, "ignored ({reason})")?;
                if let Some(key) = key {
                    write!(f, " for key `{key}`")?;
                }
                Ok(())
            }
            RouteOutcome::TrackSelected {
                track_name,
                track_id,
                previous_track_id,
                discarded_take,
            } => {
                write!(f, "selected track `{track_name}` ({track_id})")?;
                if let Some(previous) = previous_track_id {
                    write!(f, " after `{previous}`")?;
                }
                if *discarded_take {
                    f.write_str(", previous take discarded")?;
                }
                write!(f, ", flashing {} modules", self.flashes.len())
            }
            RouteOutcome::ChannelsTriggered {
                track_id,
                channels,
                recorded,
            } => {
                let list: Vec<&str> = channels.iter().map(String::as_str).collect();
                write!(
                    f,
                    "track `{track_id}` flashed channels [{}], {recorded} recorded",
                    list.join(", ")
                )
            }
        }
    }
}

/// Routing engine for the active set.
#[derive(Debug)]
pub struct EventRouter {
    set: PerformanceSet,
    mappings: MappingConfig,
    input_type: InputSourceType,
    note_match_mode: NoteMatchMode,
    sequencer_mode: bool,
    maps: TriggerMapSet,
    active_track: Option<String>,
    recorder: Recorder,
    last_events: HashMap<InputSourceType, InputEvent>,
    clock: Arc<dyn Clock>,
}

impl EventRouter {
    pub fn new(set: PerformanceSet, config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let mut router = Self {
            set,
            mappings: config.mappings.clone(),
            input_type: config.input_type,
            note_match_mode: config.note_match_mode,
            sequencer_mode: config.sequencer_mode,
            maps: TriggerMapSet::default(),
            active_track: None,
            recorder: Recorder::new(RecordingSettings::default()),
            last_events: HashMap::new(),
            clock,
        };
        router.rebuild_maps();
        router
    }

    pub fn set(&self) -> &PerformanceSet {
        &self.set
    }

    pub fn maps(&self) -> &TriggerMapSet {
        &self.maps
    }

    pub fn input_type(&self) -> InputSourceType {
        self.input_type
    }

    /// Replaces the active set. The active track is kept only when it also
    /// exists in the new set; recordings of departed tracks are dropped.
    pub fn set_active_set(&mut self, set: PerformanceSet) {
        self.set = set;
        if let Some(active) = self.active_track.as_deref() {
            if self.set.track(active).is_none() {
                self.active_track = None;
            }
        }
        let set = &self.set;
        self.recorder.retain_tracks(|track_id| set.track(track_id).is_some());
        self.rebuild_maps();
    }

    pub fn set_mapping_config(&mut self, mappings: MappingConfig) {
        self.mappings = mappings;
        self.rebuild_maps();
    }

    pub fn set_input_type(&mut self, input_type: InputSourceType) {
        self.input_type = input_type;
        self.rebuild_maps();
    }

    pub fn set_note_match_mode(&mut self, mode: NoteMatchMode) {
        self.note_match_mode = mode;
        self.rebuild_maps();
    }

    pub fn set_sequencer_mode(&mut self, enabled: bool) {
        self.sequencer_mode = enabled;
    }

    pub fn active_track(&self) -> Option<&Track> {
        self.active_track
            .as_deref()
            .and_then(|id| self.set.track(id))
    }

    /// Activates a track directly, with the same recording and flash
    /// behaviour as a matched track-selection event.
    pub fn activate_track(&mut self, track_id: &str) -> Result<Vec<FlashSignal>> {
        if self.set.track(track_id).is_none() {
            return Err(TriggerRigError::msg(format!(
                "track `{track_id}` is not part of the active set"
            )));
        }
        let (_, flashes) = self.switch_to(track_id);
        Ok(flashes)
    }

    pub fn last_event(&self, source: InputSourceType) -> Option<&InputEvent> {
        self.last_events.get(&source)
    }

    pub fn recording_state(&self, track_id: &str) -> Option<&RecordingStateEntry> {
        self.recorder.state(track_id)
    }

    pub fn recording(&self, track_id: &str) -> Option<&TrackRecording> {
        self.recorder.take(track_id)
    }

    pub fn stop_recording(&mut self, track_id: &str) {
        self.recorder.stop(track_id);
    }

    /// Routes one event. Never fails; unroutable events come back as
    /// [`RouteOutcome::Ignored`].
    pub fn route(&mut self, event: &InputEvent) -> RouteReport {
        if event.source != InputSourceType::Unknown {
            self.last_events.insert(event.source, event.clone());
        }

        let report = if self.sequencer_mode {
            RouteReport::ignored(event, IgnoreReason::SequencerMode, None)
        } else if event.source == InputSourceType::Unknown {
            RouteReport::ignored(event, IgnoreReason::UnknownSource, None)
        } else {
            match event.kind {
                EventKind::TrackSelection => self.select_track(event),
                EventKind::MethodTrigger => self.trigger_methods(event),
                EventKind::Unknown => RouteReport::ignored(event, IgnoreReason::UnknownType, None),
            }
        };

        tracing::debug!(
            target: "trigger_rig::router",
            kind = %event.kind,
            source = %event.source,
            "{report}"
        );
        report
    }

    fn rebuild_maps(&mut self) {
        self.maps = TriggerMapBuilder::new(self.note_match_mode).build(
            &self.set.tracks,
            &self.mappings,
            self.input_type,
        );
    }

    fn select_track(&mut self, event: &InputEvent) -> RouteReport {
        let Some(key) = event.selection_key(self.note_match_mode) else {
            return RouteReport::ignored(event, IgnoreReason::NoTriggerKey, None);
        };

        let track_id = self
            .maps
            .for_source(event.source)
            .and_then(|maps| maps.track_for(&key))
            .and_then(|name| self.set.track_by_name(name))
            .map(|track| track.id.clone());
        let Some(track_id) = track_id else {
            return RouteReport::ignored(event, IgnoreReason::NoMatch, Some(key));
        };

        let previous_track_id = self.active_track.clone();
        let (discarded_take, flashes) = self.switch_to(&track_id);
        let track_name = self
            .set
            .track(&track_id)
            .map(|track| track.name.clone())
            .unwrap_or_default();

        RouteReport {
            kind: event.kind,
            source: event.source,
            outcome: RouteOutcome::TrackSelected {
                track_id,
                track_name,
                previous_track_id,
                discarded_take,
            },
            flashes,
        }
    }

    fn switch_to(&mut self, track_id: &str) -> (bool, Vec<FlashSignal>) {
        let now = self.clock.now_ms();
        self.active_track = Some(track_id.to_string());
        let discarded = self.recorder.start(track_id, now);

        let flashes = self
            .set
            .track(track_id)
            .map(|track| {
                track
                    .modules
                    .iter()
                    .map(|module| {
                        FlashSignal::new(FlashTarget::Module {
                            track_id: track.id.clone(),
                            instance_id: module.id.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        (discarded, flashes)
    }

    fn trigger_methods(&mut self, event: &InputEvent) -> RouteReport {
        let Some(track) = self.active_track() else {
            return RouteReport::ignored(event, IgnoreReason::NoActiveTrack, None);
        };
        let track_id = track.id.clone();
        let channels = self.resolve_channels(track, event);

        if channels.is_empty() {
            let key = match event.source {
                InputSourceType::Midi => event.note_key(self.note_match_mode),
                _ => event.channel_name_key(),
            };
            return RouteReport::ignored(event, IgnoreReason::NoMatch, key);
        }

        let now = self.clock.now_ms();
        let mut flashes = Vec::with_capacity(channels.len());
        let mut recorded = 0;
        for channel in &channels {
            flashes.push(FlashSignal::new(FlashTarget::Channel {
                track_id: track_id.clone(),
                channel: channel.clone(),
            }));
            if self.recorder.record_hit(&track_id, channel, now).is_some() {
                recorded += 1;
            }
        }

        RouteReport {
            kind: event.kind,
            source: event.source,
            outcome: RouteOutcome::ChannelsTriggered {
                track_id,
                channels,
                recorded,
            },
            flashes,
        }
    }

    /// Channels of `track` whose bound modules accept `event`.
    ///
    /// When any module on the track overrides its input source, only modules
    /// whose effective source equals the event source take part. Without
    /// overrides the event source has to equal the global input type.
    fn resolve_channels(&self, track: &Track, event: &InputEvent) -> BTreeSet<String> {
        let any_override = track.has_source_override();
        let note_key = event.note_key(self.note_match_mode);
        let name_key = event.channel_name_key();
        let mut channels = BTreeSet::new();

        for (channel, &slot) in &track.channel_mappings {
            let bound = track
                .modules
                .iter()
                .filter(|module| module.is_enabled() && module.binds_channel(channel));

            for module in bound {
                let effective = module.input_source.unwrap_or(self.input_type);
                let eligible = if any_override {
                    effective == event.source
                } else {
                    event.source == self.input_type
                };
                if !eligible {
                    continue;
                }

                let expected = module
                    .input_mappings
                    .get(channel)
                    .and_then(TriggerKey::from_json)
                    .or_else(|| self.maps.channel_trigger(slot, effective).cloned());
                let Some(expected) = expected else {
                    continue;
                };

                let incoming = match event.source {
                    InputSourceType::Midi => note_key.as_ref(),
                    _ => name_key.as_ref(),
                };
                if incoming == Some(&expected) {
                    channels.insert(channel.clone());
                }
            }
        }

        channels
    }
}

/// Default depth of the queue between an audio pipeline and the router.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Forwards audio-origin triggers into the router's event queue. When the
/// queue is full the trigger is dropped.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    source: InputSourceType,
    tx: mpsc::Sender<InputEvent>,
}

impl EventForwarder {
    pub fn new(source: InputSourceType, tx: mpsc::Sender<InputEvent>) -> Self {
        Self { source, tx }
    }

    /// A forwarder and the receiving end of a queue of `capacity` events.
    pub fn channel(source: InputSourceType, capacity: usize) -> (Self, mpsc::Receiver<InputEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(source, tx), rx)
    }
}

impl TriggerEmitter for EventForwarder {
    fn emit(&self, trigger: BandTrigger) -> BoxFuture<'_, Result<()>> {
        let sent = match self.tx.try_send(InputEvent::band_trigger(self.source, trigger)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    target: "trigger_rig::router",
                    source = %self.source,
                    band = %trigger.band,
                    "event queue full, trigger dropped"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TriggerRigError::msg("event queue has been closed"))
            }
        };
        Box::pin(async move { sent })
    }
}
