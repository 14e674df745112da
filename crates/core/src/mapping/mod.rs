//! Lookup tables that turn incoming trigger values into tracks and channel
//! slots.
//!
//! Tables are rebuilt from scratch whenever the active set or the global
//! mapping configuration changes. The builder always produces tables for
//! every known input source, not only the active one, so an event that was
//! already in flight when the global input type changed still resolves
//! against the tables of its own source.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::{MappingConfig, SlotTable},
    set::Track,
};

/// Where an input event came from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum InputSourceType {
    #[default]
    Midi,
    Osc,
    Audio,
    File,
    Websocket,
    #[serde(other)]
    Unknown,
}

impl InputSourceType {
    pub const KNOWN: [InputSourceType; 5] = [
        InputSourceType::Midi,
        InputSourceType::Osc,
        InputSourceType::Audio,
        InputSourceType::File,
        InputSourceType::Websocket,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InputSourceType::Midi => "midi",
            InputSourceType::Osc => "osc",
            InputSourceType::Audio => "audio",
            InputSourceType::File => "file",
            InputSourceType::Websocket => "websocket",
            InputSourceType::Unknown => "unknown",
        }
    }

    /// Highest slot number the global tables accept for this source.
    pub fn max_slot(self) -> u32 {
        match self {
            InputSourceType::Midi => 12,
            _ => 10,
        }
    }
}

impl fmt::Display for InputSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How MIDI note numbers are compared against trigger values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoteMatchMode {
    #[default]
    PitchClass,
    ExactNote,
}

impl NoteMatchMode {
    pub fn encode(self, note: i64) -> i64 {
        match self {
            NoteMatchMode::PitchClass => note.rem_euclid(12),
            NoteMatchMode::ExactNote => note,
        }
    }

    pub fn key(self, note: i64) -> TriggerKey {
        TriggerKey::from_number(self.encode(note))
    }
}

/// Canonical, comparable form of a trigger value (note number, OSC address,
/// band name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerKey(String);

impl TriggerKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_number(value: i64) -> Self {
        Self(value.to_string())
    }

    /// Integral numbers render without a fractional part so `7` and
    /// `7.0` compare equal. Empty strings, booleans and containers yield
    /// no key.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Some(Self::from_number(int))
                } else {
                    let float = number.as_f64()?;
                    if !float.is_finite() {
                        None
                    } else if float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
                        Some(Self::from_number(float as i64))
                    } else {
                        Some(Self(float.to_string()))
                    }
                }
            }
            Value::String(text) if !text.is_empty() => Some(Self(text.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup tables for one input source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerMaps {
    /// Trigger key to the name of the track it selects.
    pub track_triggers: HashMap<TriggerKey, String>,
    /// Channel slot to the trigger key that fires it.
    pub channel_triggers: BTreeMap<u32, TriggerKey>,
}

impl TriggerMaps {
    pub fn track_for(&self, key: &TriggerKey) -> Option<&str> {
        self.track_triggers.get(key).map(String::as_str)
    }

    pub fn channel_trigger(&self, slot: u32) -> Option<&TriggerKey> {
        self.channel_triggers.get(&slot)
    }

    pub fn is_empty(&self) -> bool {
        self.track_triggers.is_empty() && self.channel_triggers.is_empty()
    }
}

/// Tables for the active source plus every other known source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerMapSet {
    active: InputSourceType,
    by_source: BTreeMap<InputSourceType, TriggerMaps>,
}

impl TriggerMapSet {
    pub fn active_type(&self) -> InputSourceType {
        self.active
    }

    /// Tables of the active input type.
    pub fn active(&self) -> Option<&TriggerMaps> {
        self.for_source(self.active)
    }

    pub fn for_source(&self, source: InputSourceType) -> Option<&TriggerMaps> {
        self.by_source.get(&source)
    }

    pub fn channel_trigger(&self, slot: u32, source: InputSourceType) -> Option<&TriggerKey> {
        self.for_source(source)?.channel_trigger(slot)
    }
}

/// Builds [`TriggerMapSet`]s. A pure function of its inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMapBuilder {
    mode: NoteMatchMode,
}

impl TriggerMapBuilder {
    pub fn new(mode: NoteMatchMode) -> Self {
        Self { mode }
    }

    pub fn build(
        &self,
        tracks: &[Track],
        config: &MappingConfig,
        active: InputSourceType,
    ) -> TriggerMapSet {
        let by_source = InputSourceType::KNOWN
            .into_iter()
            .map(|source| (source, self.build_for(tracks, config, source)))
            .collect();

        TriggerMapSet { active, by_source }
    }

    /// Tables for a single source.
    pub fn build_for(
        &self,
        tracks: &[Track],
        config: &MappingConfig,
        source: InputSourceType,
    ) -> TriggerMaps {
        let mut maps = TriggerMaps::default();
        let max_slot = source.max_slot();

        if let Some(table) = config.track_mappings.table(source, self.mode) {
            for track in tracks {
                let Some(slot) = track.slot else {
                    continue;
                };
                if !(1..=max_slot).contains(&slot) {
                    tracing::trace!(track = %track.name, slot, %source, "track slot out of range");
                    continue;
                }
                if let Some(key) = lookup_slot(table, slot) {
                    maps.track_triggers.insert(key, track.name.clone());
                }
            }
        }

        if let Some(table) = config.channel_mappings.table(source, self.mode) {
            for (raw_slot, value) in table {
                let Some(slot) = parse_slot(raw_slot) else {
                    continue;
                };
                if !(1..=max_slot).contains(&slot) {
                    continue;
                }
                if let Some(key) = TriggerKey::from_json(value) {
                    maps.channel_triggers.insert(slot, key);
                }
            }
        }

        maps
    }
}

fn parse_slot(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

fn lookup_slot(table: &SlotTable, slot: u32) -> Option<TriggerKey> {
    table
        .get(&slot.to_string())
        .and_then(TriggerKey::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> MappingConfig {
        serde_json::from_value(json!({
            "trackMappings": {
                "midi": {
                    "pitchClass": { "1": 0, "2": 2 },
                    "exactNote": { "1": 60, "2": 62 }
                },
                "osc": { "1": "/track/1", "2": "/track/2" }
            },
            "channelMappings": {
                "midi": { "pitchClass": { "3": 7, "13": 1 } },
                "audio": { "1": "low", "2": "medium", "3": "high", "x": "junk" }
            }
        }))
        .unwrap()
    }

    fn tracks() -> Vec<Track> {
        vec![
            Track::new("a", "Alpha").with_slot(1),
            Track::new("b", "Beta").with_slot(2),
            Track::new("c", "Gamma"),
            Track::new("d", "Delta").with_slot(40),
        ]
    }

    #[test]
    fn builds_track_triggers_per_mode() {
        let pitch = TriggerMapBuilder::new(NoteMatchMode::PitchClass).build(
            &tracks(),
            &config(),
            InputSourceType::Midi,
        );
        let midi = pitch.active().unwrap();
        assert_eq!(midi.track_for(&TriggerKey::new("0")), Some("Alpha"));
        assert_eq!(midi.track_for(&TriggerKey::new("2")), Some("Beta"));
        assert_eq!(midi.track_triggers.len(), 2);

        let exact = TriggerMapBuilder::new(NoteMatchMode::ExactNote).build(
            &tracks(),
            &config(),
            InputSourceType::Midi,
        );
        let midi = exact.active().unwrap();
        assert_eq!(midi.track_for(&TriggerKey::new("62")), Some("Beta"));
        assert!(midi.channel_triggers.is_empty());
    }

    #[test]
    fn builds_tables_for_every_known_source() {
        let maps = TriggerMapBuilder::default().build(&tracks(), &config(), InputSourceType::Osc);
        assert_eq!(maps.active_type(), InputSourceType::Osc);
        for source in InputSourceType::KNOWN {
            assert!(maps.for_source(source).is_some(), "{source} missing");
        }
        assert!(maps.for_source(InputSourceType::Unknown).is_none());

        let osc = maps.active().unwrap();
        assert_eq!(osc.track_for(&TriggerKey::new("/track/2")), Some("Beta"));
        assert_eq!(
            maps.channel_trigger(2, InputSourceType::Audio),
            Some(&TriggerKey::new("medium"))
        );
        assert_eq!(
            maps.channel_trigger(3, InputSourceType::Midi),
            Some(&TriggerKey::new("7"))
        );
        // Slot 13 is out of range for MIDI, "x" is not a slot.
        assert_eq!(maps.for_source(InputSourceType::Midi).unwrap().channel_triggers.len(), 1);
        assert_eq!(maps.for_source(InputSourceType::Audio).unwrap().channel_triggers.len(), 3);
    }

    #[test]
    fn build_is_pure() {
        let builder = TriggerMapBuilder::new(NoteMatchMode::PitchClass);
        let first = builder.build(&tracks(), &config(), InputSourceType::Midi);
        let second = builder.build(&tracks(), &config(), InputSourceType::Midi);
        assert_eq!(first, second);
    }

    #[test]
    fn normalises_json_trigger_values() {
        assert_eq!(TriggerKey::from_json(&json!(7)), Some(TriggerKey::new("7")));
        assert_eq!(TriggerKey::from_json(&json!(7.0)), Some(TriggerKey::new("7")));
        assert_eq!(TriggerKey::from_json(&json!(7.5)), Some(TriggerKey::new("7.5")));
        assert_eq!(TriggerKey::from_json(&json!("/a")), Some(TriggerKey::new("/a")));
        assert_eq!(TriggerKey::from_json(&json!("")), None);
        assert_eq!(TriggerKey::from_json(&json!(null)), None);
        assert_eq!(TriggerKey::from_json(&json!(true)), None);
    }

    #[test]
    fn pitch_class_wraps_notes() {
        assert_eq!(NoteMatchMode::PitchClass.encode(91), 7);
        assert_eq!(NoteMatchMode::PitchClass.encode(-1), 11);
        assert_eq!(NoteMatchMode::ExactNote.encode(91), 91);
    }
}
