use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::{lenient, lenient_list, lenient_slot, lenient_slot_map, DetectionOverrides},
    mapping::InputSourceType,
    Result,
};

/// A visual module placed on a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModuleInstance {
    #[serde(deserialize_with = "lenient")]
    pub id: String,
    #[serde(rename = "type", deserialize_with = "lenient")]
    pub kind: String,
    #[serde(deserialize_with = "lenient")]
    pub disabled: bool,
    /// Source this module listens to instead of the global input type.
    #[serde(deserialize_with = "lenient")]
    pub input_source: Option<InputSourceType>,
    /// Channel number to the trigger value this module expects instead of
    /// the global channel table.
    #[serde(deserialize_with = "lenient")]
    pub input_mappings: BTreeMap<String, Value>,
    /// Channel number to the methods bound on it.
    #[serde(deserialize_with = "lenient")]
    pub methods: BTreeMap<String, Vec<String>>,
}

impl ModuleInstance {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn bind(mut self, channel: impl Into<String>, method: impl Into<String>) -> Self {
        self.methods
            .entry(channel.into())
            .or_default()
            .push(method.into());
        self
    }

    pub fn with_input_source(mut self, source: InputSourceType) -> Self {
        self.input_source = Some(source);
        self
    }

    pub fn with_input_mapping(mut self, channel: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_mappings.insert(channel.into(), value.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Whether at least one method is bound on `channel`.
    pub fn binds_channel(&self, channel: &str) -> bool {
        self.methods
            .get(channel)
            .map(|methods| !methods.is_empty())
            .unwrap_or(false)
    }
}

/// A performance track: a slot, channel bindings and the modules it drives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Track {
    #[serde(deserialize_with = "lenient")]
    pub id: String,
    #[serde(deserialize_with = "lenient")]
    pub name: String,
    /// Slot in the global track tables that selects this track.
    #[serde(deserialize_with = "lenient_slot")]
    pub slot: Option<u32>,
    /// Channel number to channel slot.
    #[serde(deserialize_with = "lenient_slot_map")]
    pub channel_mappings: BTreeMap<String, u32>,
    #[serde(deserialize_with = "lenient_list")]
    pub modules: Vec<ModuleInstance>,
    /// Detection values set on the track itself. They win over the global
    /// ones while the track is active.
    #[serde(deserialize_with = "lenient")]
    pub detection: DetectionOverrides,
}

impl Track {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn map_channel(mut self, channel: impl Into<String>, slot: u32) -> Self {
        self.channel_mappings.insert(channel.into(), slot);
        self
    }

    pub fn with_module(mut self, module: ModuleInstance) -> Self {
        self.modules.push(module);
        self
    }

    /// Whether any module overrides the global input source.
    pub fn has_source_override(&self) -> bool {
        self.modules.iter().any(|module| module.input_source.is_some())
    }
}

/// The set of tracks currently loaded for performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceSet {
    #[serde(deserialize_with = "lenient")]
    pub id: String,
    #[serde(deserialize_with = "lenient")]
    pub name: String,
    #[serde(deserialize_with = "lenient_list")]
    pub tracks: Vec<Track>,
}

impl PerformanceSet {
    pub fn new(id: impl Into<String>, tracks: Vec<Track>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tracks,
        }
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn track(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == id)
    }

    pub fn track_by_name(&self, name: &str) -> Option<&Track> {
        self.tracks.iter().find(|track| track.name == name)
    }
}
