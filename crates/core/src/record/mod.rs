use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Configuration options for the recording subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordingSettings {
    /// Length stored with every recorded hit, in seconds.
    pub hit_duration_sec: f64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            hit_duration_sec: 0.1,
        }
    }
}

/// Recording state of one track, keyed by track id in the [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStateEntry {
    /// Clock time in milliseconds the take started at.
    pub start_time: f64,
    pub is_recording: bool,
}

/// A channel hit relative to the start of the take.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordedHit {
    /// Seconds since the take started.
    pub time: f64,
    pub duration: f64,
}

/// Append-only per-channel sequences of a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackRecording {
    pub channels: BTreeMap<String, Vec<RecordedHit>>,
}

impl TrackRecording {
    pub fn channel(&self, channel: &str) -> &[RecordedHit] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn hit_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}

/// Captures channel hits of active tracks into timestamped takes.
#[derive(Debug, Default)]
pub struct Recorder {
    settings: RecordingSettings,
    states: HashMap<String, RecordingStateEntry>,
    takes: HashMap<String, TrackRecording>,
}

impl Recorder {
    pub fn new(settings: RecordingSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// Starts a new take for `track_id` at `now_ms`. When the track was
    /// already recording its previous channel data is discarded first.
    /// Returns whether anything was discarded.
    pub fn start(&mut self, track_id: &str, now_ms: f64) -> bool {
        let was_recording = self.is_recording(track_id);
        if was_recording {
            if let Some(take) = self.takes.get_mut(track_id) {
                take.channels.clear();
            }
        }

        self.states.insert(
            track_id.to_string(),
            RecordingStateEntry {
                start_time: now_ms,
                is_recording: true,
            },
        );
        was_recording
    }

    pub fn stop(&mut self, track_id: &str) {
        if let Some(state) = self.states.get_mut(track_id) {
            state.is_recording = false;
        }
    }

    pub fn is_recording(&self, track_id: &str) -> bool {
        self.states
            .get(track_id)
            .map(|state| state.is_recording)
            .unwrap_or(false)
    }

    pub fn state(&self, track_id: &str) -> Option<&RecordingStateEntry> {
        self.states.get(track_id)
    }

    /// Appends a hit on `channel` when the track is recording.
    pub fn record_hit(&mut self, track_id: &str, channel: &str, now_ms: f64) -> Option<RecordedHit> {
        let state = self.states.get(track_id).filter(|state| state.is_recording)?;
        let hit = RecordedHit {
            time: ((now_ms - state.start_time) / 1000.0).max(0.0),
            duration: self.settings.hit_duration_sec,
        };

        self.takes
            .entry(track_id.to_string())
            .or_default()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(hit);
        Some(hit)
    }

    pub fn take(&self, track_id: &str) -> Option<&TrackRecording> {
        self.takes.get(track_id)
    }

    /// Drops state and takes of every track `keep` rejects.
    pub fn retain_tracks(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.states.retain(|track_id, _| keep(track_id));
        self.takes.retain(|track_id, _| keep(track_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_hits_relative_to_start() {
        let mut recorder = Recorder::default();
        assert!(recorder.record_hit("t", "1", 10.0).is_none());

        assert!(!recorder.start("t", 1_000.0));
        let hit = recorder.record_hit("t", "1", 1_250.0).unwrap();
        assert_eq!(hit.time, 0.25);
        assert_eq!(hit.duration, 0.1);
        recorder.record_hit("t", "2", 2_000.0);

        let take = recorder.take("t").unwrap();
        assert_eq!(take.channel("1").len(), 1);
        assert_eq!(take.channel("2")[0].time, 1.0);
        assert_eq!(take.hit_count(), 2);
    }

    #[test]
    fn restarting_a_recording_track_discards_its_take() {
        let mut recorder = Recorder::default();
        recorder.start("t", 0.0);
        recorder.record_hit("t", "1", 100.0);

        assert!(recorder.start("t", 500.0));
        assert_eq!(recorder.take("t").unwrap().hit_count(), 0);
        assert_eq!(recorder.state("t").unwrap().start_time, 500.0);

        recorder.record_hit("t", "1", 600.0);
        assert_eq!(recorder.take("t").unwrap().channel("1")[0].time, 0.1);
    }

    #[test]
    fn stopped_tracks_keep_their_take() {
        let mut recorder = Recorder::default();
        recorder.start("t", 0.0);
        recorder.record_hit("t", "4", 100.0);
        recorder.stop("t");

        assert!(recorder.record_hit("t", "4", 200.0).is_none());
        assert_eq!(recorder.take("t").unwrap().hit_count(), 1);
        assert!(!recorder.start("t", 300.0));
        assert_eq!(recorder.take("t").unwrap().hit_count(), 1);
    }

    #[test]
    fn retain_drops_departed_tracks() {
        let mut recorder = Recorder::default();
        recorder.start("stay", 0.0);
        recorder.start("gone", 0.0);
        recorder.record_hit("gone", "1", 50.0);

        recorder.retain_tracks(|track_id| track_id == "stay");
        assert!(recorder.state("gone").is_none());
        assert!(recorder.take("gone").is_none());
        assert!(recorder.is_recording("stay"));
    }
}
