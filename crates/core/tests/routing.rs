use std::{collections::BTreeSet, sync::Arc};

use serde_json::json;
use trigger_rig_core::{
    analysis::Band,
    config::{MappingConfig, MemorySettings},
    routing::{EventKind, FlashTarget, IgnoreReason},
    AppConfig, BandTrigger, ConfigResolver, EventRouter, InputEvent, InputSourceType, ManualClock,
    ModuleInstance, NoteMatchMode, PerformanceSet, PipelineKind, RouteOutcome, Track,
};

fn mappings(value: serde_json::Value) -> MappingConfig {
    serde_json::from_value(value).unwrap()
}

fn router(set: PerformanceSet, config: AppConfig) -> (EventRouter, ManualClock) {
    let clock = ManualClock::new();
    let router = EventRouter::new(set, &config, Arc::new(clock.clone()));
    (router, clock)
}

fn channels(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[test]
fn midi_note_resolves_through_pitch_class_slot() {
    let track = Track::new("t1", "Drums")
        .map_channel("5", 3)
        .with_module(ModuleInstance::new("kick", "sample").bind("5", "play"));
    let config = AppConfig {
        input_type: InputSourceType::Midi,
        mappings: mappings(json!({
            "channelMappings": { "midi": { "pitchClass": { "3": 91 % 12 } } }
        })),
        ..Default::default()
    };
    let (mut router, _) = router(PerformanceSet::new("set", vec![track]), config);
    router.activate_track("t1").unwrap();

    let report = router.route(&InputEvent::midi_note(EventKind::MethodTrigger, 91));
    assert_eq!(report.flashed_channels(), channels(&["5"]));
    assert_eq!(
        report.flashes[0].target,
        FlashTarget::Channel {
            track_id: "t1".into(),
            channel: "5".into()
        }
    );

    let miss = router.route(&InputEvent::midi_note(EventKind::MethodTrigger, 92));
    assert!(matches!(
        miss.outcome,
        RouteOutcome::Ignored {
            reason: IgnoreReason::NoMatch,
            ..
        }
    ));
}

#[test]
fn source_override_excludes_non_overriding_modules() {
    let track = Track::new("t1", "Keys")
        .map_channel("1", 1)
        .map_channel("2", 2)
        .with_module(
            ModuleInstance::new("a", "synth")
                .bind("1", "hit")
                .with_input_source(InputSourceType::Audio),
        )
        .with_module(ModuleInstance::new("b", "synth").bind("2", "hit"));
    let config = AppConfig {
        input_type: InputSourceType::Osc,
        mappings: mappings(json!({
            "channelMappings": {
                "audio": { "1": "low", "2": "low" },
                "osc": { "1": "low", "2": "low" }
            }
        })),
        ..Default::default()
    };
    let (mut router, _) = router(PerformanceSet::new("set", vec![track]), config);
    router.activate_track("t1").unwrap();

    let event = InputEvent::band_trigger(
        InputSourceType::Audio,
        BandTrigger {
            band: Band::Low,
            velocity: 0.9,
        },
    );
    assert_eq!(router.route(&event).flashed_channels(), channels(&["1"]));

    // Module b's effective source is osc, but an override exists on the
    // track, so it still only takes osc events.
    let mut osc = InputEvent::osc(EventKind::MethodTrigger, "/x");
    osc.data.channel_name = Some("low".into());
    assert_eq!(router.route(&osc).flashed_channels(), channels(&["2"]));
}

#[test]
fn without_overrides_only_the_global_type_matches() {
    let track = Track::new("t1", "Pads")
        .map_channel("1", 1)
        .with_module(ModuleInstance::new("a", "pad").bind("1", "hit"));
    let config = AppConfig {
        input_type: InputSourceType::Osc,
        mappings: mappings(json!({
            "channelMappings": { "audio": { "1": "low" }, "osc": { "1": "/pad" } }
        })),
        ..Default::default()
    };
    let (mut router, _) = router(PerformanceSet::new("set", vec![track]), config);
    router.activate_track("t1").unwrap();

    let audio = InputEvent::band_trigger(
        InputSourceType::Audio,
        BandTrigger {
            band: Band::Low,
            velocity: 1.0,
        },
    );
    assert!(router.route(&audio).flashed_channels().is_empty());
    assert_eq!(
        router
            .route(&InputEvent::osc(EventKind::MethodTrigger, "/pad"))
            .flashed_channels(),
        channels(&["1"])
    );
}

#[test]
fn reselecting_a_recording_track_clears_its_take() {
    let tracks = vec![
        Track::new("t1", "One")
            .with_slot(1)
            .map_channel("1", 1)
            .with_module(ModuleInstance::new("m1", "sample").bind("1", "play")),
        Track::new("t2", "Two").with_slot(2),
    ];
    let config = AppConfig {
        input_type: InputSourceType::Osc,
        mappings: mappings(json!({
            "trackMappings": { "osc": { "1": "/track/1", "2": "/track/2" } },
            "channelMappings": { "osc": { "1": "/hit" } }
        })),
        ..Default::default()
    };
    let (mut router, clock) = router(PerformanceSet::new("set", tracks), config);

    let selected = router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/1"));
    assert_eq!(selected.selected_track(), Some("t1"));
    assert_eq!(selected.flashes.len(), 1);

    clock.set(500.0);
    let hit = router.route(&InputEvent::osc(EventKind::MethodTrigger, "/hit"));
    assert!(matches!(hit.outcome, RouteOutcome::ChannelsTriggered { recorded: 1, .. }));
    let take = router.recording("t1").unwrap();
    assert_eq!(take.channel("1")[0].time, 0.5);
    assert_eq!(take.channel("1")[0].duration, 0.1);

    router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/2"));
    assert_eq!(router.active_track().map(|t| t.id.as_str()), Some("t2"));

    clock.set(2_000.0);
    let back = router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/1"));
    assert!(matches!(
        back.outcome,
        RouteOutcome::TrackSelected {
            discarded_take: true,
            ..
        }
    ));
    assert_eq!(router.recording("t1").unwrap().hit_count(), 0);
    assert_eq!(router.recording_state("t1").unwrap().start_time, 2_000.0);

    clock.set(2_250.0);
    router.route(&InputEvent::osc(EventKind::MethodTrigger, "/hit"));
    assert_eq!(router.recording("t1").unwrap().channel("1")[0].time, 0.25);
}

#[test]
fn ndjson_events_route_defensively() {
    let config = AppConfig {
        mappings: mappings(json!({
            "trackMappings": { "midi": { "pitchClass": { "1": 0 } } }
        })),
        ..Default::default()
    };
    let set = PerformanceSet::new("set", vec![Track::new("t1", "One").with_slot(1)]);
    let (mut router, _) = router(set, config);

    let lines = [
        r#"{"type":"track-selection","source":"midi","data":{"note":48}}"#,
        r#"{"type":"mystery","source":"midi","data":{"note":48}}"#,
        r#"{"type":"method-trigger","source":"carrier-pigeon"}"#,
    ];
    let reports: Vec<_> = lines
        .iter()
        .map(|line| router.route(&serde_json::from_str::<InputEvent>(line).unwrap()))
        .collect();

    assert_eq!(reports[0].selected_track(), Some("t1"));
    assert!(matches!(
        reports[1].outcome,
        RouteOutcome::Ignored {
            reason: IgnoreReason::UnknownType,
            ..
        }
    ));
    assert!(matches!(
        reports[2].outcome,
        RouteOutcome::Ignored {
            reason: IgnoreReason::UnknownSource,
            ..
        }
    ));
    assert_eq!(
        router.last_event(InputSourceType::Midi).map(|e| e.kind),
        Some(EventKind::Unknown)
    );

    let json = serde_json::to_value(&reports[0]).unwrap();
    assert_eq!(json["outcome"]["outcome"], "trackSelected");
    assert_eq!(json["outcome"]["trackId"], "t1");
}

fn is_no_match(report: &trigger_rig_core::RouteReport) -> bool {
    matches!(
        report.outcome,
        RouteOutcome::Ignored {
            reason: IgnoreReason::NoMatch,
            ..
        }
    )
}

fn osc_tracks_config() -> AppConfig {
    AppConfig {
        input_type: InputSourceType::Osc,
        mappings: mappings(json!({
            "trackMappings": { "osc": { "1": "/track/1", "2": "/track/2" } },
            "channelMappings": { "osc": { "1": "/hit" } }
        })),
        ..Default::default()
    }
}

#[test]
fn replacing_the_set_rebuilds_maps_and_drops_departed_tracks() {
    let tracks = vec![
        Track::new("t1", "One")
            .with_slot(1)
            .map_channel("1", 1)
            .with_module(ModuleInstance::new("m1", "sample").bind("1", "play")),
        Track::new("t2", "Two").with_slot(2),
    ];
    let (mut router, _) = router(PerformanceSet::new("set", tracks), osc_tracks_config());
    router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/1"));
    router.route(&InputEvent::osc(EventKind::MethodTrigger, "/hit"));
    assert_eq!(router.recording("t1").unwrap().hit_count(), 1);

    router.set_active_set(PerformanceSet::new(
        "next",
        vec![Track::new("t2", "Two").with_slot(2)],
    ));
    assert!(router.active_track().is_none());
    assert!(router.recording("t1").is_none());
    assert!(router.recording_state("t1").is_none());

    let old = router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/1"));
    assert!(is_no_match(&old));
    let hit = router.route(&InputEvent::osc(EventKind::MethodTrigger, "/hit"));
    assert!(matches!(
        hit.outcome,
        RouteOutcome::Ignored {
            reason: IgnoreReason::NoActiveTrack,
            ..
        }
    ));
    let kept = router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/2"));
    assert_eq!(kept.selected_track(), Some("t2"));
}

#[test]
fn switching_note_match_mode_uses_the_exact_note_table() {
    let config = AppConfig {
        mappings: mappings(json!({
            "trackMappings": {
                "midi": { "pitchClass": { "1": 0 }, "exactNote": { "1": 62 } }
            }
        })),
        ..Default::default()
    };
    let set = PerformanceSet::new("set", vec![Track::new("t1", "One").with_slot(1)]);
    let (mut router, _) = router(set, config);

    let by_class = router.route(&InputEvent::midi_note(EventKind::TrackSelection, 48));
    assert_eq!(by_class.selected_track(), Some("t1"));

    router.set_note_match_mode(NoteMatchMode::ExactNote);
    assert!(is_no_match(&router.route(&InputEvent::midi_note(EventKind::TrackSelection, 48))));
    let exact = router.route(&InputEvent::midi_note(EventKind::TrackSelection, 62));
    assert_eq!(exact.selected_track(), Some("t1"));
}

#[test]
fn input_type_and_mapping_changes_take_effect_immediately() {
    let track = Track::new("t1", "One")
        .map_channel("1", 1)
        .with_module(ModuleInstance::new("m1", "sample").bind("1", "play"));
    let (mut router, _) = router(PerformanceSet::new("set", vec![track]), osc_tracks_config());
    router.activate_track("t1").unwrap();

    let low = InputEvent::band_trigger(
        InputSourceType::Audio,
        BandTrigger {
            band: Band::Low,
            velocity: 0.8,
        },
    );
    assert!(router.route(&low).flashed_channels().is_empty());

    router.set_input_type(InputSourceType::Audio);
    assert!(router.route(&low).flashed_channels().is_empty());

    router.set_mapping_config(mappings(json!({
        "channelMappings": { "audio": { "1": "low" } }
    })));
    assert_eq!(router.route(&low).flashed_channels(), channels(&["1"]));
    assert!(router
        .route(&InputEvent::osc(EventKind::MethodTrigger, "/hit"))
        .flashed_channels()
        .is_empty());
}

#[test]
fn active_track_detection_wins_over_persisted_settings() {
    let mut loud = Track::new("t1", "Loud").with_slot(1);
    loud.detection.threshold = Some(0.9);
    let quiet = Track::new("t2", "Quiet").with_slot(2);
    let (mut router, _) = router(
        PerformanceSet::new("set", vec![loud, quiet]),
        osc_tracks_config(),
    );
    let resolver = ConfigResolver::new(Arc::new(
        MemorySettings::new().with("audio.threshold", 0.3),
    ));
    let global = osc_tracks_config().detection;

    router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/1"));
    let params = resolver.track_detection(PipelineKind::Live, router.active_track(), &global);
    assert_eq!(params.threshold, 0.9);

    router.route(&InputEvent::osc(EventKind::TrackSelection, "/track/2"));
    let params = resolver.track_detection(PipelineKind::Live, router.active_track(), &global);
    assert_eq!(params.threshold, 0.3);
}
