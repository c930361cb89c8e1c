//! End-to-end sessions over scripted collaborators
//!
//! Full engine runs: scripted audio through the VAD and recognizer doubles,
//! a canned streaming LLM, and a synchronous TTS double reporting playback
//! through the event sink. No audio hardware, no network, manual clock.

use std::sync::Arc;
use std::time::Duration;
use voiceloop::engine::{AudioProducerConfig, Collaborators, Engine, EngineConfig, ProfileSource};
use voiceloop::interfaces::doubles::{
    FailingLlm, ScriptedAsr, ScriptedAudioSource, ScriptedLlm, ScriptedTts, SignalRecorder,
    ThresholdVad,
};
use voiceloop::profile::{Phase, PhaseProfile, PhaseTransitionRule, Profile, Speaker};
use voiceloop::{Authority, Clock, TurnEndReason};

fn unpaced_audio(trailing_ticks: u64) -> AudioProducerConfig {
    AudioProducerConfig {
        realtime: false,
        trailing_ticks,
        ..Default::default()
    }
}

fn base_config(profile: ProfileSource) -> EngineConfig {
    let mut config = EngineConfig::new(profile);
    config.clock = Some(Clock::manual());
    config.queue_capacity = 4096;
    config.rng_seed = Some(3);
    config.audio = unpaced_audio(20);
    config
}

async fn wait_for_records(engine: &Engine, count: usize) {
    for _ in 0..500 {
        if engine.analytics().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {} analytics records, have {}",
        count,
        engine.analytics().len()
    );
}

#[tokio::test]
async fn test_full_voice_turn_end_to_end() {
    let profile = Profile {
        end_ms: 600,
        safety_timeout_ms: 5000,
        ..Default::default()
    };
    let tts = ScriptedTts::new();
    let engine = Engine::new(
        base_config(ProfileSource::Single(profile)),
        Collaborators {
            source: Some(Box::new(
                ScriptedAudioSource::new()
                    .with_span(0.0, 5)
                    .with_span(0.5, 20)
                    .with_span(0.0, 25),
            )),
            vad: Some(Box::new(ThresholdVad::new(0.1))),
            asr: Box::new(ScriptedAsr::new("what is the weather", 0.94).with_partials(&["what"])),
            llm: Arc::new(ScriptedLlm::new(&["Hello! How can I help?"])),
            tts: tts.clone(),
        },
    )
    .unwrap();
    let recorder = SignalRecorder::attach(engine.bus());

    engine.start().unwrap();
    engine.join_producer().await;
    wait_for_records(&engine, 1).await;
    engine.stop().await;

    let records = engine.analytics().records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.end_reason, TurnEndReason::Silence);
    assert_eq!(record.human_transcript, "what is the weather");
    assert!(record.ai_transcript.contains("Hello!"));
    assert!((record.confidence_score_at_cutoff - 0.94).abs() < 1e-6);

    assert_eq!(
        tts.spoken(),
        vec!["Hello!".to_string(), "How can I help?".to_string()]
    );

    // Memory holds both sides of the exchange, human first.
    let items = engine.memory_items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].speaker, Speaker::Human);
    assert_eq!(items[0].text, "what is the weather");
    assert_eq!(items[1].speaker, Speaker::Ai);

    assert_eq!(recorder.count("llm.generation_start"), 1);
    assert_eq!(recorder.count("llm.generation_complete"), 1);
    assert_eq!(recorder.count("analytics.turn_metrics_updated"), 1);
}

#[tokio::test]
async fn test_text_injection_session() {
    let tts = ScriptedTts::new();
    let mut config = base_config(ProfileSource::Single(Profile::default()));
    config.audio = unpaced_audio(0);
    let engine = Engine::new(
        config,
        Collaborators {
            source: None,
            vad: None,
            asr: Box::new(ScriptedAsr::new("", 0.0)),
            llm: Arc::new(ScriptedLlm::new(&["Typed input works too."])),
            tts: tts.clone(),
        },
    )
    .unwrap();

    engine.start().unwrap();
    engine.inject_text("no microphone here");
    wait_for_records(&engine, 1).await;
    engine.stop().await;

    let record = &engine.analytics().records()[0];
    assert_eq!(record.human_transcript, "no microphone here");
    assert_eq!(tts.spoken(), vec!["Typed input works too.".to_string()]);
}

/// S6: a signal block moves the conversation to the next phase, and the new
/// phase opens on the AI side
#[tokio::test]
async fn test_phase_transition_session() {
    let phase = |id: &str, speaker: Speaker| Phase {
        id: id.to_string(),
        profile: Profile {
            id: id.to_string(),
            initial_speaker: speaker,
            ..Default::default()
        },
        context: Some(format!("You are in the {} phase.", id)),
    };
    let phases = PhaseProfile {
        phases: vec![
            phase("greeting", Speaker::Human),
            phase("part1", Speaker::Ai),
        ],
        transitions: vec![PhaseTransitionRule {
            from: "greeting".to_string(),
            to: "part1".to_string(),
            trigger_signals: vec!["custom.exam.greeting_complete".to_string()],
            require_all: false,
        }],
        initial_phase: "greeting".to_string(),
        global_context: None,
    };

    let tts = ScriptedTts::new();
    let mut config = base_config(ProfileSource::Phased(phases));
    config.audio = unpaced_audio(0);
    let engine = Engine::new(
        config,
        Collaborators {
            source: None,
            vad: None,
            asr: Box::new(ScriptedAsr::new("", 0.0)),
            llm: Arc::new(ScriptedLlm::new(&[
                "Welcome. <signals>{\"exam.greeting_complete\": {}}</signals>",
                "Let us begin part one.",
            ])),
            tts: tts.clone(),
        },
    )
    .unwrap();
    let recorder = SignalRecorder::attach(engine.bus());

    engine.start().unwrap();
    engine.inject_text("hi");
    // The greeting turn plus the AI-opened part1 turn.
    wait_for_records(&engine, 2).await;
    engine.stop().await;

    assert_eq!(recorder.count("custom.exam.greeting_complete"), 1);

    let records = engine.analytics().records();
    assert_eq!(records[0].phase_id.as_deref(), Some("greeting"));
    assert_eq!(records[1].phase_id.as_deref(), Some("part1"));
    // The signal block never reached TTS.
    assert_eq!(
        tts.spoken(),
        vec![
            "Welcome.".to_string(),
            "Let us begin part one.".to_string()
        ]
    );
}

#[tokio::test]
async fn test_llm_failure_ends_turn_with_error() {
    let mut config = base_config(ProfileSource::Single(Profile::default()));
    config.audio = unpaced_audio(0);
    let engine = Engine::new(
        config,
        Collaborators {
            source: None,
            vad: None,
            asr: Box::new(ScriptedAsr::new("", 0.0)),
            llm: Arc::new(FailingLlm),
            tts: ScriptedTts::new(),
        },
    )
    .unwrap();
    let recorder = SignalRecorder::attach(engine.bus());

    engine.start().unwrap();
    engine.inject_text("does this work");
    wait_for_records(&engine, 1).await;
    engine.stop().await;

    assert_eq!(recorder.count("llm.generation_error"), 1);
    let record = &engine.analytics().records()[0];
    assert_eq!(record.end_reason, TurnEndReason::Error);
}

#[tokio::test]
async fn test_analytics_written_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("turns.jsonl");
    let mut config = base_config(ProfileSource::Single(Profile::default()));
    config.audio = unpaced_audio(0);
    config.analytics_path = Some(path.clone());
    let engine = Engine::new(
        config,
        Collaborators {
            source: None,
            vad: None,
            asr: Box::new(ScriptedAsr::new("", 0.0)),
            llm: Arc::new(ScriptedLlm::new(&["First answer.", "Second answer."])),
            tts: ScriptedTts::new(),
        },
    )
    .unwrap();

    engine.start().unwrap();
    engine.inject_text("first question");
    wait_for_records(&engine, 1).await;
    engine.inject_text("second question");
    wait_for_records(&engine, 2).await;
    engine.stop().await;

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: voiceloop::TurnRecord = serde_json::from_str(lines[0]).unwrap();
    let second: voiceloop::TurnRecord = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(first.turn_id, 0);
    assert_eq!(second.turn_id, 1);
    assert!(second.timestamp >= first.timestamp);
}

#[tokio::test]
async fn test_reset_clears_memory_between_turns() {
    let mut config = base_config(ProfileSource::Single(Profile::default()));
    config.audio = unpaced_audio(0);
    let engine = Engine::new(
        config,
        Collaborators {
            source: None,
            vad: None,
            asr: Box::new(ScriptedAsr::new("", 0.0)),
            llm: Arc::new(ScriptedLlm::new(&["Answer one.", "Answer two."])),
            tts: ScriptedTts::new(),
        },
    )
    .unwrap();

    engine.start().unwrap();
    engine.inject_text("remember this");
    wait_for_records(&engine, 1).await;
    assert!(!engine.memory_items().is_empty());

    engine.reset(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.memory_items().is_empty());

    engine.inject_text("fresh start");
    wait_for_records(&engine, 2).await;
    engine.stop().await;
}

#[tokio::test]
async fn test_ai_authority_session_has_no_interruptions() {
    let profile = Profile {
        end_ms: 600,
        safety_timeout_ms: 5000,
        authority: Authority::Ai,
        ..Default::default()
    };
    let engine = Engine::new(
        base_config(ProfileSource::Single(profile)),
        Collaborators {
            source: Some(Box::new(
                ScriptedAudioSource::new()
                    .with_span(0.5, 15)
                    .with_span(0.0, 25),
            )),
            vad: Some(Box::new(ThresholdVad::new(0.1))),
            asr: Box::new(ScriptedAsr::new("tell me a story", 0.9)),
            llm: Arc::new(ScriptedLlm::new(&["Once upon a time."])),
            tts: ScriptedTts::new(),
        },
    )
    .unwrap();
    let recorder = SignalRecorder::attach(engine.bus());

    engine.start().unwrap();
    engine.join_producer().await;
    wait_for_records(&engine, 1).await;
    engine.stop().await;

    assert_eq!(recorder.count("conversation.interrupted"), 0);
    let record = &engine.analytics().records()[0];
    assert_eq!(record.interrupts_accepted, 0);
}
