//! Event and Action value types
//!
//! Everything that crosses the turn-taking core's boundary is one of these
//! immutable values. Producers (audio, ASR poller, TTS callbacks, the turn
//! pipeline, external drivers) enqueue `Event`s; the reducer consumes them in
//! strict arrival order and emits `Action`s for the turn executor plus
//! `Signal`s for observers.

use crate::analytics::TurnRecord;
use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    /// The silence threshold elapsed
    Silence,
    /// The safety timeout force-ended the turn
    SafetyTimeout,
    /// The human speaking limit was exceeded before force-end
    LimitExceeded,
    /// Incoming human speech cut the AI off
    Interrupted,
    /// The turn pipeline failed
    Error,
}

impl TurnEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnEndReason::Silence => "silence",
            TurnEndReason::SafetyTimeout => "safety_timeout",
            TurnEndReason::LimitExceeded => "limit_exceeded",
            TurnEndReason::Interrupted => "interrupted",
            TurnEndReason::Error => "error",
        }
    }
}

/// Why the AI was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// Live speech while the AI held the floor
    HumanSpeech,
    /// Text injected by an external driver
    ExternalInput,
    /// Session shutdown
    Shutdown,
    /// Watchdog recovered a stalled turn pipeline
    Stalled,
}

impl InterruptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptReason::HumanSpeech => "human_speech",
            InterruptReason::ExternalInput => "external_input",
            InterruptReason::Shutdown => "shutdown",
            InterruptReason::Stalled => "stalled",
        }
    }
}

/// External driver commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    /// Drop audio frames until resumed; a turn in flight is left untouched
    Pause,
    Resume,
    /// Graceful shutdown
    Stop,
    /// Clear per-turn state; optionally reload the phase profile from its initial phase
    Reset { keep_profile: bool },
}

/// Latencies measured by the turn pipeline, merged into State on `ResetTurn`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TurnLatency {
    pub transcription_ms: f64,
    pub llm_ms: f64,
}

/// A timestamped event delivered to the reducer
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Milliseconds, stamped by the enqueueing side's clock
    pub at_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(at_ms: u64, kind: EventKind) -> Self {
        Self { at_ms, kind }
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// One 512-sample capture frame with the VAD's speech decision
    AudioFrame {
        samples: Arc<Vec<f32>>,
        is_speech: bool,
    },
    /// The VAD's smoothed decision flipped to speech
    VadSpeechStart,
    /// The VAD's smoothed decision flipped to silence
    VadSpeechStop,
    /// Incremental recognition hypothesis
    AsrPartial { text: String },
    /// Final recognition result for the turn being processed
    AsrFinal {
        text: String,
        confidence: f32,
        /// How long finalization took, reported by the recognizer
        elapsed_ms: f64,
    },
    /// One complete sentence of the AI response, signals block already stripped
    AiSentenceReady { text: String },
    /// No further sentences will arrive for this turn
    AiStreamComplete,
    TtsSentenceStarted,
    TtsSentenceFinished,
    TtsQueueEmpty,
    /// Periodic timer; timeouts are evaluated against `Event::at_ms`
    Tick,
    /// Move the conversation to another phase
    PhaseTransition { target: String },
    /// Force turn processing
    ProcessTurn,
    /// Finalize the identified turn; stale ids are ignored
    ResetTurn {
        turn_id: u64,
        reason: Option<TurnEndReason>,
        latency: Option<TurnLatency>,
    },
    /// UI-injected text that bypasses ASR
    ExternalText { text: String },
    Command(Command),
}

impl EventKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AudioFrame { .. } => "audio_frame",
            EventKind::VadSpeechStart => "vad_speech_start",
            EventKind::VadSpeechStop => "vad_speech_stop",
            EventKind::AsrPartial { .. } => "asr_partial",
            EventKind::AsrFinal { .. } => "asr_final",
            EventKind::AiSentenceReady { .. } => "ai_sentence_ready",
            EventKind::AiStreamComplete => "ai_stream_complete",
            EventKind::TtsSentenceStarted => "tts_sentence_started",
            EventKind::TtsSentenceFinished => "tts_sentence_finished",
            EventKind::TtsQueueEmpty => "tts_queue_empty",
            EventKind::Tick => "tick",
            EventKind::PhaseTransition { .. } => "phase_transition",
            EventKind::ProcessTurn => "process_turn",
            EventKind::ResetTurn { .. } => "reset_turn",
            EventKind::ExternalText { .. } => "external_text",
            EventKind::Command(_) => "command",
        }
    }
}

/// Everything the turn pipeline needs to process one turn, snapshotted by the
/// reducer so action handlers never touch State
#[derive(Debug, Clone)]
pub struct TurnJob {
    pub turn_id: u64,
    /// Raw samples accumulated for the human utterance; empty for AI-opened turns
    pub audio: Vec<f32>,
    /// Text injected by an external driver, bypassing ASR
    pub external_text: Option<String>,
    /// Fully resolved profile at the moment the turn ended
    pub profile: Arc<Profile>,
    pub phase_id: Option<String>,
    /// Per-phase context text for the LLM prompt
    pub phase_context: Option<String>,
    /// Context text shared by every phase
    pub global_context: Option<String>,
    pub started_at_ms: u64,
}

/// A side effect requested by the reducer, dispatched by the turn executor
#[derive(Debug, Clone)]
pub enum Action {
    /// Record a diagnostic; carries no other behavior
    Log { message: String },
    /// Hand one sentence to TTS
    SpeakSentence { text: String },
    /// Stop AI playback and cancel the in-flight generation
    InterruptAi { reason: InterruptReason },
    /// Remember an interjection phrase for the next LLM user message
    PlayAcknowledgment { text: String },
    /// Spawn the turn-processing pipeline
    ProcessTurn { job: TurnJob },
    /// Re-inject a `ResetTurn` event for the identified turn
    ResetTurn { turn_id: u64 },
    /// Append one analytics record and notify observers
    LogTurn { record: TurnRecord },
    /// Re-inject a `PhaseTransition` event so the reducer sees it in order
    TransitionPhase { target: String },
    /// Drop queued TTS sentences
    ClearSpeechQueue,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Log { .. } => "log",
            Action::SpeakSentence { .. } => "speak_sentence",
            Action::InterruptAi { .. } => "interrupt_ai",
            Action::PlayAcknowledgment { .. } => "play_acknowledgment",
            Action::ProcessTurn { .. } => "process_turn",
            Action::ResetTurn { .. } => "reset_turn",
            Action::LogTurn { .. } => "log_turn",
            Action::TransitionPhase { .. } => "transition_phase",
            Action::ClearSpeechQueue => "clear_speech_queue",
        }
    }
}
