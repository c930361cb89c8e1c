//! External collaborator interfaces
//!
//! The four capability sets the core drives — VAD, ASR, LLM, TTS — plus the
//! audio capture source. Each is a small trait so tests can substitute
//! deterministic doubles that enqueue scripted event sequences; audio
//! hardware is never required.

pub mod doubles;
pub mod energy_vad;

use crate::engine::EventSink;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Speech/silence boundary detected by the VAD's smoothed decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEdge {
    Started,
    Stopped,
}

/// Per-frame VAD output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    /// Raw decision for this frame
    pub is_speech: bool,
    /// Set when the smoothed decision flipped on this frame
    pub edge: Option<SpeechEdge>,
}

/// Voice activity detector, fed one capture frame at a time
pub trait Vad: Send {
    fn process_frame(&mut self, samples: &[f32]) -> VadDecision;
    fn reset(&mut self);
}

/// Mono float capture source at 16 kHz, 512-sample frames
pub trait AudioSource: Send {
    /// Next frame, or `None` when the source is exhausted
    fn next_frame(&mut self) -> Option<Vec<f32>>;
}

/// Final recognition result
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
}

/// Streaming speech recognizer
///
/// Partials may repeat; `finalize` is idempotent per turn.
#[async_trait]
pub trait Asr: Send {
    /// Feed capture samples for the current utterance
    async fn feed(&mut self, samples: &[f32]) -> Result<()>;
    /// Latest partial hypothesis, if a new one is available
    async fn poll_partial(&mut self) -> Result<Option<String>>;
    /// Close out the utterance and return the final transcript
    async fn finalize(&mut self) -> Result<Transcription>;
    /// Forget the current utterance
    fn reset(&mut self);
}

/// Recognizer handle shared between the audio producer and the turn pipeline
pub type SharedAsr = Arc<tokio::sync::Mutex<Box<dyn Asr>>>;

/// Prompt message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    User,
    Assistant,
}

/// One prior utterance rendered into the LLM prompt
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single completion request
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Opaque token chunks; sentence segmentation happens downstream
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Streaming large-language-model client
#[async_trait]
pub trait Llm: Send + Sync {
    async fn stream(&self, request: LlmRequest) -> Result<TokenStream>;
}

/// Text-to-speech player
///
/// The engine must deliver `TtsSentenceStarted` before audio emission,
/// `TtsSentenceFinished` after, and `TtsQueueEmpty` once nothing is pending.
/// On cancellation `TtsSentenceFinished` may be skipped but `TtsQueueEmpty`
/// must eventually arrive.
pub trait Tts: Send + Sync {
    /// Attach the event sink the engine's callbacks report through
    fn bind(&self, sink: EventSink);
    /// Enqueue one sentence for playback
    fn speak(&self, text: &str);
    /// Stop playback and drop any queued sentences. Idempotent.
    fn stop(&self);
}
