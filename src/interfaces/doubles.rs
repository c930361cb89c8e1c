//! Deterministic collaborator doubles
//!
//! Scripted stand-ins for the audio source, VAD, ASR, LLM, and TTS used by
//! the scenario tests and available to downstream crates. Each one replays a
//! fixed script with no timing dependence, so a full conversation can run
//! without audio hardware or network access.

use super::{
    Asr, AudioSource, Llm, LlmRequest, SpeechEdge, TokenStream, Transcription, Vad, VadDecision,
};
use crate::engine::EventSink;
use crate::events::EventKind;
use crate::signals::{Signal, SignalBus};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Frame-sized sample source replaying scripted amplitude spans
pub struct ScriptedAudioSource {
    frames: VecDeque<Vec<f32>>,
}

impl ScriptedAudioSource {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    /// Append `count` frames of constant amplitude
    pub fn with_span(mut self, amplitude: f32, count: usize) -> Self {
        for _ in 0..count {
            self.frames.push_back(vec![amplitude; 512]);
        }
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl Default for ScriptedAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for ScriptedAudioSource {
    fn next_frame(&mut self) -> Option<Vec<f32>> {
        self.frames.pop_front()
    }
}

/// Amplitude-threshold VAD with no smoothing: edges fire on the raw flip
pub struct ThresholdVad {
    threshold: f32,
    speaking: bool,
}

impl ThresholdVad {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            speaking: false,
        }
    }
}

impl Vad for ThresholdVad {
    fn process_frame(&mut self, samples: &[f32]) -> VadDecision {
        let energy = if samples.is_empty() {
            0.0
        } else {
            (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
        };
        let is_speech = energy > self.threshold;
        let edge = if is_speech != self.speaking {
            self.speaking = is_speech;
            Some(if is_speech {
                SpeechEdge::Started
            } else {
                SpeechEdge::Stopped
            })
        } else {
            None
        };
        VadDecision { is_speech, edge }
    }

    fn reset(&mut self) {
        self.speaking = false;
    }
}

/// Recognizer replaying scripted partials and a fixed final transcript
pub struct ScriptedAsr {
    partials: VecDeque<String>,
    final_text: String,
    confidence: f32,
    fed_samples: usize,
    finalized: bool,
}

impl ScriptedAsr {
    pub fn new(final_text: impl Into<String>, confidence: f32) -> Self {
        Self {
            partials: VecDeque::new(),
            final_text: final_text.into(),
            confidence,
            fed_samples: 0,
            finalized: false,
        }
    }

    pub fn with_partials(mut self, partials: &[&str]) -> Self {
        self.partials = partials.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn fed_samples(&self) -> usize {
        self.fed_samples
    }
}

#[async_trait]
impl Asr for ScriptedAsr {
    async fn feed(&mut self, samples: &[f32]) -> Result<()> {
        if !self.finalized {
            self.fed_samples += samples.len();
        }
        Ok(())
    }

    async fn poll_partial(&mut self) -> Result<Option<String>> {
        Ok(self.partials.pop_front())
    }

    async fn finalize(&mut self) -> Result<Transcription> {
        self.finalized = true;
        Ok(Transcription {
            text: self.final_text.clone(),
            confidence: self.confidence,
        })
    }

    fn reset(&mut self) {
        self.fed_samples = 0;
        self.finalized = false;
    }
}

/// Recognizer whose finalize always fails, for error-path tests
pub struct FailingAsr;

#[async_trait]
impl Asr for FailingAsr {
    async fn feed(&mut self, _samples: &[f32]) -> Result<()> {
        Ok(())
    }

    async fn poll_partial(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn finalize(&mut self) -> Result<Transcription> {
        anyhow::bail!("recognizer offline")
    }

    fn reset(&mut self) {}
}

/// Streaming LLM replaying canned responses in order
///
/// Responses are re-chunked into small pieces so sentence segmentation sees
/// realistic token boundaries. Captured requests are kept for assertions.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<LlmRequest>>,
    chunk_bytes: usize,
}

impl ScriptedLlm {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
            chunk_bytes: 9,
        }
    }

    /// Requests the core issued, in order
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("llm double poisoned").clone()
    }
}

fn chunk_text(text: &str, target_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if current.len() >= target_bytes {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl Llm for ScriptedLlm {
    async fn stream(&self, request: LlmRequest) -> Result<TokenStream> {
        self.requests
            .lock()
            .expect("llm double poisoned")
            .push(request);
        let response = self
            .responses
            .lock()
            .expect("llm double poisoned")
            .pop_front()
            .unwrap_or_default();
        let chunks: Vec<Result<String>> = chunk_text(&response, self.chunk_bytes)
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// LLM whose stream fails immediately, for error-path tests
pub struct FailingLlm;

#[async_trait]
impl Llm for FailingLlm {
    async fn stream(&self, _request: LlmRequest) -> Result<TokenStream> {
        anyhow::bail!("model endpoint unreachable")
    }
}

/// TTS double reporting playback through the event sink synchronously
///
/// Each spoken sentence yields `TtsSentenceStarted`, `TtsSentenceFinished`,
/// and — with nothing left pending — `TtsQueueEmpty`. `stop` drops the queue
/// and reports `TtsQueueEmpty`, matching the cancellation contract.
pub struct ScriptedTts {
    sink: OnceLock<EventSink>,
    spoken: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl ScriptedTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sink: OnceLock::new(),
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    /// Sentences handed to the engine, in order
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().expect("tts double poisoned").clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl super::Tts for ScriptedTts {
    fn bind(&self, sink: EventSink) {
        let _ = self.sink.set(sink);
    }

    fn speak(&self, text: &str) {
        self.spoken
            .lock()
            .expect("tts double poisoned")
            .push(text.to_string());
        if let Some(sink) = self.sink.get() {
            sink.push(EventKind::TtsSentenceStarted);
            sink.push(EventKind::TtsSentenceFinished);
            sink.push(EventKind::TtsQueueEmpty);
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(sink) = self.sink.get() {
            sink.push(EventKind::TtsQueueEmpty);
        }
    }
}

/// Signal listener accumulating everything it hears
pub struct SignalRecorder {
    seen: Arc<Mutex<Vec<Signal>>>,
}

impl SignalRecorder {
    /// Register on the bus and return the recorder
    pub fn attach(bus: &SignalBus) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe_all(move |signal| {
            seen_clone
                .lock()
                .expect("signal recorder poisoned")
                .push(signal.clone());
        });
        Self { seen }
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.seen.lock().expect("signal recorder poisoned").clone()
    }

    pub fn named(&self, name: &str) -> Vec<Signal> {
        self.signals()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.named(name).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_scripted_audio_source_spans() {
        let mut source = ScriptedAudioSource::new()
            .with_span(0.0, 2)
            .with_span(0.5, 3);
        let mut frames = 0;
        while let Some(frame) = source.next_frame() {
            assert_eq!(frame.len(), 512);
            frames += 1;
        }
        assert_eq!(frames, 5);
    }

    #[test]
    fn test_threshold_vad_edges() {
        let mut vad = ThresholdVad::new(0.1);
        assert!(vad.process_frame(&[0.0; 512]).edge.is_none());
        assert_eq!(
            vad.process_frame(&[0.5; 512]).edge,
            Some(SpeechEdge::Started)
        );
        assert!(vad.process_frame(&[0.5; 512]).edge.is_none());
        assert_eq!(
            vad.process_frame(&[0.0; 512]).edge,
            Some(SpeechEdge::Stopped)
        );
    }

    #[tokio::test]
    async fn test_scripted_asr_replays_script() {
        let mut asr = ScriptedAsr::new("hello world", 0.9).with_partials(&["hel", "hello"]);
        asr.feed(&[0.0; 512]).await.unwrap();
        assert_eq!(asr.fed_samples(), 512);
        assert_eq!(asr.poll_partial().await.unwrap().as_deref(), Some("hel"));
        assert_eq!(asr.poll_partial().await.unwrap().as_deref(), Some("hello"));
        assert!(asr.poll_partial().await.unwrap().is_none());
        let result = asr.finalize().await.unwrap();
        assert_eq!(result.text, "hello world");
    }

    #[tokio::test]
    async fn test_scripted_llm_chunks_and_records() {
        let llm = ScriptedLlm::new(&["A short reply."]);
        let request = LlmRequest {
            system_prompt: "sys".to_string(),
            messages: Vec::new(),
            max_tokens: 64,
            temperature: 0.5,
        };
        let mut stream = llm.stream(request).await.unwrap();
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk.unwrap());
        }
        assert_eq!(text, "A short reply.");
        assert_eq!(llm.requests().len(), 1);
        assert_eq!(llm.requests()[0].max_tokens, 64);
    }

    #[test]
    fn test_chunk_text_respects_char_boundaries() {
        let chunks = chunk_text("héllo wörld…", 4);
        assert_eq!(chunks.concat(), "héllo wörld…");
    }
}
