//! Turn executor
//!
//! Consumes Actions from the event loop and drives the side-effecting
//! collaborators. The turn-processing pipeline runs as a cancellable
//! background task — ASR finalization, prompt building, LLM streaming with
//! incremental sentence segmentation, and the hand-off to the phase
//! controller — and talks back to the core only by enqueueing Events.

use crate::analytics::AnalyticsLog;
use crate::engine::EventSink;
use crate::events::{Action, EventKind, TurnEndReason, TurnJob, TurnLatency};
use crate::interfaces::{Llm, LlmRequest, PromptMessage, SharedAsr, Tts};
use crate::memory::ConversationMemory;
use crate::phase::PhaseController;
use crate::profile::Speaker;
use crate::reducer::is_speakable;
use crate::sentence::SentenceSegmenter;
use crate::signals::{names, Signal, SignalBus, SignalContext};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Spoken-register system prompt; profiles layer their instructions on top
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant in a real-time voice conversation. \
Keep responses concise and conversational - aim for one to three sentences unless asked for detail. \
Do not use markdown, bullet points, or code blocks; your words will be spoken aloud.";

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    cancelled: bool,
    stream_complete: bool,
    drained: bool,
}

/// Per-turn completion gate
///
/// The pipeline parks here after streaming: it wakes when the TTS queue
/// drains after stream completion, or when an interruption cancels the turn.
pub struct TurnGate {
    tx: watch::Sender<GateState>,
}

impl TurnGate {
    fn new() -> Self {
        let (tx, _) = watch::channel(GateState::default());
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_modify(|s| s.cancelled = true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().cancelled
    }

    fn note_stream_complete(&self, already_drained: bool) {
        self.tx.send_modify(|s| {
            s.stream_complete = true;
            if already_drained {
                s.drained = true;
            }
        });
    }

    fn note_drained(&self) {
        self.tx.send_modify(|s| {
            if s.stream_complete {
                s.drained = true;
            }
        });
    }

    /// Wait for drain or cancellation; returns true when cancelled
    async fn wait_done(&self) -> bool {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|s| s.cancelled || s.drained).await {
            Ok(state) => state.cancelled,
            Err(_) => true,
        };
        result
    }
}

struct ActiveTurn {
    turn_id: u64,
    gate: Arc<TurnGate>,
    handle: tokio::task::JoinHandle<()>,
}

/// Wiring for [`TurnExecutor::new`]
pub struct ExecutorParts {
    pub sink: EventSink,
    pub bus: Arc<SignalBus>,
    pub memory: Arc<Mutex<ConversationMemory>>,
    pub analytics: Arc<AnalyticsLog>,
    pub phase: Option<Arc<PhaseController>>,
    pub asr: SharedAsr,
    pub llm: Arc<dyn Llm>,
    pub tts: Arc<dyn Tts>,
    /// Overrides the built-in conversational system prompt
    pub system_prompt: Option<String>,
    /// How many memory items flow into each prompt
    pub memory_window: usize,
}

/// Dispatches reducer Actions to the collaborators
pub struct TurnExecutor {
    sink: EventSink,
    bus: Arc<SignalBus>,
    memory: Arc<Mutex<ConversationMemory>>,
    analytics: Arc<AnalyticsLog>,
    phase: Option<Arc<PhaseController>>,
    asr: SharedAsr,
    llm: Arc<dyn Llm>,
    tts: Arc<dyn Tts>,
    pending_ack: Arc<Mutex<Option<String>>>,
    current: Mutex<Option<ActiveTurn>>,
    system_prompt: String,
    memory_window: usize,
}

impl TurnExecutor {
    pub fn new(parts: ExecutorParts) -> Self {
        Self {
            sink: parts.sink,
            bus: parts.bus,
            memory: parts.memory,
            analytics: parts.analytics,
            phase: parts.phase,
            asr: parts.asr,
            llm: parts.llm,
            tts: parts.tts,
            pending_ack: Arc::new(Mutex::new(None)),
            current: Mutex::new(None),
            system_prompt: parts
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            memory_window: parts.memory_window.max(1),
        }
    }

    /// Handle one Action synchronously; background work is spawned, not awaited
    pub fn dispatch(&self, action: Action) -> Result<()> {
        match action {
            Action::Log { message } => info!("{}", message),
            Action::SpeakSentence { text } => self.tts.speak(&text),
            Action::InterruptAi { reason } => {
                debug!(reason = reason.as_str(), "Stopping AI output");
                self.tts.stop();
                if let Some(turn) = self.current.lock().expect("executor poisoned").as_ref() {
                    turn.gate.cancel();
                }
            }
            Action::ClearSpeechQueue => self.tts.stop(),
            Action::PlayAcknowledgment { text } => {
                // Prompt-prepend policy: the phrase reaches the LLM context
                // for the next AI turn rather than being spoken over the user.
                *self.pending_ack.lock().expect("executor poisoned") = Some(text);
            }
            Action::ProcessTurn { job } => self.spawn_turn(job),
            Action::ResetTurn { turn_id } => self.sink.push(EventKind::ResetTurn {
                turn_id,
                reason: None,
                latency: None,
            }),
            Action::TransitionPhase { target } => {
                self.sink.push(EventKind::PhaseTransition { target })
            }
            Action::LogTurn { record } => {
                let turn_id = record.turn_id;
                self.analytics
                    .append(record)
                    .context("Failed to append turn record")?;
                self.bus.emit(
                    &Signal::new(
                        names::ANALYTICS_TURN_METRICS_UPDATED,
                        json!({ "turn_id": turn_id, "turns_logged": self.analytics.len() }),
                    )
                    .with_context(SignalContext {
                        turn_id,
                        phase_id: None,
                        at_ms: self.sink.clock().now_ms(),
                    }),
                );
            }
        }
        Ok(())
    }

    /// The event loop saw `TtsQueueEmpty`
    pub fn note_queue_drained(&self) {
        if let Some(turn) = self.current.lock().expect("executor poisoned").as_ref() {
            turn.gate.note_drained();
        }
    }

    /// The event loop reduced `AiStreamComplete`; `already_drained` reflects
    /// whether the speech queue was empty at that point
    pub fn note_stream_complete(&self, already_drained: bool) {
        if let Some(turn) = self.current.lock().expect("executor poisoned").as_ref() {
            turn.gate.note_stream_complete(already_drained);
        }
    }

    /// Cancel whatever pipeline is in flight
    pub fn cancel_current(&self) {
        if let Some(turn) = self.current.lock().expect("executor poisoned").as_ref() {
            turn.gate.cancel();
        }
        self.tts.stop();
    }

    /// Cancel and wait out the in-flight pipeline
    pub async fn shutdown(&self) {
        let turn = self.current.lock().expect("executor poisoned").take();
        if let Some(turn) = turn {
            turn.gate.cancel();
            self.tts.stop();
            let _ = turn.handle.await;
        }
    }

    fn spawn_turn(&self, job: TurnJob) {
        let mut current = self.current.lock().expect("executor poisoned");
        if let Some(previous) = current.take() {
            if !previous.handle.is_finished() {
                warn!(turn = previous.turn_id, "Replacing unfinished turn pipeline");
                previous.gate.cancel();
            }
        }

        let gate = Arc::new(TurnGate::new());
        let pipeline = TurnPipeline {
            sink: self.sink.clone(),
            bus: self.bus.clone(),
            memory: self.memory.clone(),
            phase: self.phase.clone(),
            asr: self.asr.clone(),
            llm: self.llm.clone(),
            pending_ack: self.pending_ack.clone(),
            system_prompt: self.system_prompt.clone(),
            memory_window: self.memory_window,
            gate: gate.clone(),
        };
        let turn_id = job.turn_id;
        let handle = tokio::spawn(pipeline.run(job));
        *current = Some(ActiveTurn {
            turn_id,
            gate,
            handle,
        });
    }
}

/// One background turn-processing task
struct TurnPipeline {
    sink: EventSink,
    bus: Arc<SignalBus>,
    memory: Arc<Mutex<ConversationMemory>>,
    phase: Option<Arc<PhaseController>>,
    asr: SharedAsr,
    llm: Arc<dyn Llm>,
    pending_ack: Arc<Mutex<Option<String>>>,
    system_prompt: String,
    memory_window: usize,
    gate: Arc<TurnGate>,
}

impl TurnPipeline {
    async fn run(self, job: TurnJob) {
        let turn_id = job.turn_id;
        let mut latency = TurnLatency::default();

        // 1. Transcript: injected text wins, otherwise finalize the recognizer.
        let human_text = if let Some(text) = job.external_text.clone() {
            Some(text)
        } else if !job.audio.is_empty() {
            let started = Instant::now();
            let result = {
                let mut asr = self.asr.lock().await;
                match asr.feed(&job.audio).await {
                    Ok(()) => asr.finalize().await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(transcription) => {
                    latency.transcription_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.sink.push(EventKind::AsrFinal {
                        text: transcription.text.clone(),
                        confidence: transcription.confidence,
                        elapsed_ms: latency.transcription_ms,
                    });
                    if transcription.text.trim().is_empty() {
                        debug!(turn = turn_id, "Empty transcription, closing turn");
                        self.finish(turn_id, None, latency);
                        return;
                    }
                    Some(transcription.text)
                }
                Err(e) => {
                    self.fail(turn_id, latency, "transcription", e);
                    return;
                }
            }
        } else {
            // AI-opened turn (phase start): no human input this round.
            None
        };

        // 2. A speaking-limit acknowledgment prepends to the user message.
        let ack = self.pending_ack.lock().expect("executor poisoned").take();
        let user_text = match (human_text, ack) {
            (Some(text), Some(ack)) => Some(format!("{} {}", ack, text)),
            (Some(text), None) => Some(text),
            (None, Some(ack)) => Some(ack),
            (None, None) => None,
        };

        // 3. Remember the human utterance.
        if let Some(text) = &user_text {
            self.memory
                .lock()
                .expect("memory poisoned")
                .push(Speaker::Human, text.clone());
        }

        // 4. + 5. Prompt, then stream with incremental segmentation.
        let request = self.build_request(&job);
        self.emit_signal(
            turn_id,
            &job,
            names::LLM_GENERATION_START,
            json!({ "turn_id": turn_id }),
        );

        let llm_started = Instant::now();
        let mut stream = match self.llm.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(turn_id, latency, "generation", e);
                return;
            }
        };

        let mut segmenter = SentenceSegmenter::new();
        let mut tokens: u64 = 0;
        let mut spoken: Vec<String> = Vec::new();
        let mut cancelled = self.gate.is_cancelled();
        let mut stream_error = None;
        while !cancelled {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    tokens += 1;
                    for sentence in segmenter.push(&chunk) {
                        self.emit_sentence(sentence, &mut spoken);
                    }
                }
                Some(Err(e)) => {
                    stream_error = Some(e);
                    break;
                }
                None => break,
            }
            cancelled = self.gate.is_cancelled();
        }
        latency.llm_ms = llm_started.elapsed().as_secs_f64() * 1000.0;

        if let Some(e) = stream_error {
            self.fail(turn_id, latency, "generation", e);
            return;
        }

        if cancelled {
            // Cooperative abort at the token boundary; what was already heard
            // still belongs to the record of the conversation.
            if !spoken.is_empty() {
                self.memory
                    .lock()
                    .expect("memory poisoned")
                    .push(Speaker::Ai, spoken.join(" "));
            }
            self.finish(turn_id, Some(TurnEndReason::Interrupted), latency);
            return;
        }

        for sentence in segmenter.finish() {
            self.emit_sentence(sentence, &mut spoken);
        }

        // 6. Close out the stream.
        self.emit_signal(
            turn_id,
            &job,
            names::LLM_GENERATION_COMPLETE,
            json!({ "turn_id": turn_id, "tokens_generated": tokens }),
        );
        self.sink.push(EventKind::AiStreamComplete);
        if !spoken.is_empty() {
            self.memory
                .lock()
                .expect("memory poisoned")
                .push(Speaker::Ai, spoken.join(" "));
        }

        let transition = if let Some(controller) = &self.phase {
            let outcome = controller.handle_response(
                segmenter.raw_text(),
                turn_id,
                self.sink.clock().now_ms(),
            );
            for signal in outcome.signals {
                self.bus.emit(&signal);
            }
            outcome.transition
        } else {
            None
        };

        // 7. Wait for playback to drain, or for an interruption.
        let cancelled = if spoken.is_empty() {
            self.gate.is_cancelled()
        } else {
            self.gate.wait_done().await
        };
        let reason = cancelled.then_some(TurnEndReason::Interrupted);
        self.finish(turn_id, reason, latency);

        // The transition enters the queue behind this turn's ResetTurn, so
        // the reducer opens the next phase on a clean turn.
        if let Some(target) = transition {
            if !cancelled {
                self.sink.push(EventKind::PhaseTransition { target });
            }
        }
    }

    fn emit_sentence(&self, sentence: String, spoken: &mut Vec<String>) {
        // Mirror the reducer's validity filter so the completion gate only
        // counts sentences that will actually reach TTS.
        if !is_speakable(&sentence) {
            return;
        }
        spoken.push(sentence.clone());
        self.sink.push(EventKind::AiSentenceReady { text: sentence });
    }

    fn emit_signal(&self, turn_id: u64, job: &TurnJob, name: &str, payload: serde_json::Value) {
        self.bus
            .emit(&Signal::new(name, payload).with_context(SignalContext {
                turn_id,
                phase_id: job.phase_id.clone(),
                at_ms: self.sink.clock().now_ms(),
            }));
    }

    fn finish(&self, turn_id: u64, reason: Option<TurnEndReason>, latency: TurnLatency) {
        self.sink.push(EventKind::ResetTurn {
            turn_id,
            reason,
            latency: Some(latency),
        });
    }

    fn fail(&self, turn_id: u64, latency: TurnLatency, stage: &str, error: anyhow::Error) {
        warn!(turn = turn_id, stage, "Turn pipeline failed: {:#}", error);
        self.bus.emit(&Signal::new(
            names::LLM_GENERATION_ERROR,
            json!({
                "turn_id": turn_id,
                "stage": stage,
                "error": error.to_string(),
            }),
        ));
        self.sink.push(EventKind::ResetTurn {
            turn_id,
            reason: Some(TurnEndReason::Error),
            latency: Some(latency),
        });
    }

    fn build_request(&self, job: &TurnJob) -> LlmRequest {
        let profile = &job.profile;
        let mut system = self.system_prompt.clone();

        if !profile.signals.is_empty() {
            system.push_str(
                "\n\nWhen one of the following observations applies, append a block of the form \
                 <signals>{\"name\": {\"confidence\": 0.9}}</signals> after your reply:",
            );
            for (name, description) in &profile.signals {
                system.push_str(&format!("\n- {}: {}", name, description));
            }
        }
        if let Some(context) = &job.global_context {
            system.push_str("\n\n");
            system.push_str(context);
        }
        if let Some(context) = &job.phase_context {
            system.push_str("\n\n");
            system.push_str(context);
        }
        if !profile.instructions.is_empty() {
            system.push_str("\n\n");
            system.push_str(&profile.instructions);
        }

        let messages: Vec<PromptMessage> = self
            .memory
            .lock()
            .expect("memory poisoned")
            .last_n(self.memory_window)
            .map(|item| match item.speaker {
                Speaker::Human => PromptMessage::user(item.text.clone()),
                Speaker::Ai => PromptMessage::assistant(item.text.clone()),
            })
            .collect();

        LlmRequest {
            system_prompt: system,
            messages,
            max_tokens: profile.max_tokens,
            temperature: profile.temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_drain_requires_stream_complete() {
        let gate = Arc::new(TurnGate::new());
        // Drains before the stream completes are echoes of earlier sentences.
        gate.note_drained();
        assert!(!gate.tx.borrow().drained);

        gate.note_stream_complete(false);
        assert!(!gate.tx.borrow().drained);
        gate.note_drained();
        assert!(gate.tx.borrow().drained);
        assert!(!gate.wait_done().await);
    }

    #[tokio::test]
    async fn test_gate_stream_complete_with_empty_queue() {
        let gate = Arc::new(TurnGate::new());
        gate.note_stream_complete(true);
        assert!(!gate.wait_done().await);
    }

    #[tokio::test]
    async fn test_gate_cancellation_wins() {
        let gate = Arc::new(TurnGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_done().await })
        };
        gate.cancel();
        assert!(waiter.await.unwrap());
        assert!(gate.is_cancelled());
    }
}
