//! Turn-taking reducer
//!
//! The single authority on conversation state. A pure, synchronous function:
//! given the same `(State, Event)` it produces the same
//! `(State', Actions, Signals)` and performs no I/O. All concurrency lives in
//! the producers and action handlers around it.
//!
//! ```text
//!            VadSpeechStart              VadSpeechStop
//!   ┌──────┐ ──────────────→ ┌──────────┐ ─────────────→ ┌─────────┐
//!   │ Idle │                 │ Speaking │                │ Pausing │
//!   └──────┘ ←────────────── └──────────┘ ←───────────── └─────────┘
//!       ↑       ProcessTurn /      ↑        VadSpeechStart
//!       │       safety timeout     │
//!       └── Tick ≥ end_ms since last voice ─┘
//! ```
//!
//! Interruption precedence for a speech frame while the AI holds the floor:
//! authority gate, attempt counting, 250 ms debounce, then a weighted
//! predicate whose threshold shifts linearly with the profile's sensitivity.

use crate::events::{Action, Command, Event, EventKind, InterruptReason, TurnEndReason};
use crate::reducer::state::{ConversationState, SpeechState};
use crate::signals::{names, Signal, SignalContext};
use serde_json::json;
use tracing::{debug, trace, warn};

/// Minimum spacing between accepted or evaluated interruptions
pub const INTERRUPT_DEBOUNCE_MS: u64 = 250;

// Interruption evidence weights. The frame itself carries the most weight so
// a fully sensitive profile interrupts on any speech frame.
const WEIGHT_FRAME: f32 = 0.5;
const WEIGHT_PARTIAL: f32 = 0.3;
const WEIGHT_ENERGY: f32 = 0.2;
/// RMS floor above which a frame counts as energetic evidence
const ENERGY_FLOOR_RMS: f32 = 0.015;

/// Watchdog multiple of the safety timeout for a stalled turn pipeline
const WATCHDOG_FACTOR: u64 = 2;

/// Everything one `reduce` call asks of the outside world
#[derive(Debug, Default)]
pub struct ReduceOutput {
    /// Dispatched to the turn executor, in order, before any signal is emitted
    pub actions: Vec<Action>,
    /// Broadcast to listeners after action dispatch
    pub signals: Vec<Signal>,
}

impl ReduceOutput {
    fn signal(&mut self, state: &ConversationState, now_ms: u64, name: &str, payload: serde_json::Value) {
        self.signals.push(Signal::new(name, payload).with_context(SignalContext {
            turn_id: state.turn_id,
            phase_id: state.current_phase_id().map(str::to_string),
            at_ms: now_ms,
        }));
    }

    fn invalid_event(&mut self, state: &ConversationState, now_ms: u64, detail: &str) {
        self.actions.push(Action::Log {
            message: format!("Discarding malformed event: {}", detail),
        });
        self.signal(state, now_ms, names::REDUCER_INVALID_EVENT, json!({ "detail": detail }));
    }
}

/// Advance the conversation by one event
pub fn reduce(state: &mut ConversationState, event: &Event) -> ReduceOutput {
    let now = event.at_ms;
    let mut out = ReduceOutput::default();

    match &event.kind {
        EventKind::AudioFrame { samples, is_speech } => {
            on_audio_frame(state, now, samples, *is_speech, &mut out);
        }
        EventKind::VadSpeechStart => on_vad_start(state, now, &mut out),
        EventKind::VadSpeechStop => on_vad_stop(state, now),
        EventKind::AsrPartial { text } => on_asr_partial(state, now, text),
        EventKind::AsrFinal {
            text,
            confidence,
            elapsed_ms,
        } => {
            state.final_transcript = Some((text.clone(), *confidence));
            state.transcription_ms = *elapsed_ms;
        }
        EventKind::AiSentenceReady { text } => on_ai_sentence(state, text, &mut out),
        EventKind::AiStreamComplete => {
            if state.ai_stream_active {
                state.ai_stream_complete = true;
            }
        }
        EventKind::TtsSentenceStarted => on_tts_started(state, now, &mut out),
        EventKind::TtsSentenceFinished => {
            state.ai_speech_queue.pop_front();
        }
        EventKind::TtsQueueEmpty => {
            state.is_ai_speaking = false;
            state.ai_speech_queue.clear();
        }
        EventKind::Tick => on_tick(state, now, &mut out),
        EventKind::PhaseTransition { target } => on_phase_transition(state, now, target, &mut out),
        EventKind::ProcessTurn => on_process_turn(state, now, &mut out),
        EventKind::ResetTurn {
            turn_id,
            reason,
            latency,
        } => on_reset_turn(state, now, *turn_id, *reason, *latency, &mut out),
        EventKind::ExternalText { text } => on_external_text(state, now, text, &mut out),
        EventKind::Command(command) => on_command(state, now, *command, &mut out),
    }

    out
}

// ─── Audio and interruption ──────────────────────────────────

fn on_audio_frame(
    state: &mut ConversationState,
    now: u64,
    samples: &[f32],
    is_speech: bool,
    out: &mut ReduceOutput,
) {
    if samples.is_empty() {
        out.invalid_event(state, now, "empty audio frame");
        return;
    }

    // Paused sessions and silence frames only ever pad the turn buffer.
    if state.is_paused || !is_speech {
        if state.speech != SpeechState::Idle {
            state.turn_audio.extend_from_slice(samples);
        }
        return;
    }

    if !state.is_ai_speaking {
        state.turn_audio.extend_from_slice(samples);
        return;
    }

    let energy = rms(samples);
    try_interrupt(
        state,
        now,
        Some(energy),
        InterruptReason::HumanSpeech,
        out,
    );
}

/// Evaluate an interruption attempt while the AI holds the floor.
///
/// Returns true when the interruption was accepted and the turn finalized.
fn try_interrupt(
    state: &mut ConversationState,
    now: u64,
    frame_energy: Option<f32>,
    reason: InterruptReason,
    out: &mut ReduceOutput,
) -> bool {
    // authority = ai mutes the mic entirely while the AI speaks
    if state.profile().authority == crate::profile::Authority::Ai {
        trace!("Discarding speech frame under ai authority");
        return false;
    }

    state.interrupt_attempts += 1;

    if let Some(last) = state.last_interrupt_ms {
        if now.saturating_sub(last) < INTERRUPT_DEBOUNCE_MS {
            trace!("Interruption attempt inside debounce window");
            return false;
        }
    }

    let sensitivity = state.profile().interruption_sensitivity;
    if sensitivity <= 0.0 {
        return false;
    }

    // Weighted evidence; the threshold drops linearly as sensitivity rises.
    let mut score = WEIGHT_FRAME;
    if state.asr_partial_during_ai {
        score += WEIGHT_PARTIAL;
    }
    if frame_energy.is_some_and(|e| e > ENERGY_FLOOR_RMS) {
        score += WEIGHT_ENERGY;
    }
    if score + f32::EPSILON < 1.0 - sensitivity {
        return false;
    }

    accept_interrupt(state, now, reason, out);
    true
}

fn accept_interrupt(
    state: &mut ConversationState,
    now: u64,
    reason: InterruptReason,
    out: &mut ReduceOutput,
) {
    debug!(turn = state.turn_id, reason = reason.as_str(), "AI interrupted");
    state.interrupts_accepted += 1;
    state.last_interrupt_ms = Some(now);
    state.turn_end_reason = Some(TurnEndReason::Interrupted);
    state.is_ai_speaking = false;
    state.ai_speech_queue.clear();
    state.ai_stream_active = false;
    state.ai_stream_complete = false;

    out.actions.push(Action::InterruptAi { reason });
    out.actions.push(Action::ClearSpeechQueue);
    out.signal(
        state,
        now,
        names::CONVERSATION_INTERRUPTED,
        json!({
            "reason": reason.as_str(),
            "turn_id": state.turn_id,
            "authority": state.profile().authority.as_str(),
        }),
    );
    finalize_turn(state, now, out);
}

fn on_vad_start(state: &mut ConversationState, now: u64, out: &mut ReduceOutput) {
    if state.is_paused {
        return;
    }
    // Speech onset during an AI turn is interruption evidence, not a state
    // transition. Generation that has not reached the speaker yet
    // (processing without playback) is treated the same way.
    if state.is_ai_speaking || state.processing {
        if try_interrupt(state, now, None, InterruptReason::HumanSpeech, out) {
            begin_human_turn(state, now);
        }
        return;
    }
    match state.speech {
        SpeechState::Idle => begin_human_turn(state, now),
        SpeechState::Pausing => {
            state.speech = SpeechState::Speaking;
            state.is_human_speaking = true;
        }
        SpeechState::Speaking => {}
    }
}

fn on_vad_stop(state: &mut ConversationState, now: u64) {
    if state.speech == SpeechState::Speaking {
        state.speech = SpeechState::Pausing;
        state.is_human_speaking = false;
        state.last_voice_ms = Some(now);
    }
}

fn begin_human_turn(state: &mut ConversationState, now: u64) {
    // Frames that arrived just before the VAD flipped belong to this turn.
    let onset_audio = std::mem::take(&mut state.turn_audio);
    state.clear_turn_fields();
    state.turn_audio = onset_audio;
    state.turn_active = true;
    state.speech = SpeechState::Speaking;
    state.is_human_speaking = true;
    state.turn_start_ms = Some(now);
    debug!(turn = state.turn_id, at_ms = now, "Human turn started");
}

// ─── ASR and AI output ───────────────────────────────────────

fn on_asr_partial(state: &mut ConversationState, now: u64, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    state.partial_transcripts.push(text.to_string());
    if state.is_ai_speaking {
        state.asr_partial_during_ai = true;
    }
    // Recognized speech counts as a turn even if the VAD never fired.
    if !state.turn_active && !state.processing {
        state.turn_active = true;
        if state.turn_start_ms.is_none() {
            state.turn_start_ms = Some(now);
        }
    }
}

fn on_ai_sentence(state: &mut ConversationState, text: &str, out: &mut ReduceOutput) {
    if !state.ai_stream_active {
        trace!("Dropping AI sentence after interruption");
        return;
    }
    if !is_speakable(text) {
        debug!("Dropping unspeakable AI sentence: {:?}", text);
        return;
    }
    state.ai_speech_queue.push_back(text.to_string());
    if !state.ai_transcript.is_empty() {
        state.ai_transcript.push(' ');
    }
    state.ai_transcript.push_str(text);
    out.actions.push(Action::SpeakSentence {
        text: text.to_string(),
    });
}

fn on_tts_started(state: &mut ConversationState, now: u64, out: &mut ReduceOutput) {
    if state.is_human_speaking {
        out.invalid_event(state, now, "tts started while human speaking");
        return;
    }
    state.is_ai_speaking = true;
    if state.ai_turn_start_ms.is_none() {
        state.ai_turn_start_ms = Some(now);
    }
}

// ─── Timers ──────────────────────────────────────────────────

fn on_tick(state: &mut ConversationState, now: u64, out: &mut ReduceOutput) {
    if state.is_paused || state.stopping {
        return;
    }
    let profile = state.active.profile.clone();

    // Liveness watchdog: a pipeline that never reports completion (e.g. a
    // TTS that never sends TtsQueueEmpty) is force-reset.
    if state.processing {
        if let Some(start) = state.turn_start_ms {
            if now.saturating_sub(start) >= profile.safety_timeout_ms * WATCHDOG_FACTOR {
                warn!(turn = state.turn_id, "Turn pipeline stalled, force-resetting");
                out.actions.push(Action::InterruptAi {
                    reason: InterruptReason::Stalled,
                });
                out.actions.push(Action::ClearSpeechQueue);
                out.actions.push(Action::ResetTurn {
                    turn_id: state.turn_id,
                });
                out.signal(
                    state,
                    now,
                    names::CONVERSATION_WATCHDOG_TIMEOUT,
                    json!({ "turn_id": state.turn_id }),
                );
                state.is_ai_speaking = false;
                state.ai_speech_queue.clear();
                state.ai_stream_active = false;
            }
        }
        return;
    }

    // Silence-based end wins over the safety timeout when both are due.
    let silence_due = state.speech == SpeechState::Pausing
        && state
            .last_voice_ms
            .is_some_and(|last| now.saturating_sub(last) >= profile.end_ms);
    if silence_due {
        end_turn(state, now, TurnEndReason::Silence, out);
        return;
    }

    let safety_due = state.turn_active
        && state.turn_has_content()
        && state
            .turn_start_ms
            .is_some_and(|start| now.saturating_sub(start) >= profile.safety_timeout_ms);
    if safety_due {
        let reason = if state.human_limit_ack_sent {
            TurnEndReason::LimitExceeded
        } else {
            TurnEndReason::SafetyTimeout
        };
        end_turn(state, now, reason, out);
        return;
    }

    if state.speech == SpeechState::Speaking && !state.human_limit_ack_sent {
        if let (Some(limit_sec), Some(start)) = (profile.human_speaking_limit_sec, state.turn_start_ms) {
            let elapsed = now.saturating_sub(start);
            if elapsed >= limit_sec * 1000 {
                state.human_limit_ack_sent = true;
                if let Some(phrase) = state.pick_acknowledgment() {
                    out.actions.push(Action::PlayAcknowledgment { text: phrase });
                }
                out.signal(
                    state,
                    now,
                    names::CONVERSATION_SPEAKING_LIMIT_EXCEEDED,
                    json!({
                        "limit_sec": limit_sec,
                        "actual_duration_sec": elapsed as f64 / 1000.0,
                    }),
                );
            }
        }
    }
}

fn end_turn(state: &mut ConversationState, now: u64, reason: TurnEndReason, out: &mut ReduceOutput) {
    debug!(turn = state.turn_id, reason = reason.as_str(), "Turn ended");
    state.speech = SpeechState::Idle;
    state.is_human_speaking = false;
    state.turn_end_reason = Some(reason);

    if state.turn_has_content() {
        state.processing = true;
        state.ai_stream_active = true;
        let job = state.build_job(now);
        out.actions.push(Action::ProcessTurn { job });
    } else {
        // Nothing to process; close the bookkeeping on the spot so a new
        // turn can open without racing a round-tripped reset.
        finalize_turn(state, now, out);
    }
}

// ─── Turn lifecycle ──────────────────────────────────────────

fn on_process_turn(state: &mut ConversationState, now: u64, out: &mut ReduceOutput) {
    if state.processing || !state.turn_has_content() {
        trace!("Suppressing ProcessTurn with nothing to do");
        return;
    }
    state.speech = SpeechState::Idle;
    state.is_human_speaking = false;
    state.processing = true;
    state.ai_stream_active = true;
    let job = state.build_job(now);
    out.actions.push(Action::ProcessTurn { job });
}

fn on_reset_turn(
    state: &mut ConversationState,
    now: u64,
    turn_id: u64,
    reason: Option<TurnEndReason>,
    latency: Option<crate::events::TurnLatency>,
    out: &mut ReduceOutput,
) {
    if turn_id != state.turn_id {
        trace!(stale = turn_id, current = state.turn_id, "Ignoring stale ResetTurn");
        return;
    }
    if let Some(latency) = latency {
        if latency.transcription_ms > 0.0 {
            state.transcription_ms = latency.transcription_ms;
        }
        if latency.llm_ms > 0.0 {
            state.llm_ms = latency.llm_ms;
        }
    }
    if let Some(reason) = reason {
        state.turn_end_reason = Some(reason);
    }
    if state.turn_active {
        finalize_turn(state, now, out);
    } else {
        // Resetting an idle turn is a no-op beyond field hygiene.
        state.clear_turn_fields();
    }
}

/// Snapshot the turn for analytics, clear per-turn fields, bump the counter
///
/// A turn that never opened produces no record and keeps its id, so stray
/// collaborator callbacks cannot manufacture empty analytics rows.
fn finalize_turn(state: &mut ConversationState, now: u64, out: &mut ReduceOutput) {
    state.speech = SpeechState::Idle;
    state.is_human_speaking = false;
    if state.turn_active {
        let record = state.snapshot_record(now);
        out.actions.push(Action::LogTurn { record });
        state.clear_turn_fields();
        state.turn_id += 1;
    } else {
        state.clear_turn_fields();
    }
}

// ─── Phases, external input, commands ────────────────────────

fn on_phase_transition(
    state: &mut ConversationState,
    now: u64,
    target: &str,
    out: &mut ReduceOutput,
) {
    if !state.enter_phase(target) {
        out.invalid_event(state, now, &format!("unknown phase '{}'", target));
        return;
    }
    debug!(phase = target, "Phase entered");
    if state.profile().initial_speaker == crate::profile::Speaker::Ai
        && !state.processing
        && !state.turn_active
    {
        start_ai_turn(state, now, out);
    }
}

/// Open a turn on the AI side (phase openings); the pipeline runs with no
/// human input and builds its prompt from memory and phase context alone.
fn start_ai_turn(state: &mut ConversationState, now: u64, out: &mut ReduceOutput) {
    state.clear_turn_fields();
    state.turn_active = true;
    state.turn_start_ms = Some(now);
    state.processing = true;
    state.ai_stream_active = true;
    let job = state.build_job(now);
    out.actions.push(Action::ProcessTurn { job });
}

fn on_external_text(state: &mut ConversationState, now: u64, text: &str, out: &mut ReduceOutput) {
    if text.trim().is_empty() {
        out.invalid_event(state, now, "empty external text");
        return;
    }
    // Injected text is a deliberate act by the driver; it overrides the
    // authority policy where live speech would not.
    if state.is_ai_speaking || state.processing {
        accept_interrupt(state, now, InterruptReason::ExternalInput, out);
    }
    state.clear_turn_fields();
    state.turn_active = true;
    state.turn_start_ms = Some(now);
    state.external_text = Some(text.to_string());
    state.processing = true;
    state.ai_stream_active = true;
    let job = state.build_job(now);
    out.actions.push(Action::ProcessTurn { job });
}

fn on_command(state: &mut ConversationState, now: u64, command: Command, out: &mut ReduceOutput) {
    match command {
        Command::Start => {
            state.is_paused = false;
            state.stopping = false;
            // A session whose profile opens on the AI side starts generating
            // immediately; later Start commands only clear the pause flag.
            if state.turn_id == 0
                && !state.turn_active
                && !state.processing
                && state.profile().initial_speaker == crate::profile::Speaker::Ai
            {
                start_ai_turn(state, now, out);
            }
        }
        Command::Pause => {
            state.is_paused = true;
        }
        Command::Resume => {
            state.is_paused = false;
        }
        Command::Stop => {
            state.stopping = true;
            if state.is_ai_speaking || state.processing {
                out.actions.push(Action::InterruptAi {
                    reason: InterruptReason::Shutdown,
                });
                out.actions.push(Action::ClearSpeechQueue);
                state.is_ai_speaking = false;
                state.ai_speech_queue.clear();
                state.ai_stream_active = false;
            }
            if state.turn_active {
                if state.turn_end_reason.is_none() {
                    state.turn_end_reason = Some(TurnEndReason::Interrupted);
                }
                finalize_turn(state, now, out);
            }
        }
        Command::Reset { keep_profile } => {
            if state.is_ai_speaking || state.processing {
                out.actions.push(Action::InterruptAi {
                    reason: InterruptReason::ExternalInput,
                });
                out.actions.push(Action::ClearSpeechQueue);
                state.is_ai_speaking = false;
                state.ai_speech_queue.clear();
                state.ai_stream_active = false;
            }
            if state.turn_active {
                if state.turn_end_reason.is_none() {
                    state.turn_end_reason = Some(TurnEndReason::Interrupted);
                }
                finalize_turn(state, now, out);
            } else {
                state.clear_turn_fields();
            }
            if !keep_profile {
                state.enter_initial_phase();
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// A sentence worth speaking: non-empty and not solely punctuation
pub fn is_speakable(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && trimmed.chars().any(|c| c.is_alphanumeric())
}
