//! Conversation state
//!
//! Owned exclusively by the event loop; the reducer is the only writer.
//! Per-turn fields reset on `ResetTurn`, the `turn_id` is monotonic, and the
//! resolved active profile is swapped in place on phase transitions.

use crate::analytics::TurnRecord;
use crate::events::{TurnEndReason, TurnJob};
use crate::profile::{PhaseProfile, Profile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;

/// Turn-taking machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    /// Waiting for the human to speak
    Idle,
    /// The human holds the floor
    Speaking,
    /// The human went quiet; waiting out the silence threshold
    Pausing,
}

/// The profile currently in force, resolved through any phase transitions
#[derive(Debug, Clone)]
pub struct ActiveProfile {
    pub profile: Arc<Profile>,
    pub phase_id: Option<String>,
    pub phase_context: Option<String>,
    pub global_context: Option<String>,
}

impl ActiveProfile {
    fn standalone(profile: Profile) -> Self {
        Self {
            profile: Arc::new(profile),
            phase_id: None,
            phase_context: None,
            global_context: None,
        }
    }

    fn from_phase(phases: &PhaseProfile, phase_id: &str) -> Option<Self> {
        let phase = phases.phase(phase_id)?;
        Some(Self {
            profile: Arc::new(phase.profile.clone()),
            phase_id: Some(phase.id.clone()),
            phase_context: phase.context.clone(),
            global_context: phases.global_context.clone(),
        })
    }
}

/// Single-writer conversation state
pub struct ConversationState {
    /// Phase configuration, if the session runs a multi-stage conversation
    phase_profile: Option<Arc<PhaseProfile>>,
    pub active: ActiveProfile,

    pub speech: SpeechState,
    pub is_human_speaking: bool,
    pub is_ai_speaking: bool,
    pub is_paused: bool,
    pub stopping: bool,

    /// Monotonic turn counter
    pub turn_id: u64,
    /// A turn is underway (speech started or input arrived) and not yet reset
    pub turn_active: bool,
    /// The turn pipeline has been dispatched for the current turn
    pub processing: bool,
    pub turn_start_ms: Option<u64>,
    pub ai_turn_start_ms: Option<u64>,
    pub last_voice_ms: Option<u64>,
    pub turn_audio: Vec<f32>,
    pub ai_speech_queue: VecDeque<String>,
    pub partial_transcripts: Vec<String>,
    pub final_transcript: Option<(String, f32)>,
    pub external_text: Option<String>,
    pub ai_transcript: String,
    pub turn_end_reason: Option<TurnEndReason>,
    pub interrupt_attempts: u32,
    pub interrupts_accepted: u32,
    pub transcription_ms: f64,
    pub llm_ms: f64,
    pub human_limit_ack_sent: bool,
    /// A partial transcript arrived while the AI held the floor
    pub asr_partial_during_ai: bool,
    /// Sentences from the in-flight generation are accepted
    pub ai_stream_active: bool,
    pub ai_stream_complete: bool,

    /// Debounce anchor shared across turns
    pub last_interrupt_ms: Option<u64>,

    rng: StdRng,
}

impl ConversationState {
    /// Run a standalone profile
    pub fn with_profile(profile: Profile) -> Self {
        Self::build(ActiveProfile::standalone(profile), None, None)
    }

    /// Run a multi-stage conversation starting at the profile's initial phase
    pub fn with_phase_profile(phases: Arc<PhaseProfile>) -> Self {
        let active = ActiveProfile::from_phase(&phases, &phases.initial_phase)
            .expect("validated phase profile has an initial phase");
        Self::build(active, Some(phases), None)
    }

    /// Fix the acknowledgment-choice RNG for deterministic tests
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn build(
        active: ActiveProfile,
        phase_profile: Option<Arc<PhaseProfile>>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            phase_profile,
            active,
            speech: SpeechState::Idle,
            is_human_speaking: false,
            is_ai_speaking: false,
            is_paused: false,
            stopping: false,
            turn_id: 0,
            turn_active: false,
            processing: false,
            turn_start_ms: None,
            ai_turn_start_ms: None,
            last_voice_ms: None,
            turn_audio: Vec::new(),
            ai_speech_queue: VecDeque::new(),
            partial_transcripts: Vec::new(),
            final_transcript: None,
            external_text: None,
            ai_transcript: String::new(),
            turn_end_reason: None,
            interrupt_attempts: 0,
            interrupts_accepted: 0,
            transcription_ms: 0.0,
            llm_ms: 0.0,
            human_limit_ack_sent: false,
            asr_partial_during_ai: false,
            ai_stream_active: false,
            ai_stream_complete: false,
            last_interrupt_ms: None,
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_os_rng(),
            },
        }
    }

    /// The profile currently governing timing and interruption
    pub fn profile(&self) -> &Profile {
        &self.active.profile
    }

    pub fn current_phase_id(&self) -> Option<&str> {
        self.active.phase_id.as_deref()
    }

    pub fn phase_profile(&self) -> Option<&Arc<PhaseProfile>> {
        self.phase_profile.as_ref()
    }

    /// Swap the active profile to another phase. Returns false for unknown ids.
    pub(crate) fn enter_phase(&mut self, phase_id: &str) -> bool {
        let Some(phases) = &self.phase_profile else {
            return false;
        };
        match ActiveProfile::from_phase(phases, phase_id) {
            Some(active) => {
                self.active = active;
                true
            }
            None => false,
        }
    }

    /// Return to the configured initial phase, if phased
    pub(crate) fn enter_initial_phase(&mut self) {
        if let Some(phases) = self.phase_profile.clone() {
            let _ = self.enter_phase(&phases.initial_phase.clone());
        }
    }

    /// Anything worth processing this turn?
    pub fn turn_has_content(&self) -> bool {
        !self.turn_audio.is_empty()
            || self.external_text.is_some()
            || self.final_transcript.is_some()
            || !self.partial_transcripts.is_empty()
    }

    /// Best available human transcript for the current turn
    pub fn human_transcript(&self) -> String {
        if let Some((text, _)) = &self.final_transcript {
            return text.clone();
        }
        if let Some(text) = &self.external_text {
            return text.clone();
        }
        self.partial_transcripts.last().cloned().unwrap_or_default()
    }

    /// Choose an acknowledgment phrase uniformly from the active profile
    pub(crate) fn pick_acknowledgment(&mut self) -> Option<String> {
        let phrases = &self.active.profile.acknowledgments;
        if phrases.is_empty() {
            return None;
        }
        let idx = self.rng.random_range(0..phrases.len());
        Some(phrases[idx].clone())
    }

    /// Clear everything scoped to the current turn without touching `turn_id`
    pub(crate) fn clear_turn_fields(&mut self) {
        self.turn_active = false;
        self.processing = false;
        self.turn_start_ms = None;
        self.ai_turn_start_ms = None;
        self.last_voice_ms = None;
        self.turn_audio.clear();
        self.ai_speech_queue.clear();
        self.partial_transcripts.clear();
        self.final_transcript = None;
        self.external_text = None;
        self.ai_transcript.clear();
        self.turn_end_reason = None;
        self.interrupt_attempts = 0;
        self.interrupts_accepted = 0;
        self.transcription_ms = 0.0;
        self.llm_ms = 0.0;
        self.human_limit_ack_sent = false;
        self.asr_partial_during_ai = false;
        self.ai_stream_active = false;
        self.ai_stream_complete = false;
    }

    /// Analytics snapshot of the turn as it stands
    pub(crate) fn snapshot_record(&self, now_ms: u64) -> TurnRecord {
        TurnRecord {
            turn_id: self.turn_id,
            timestamp: 0.0,
            profile_name: self.active.profile.name().to_string(),
            phase_id: self.active.phase_id.clone(),
            human_transcript: self.human_transcript(),
            ai_transcript: self.ai_transcript.trim().to_string(),
            interrupt_attempts: self.interrupt_attempts,
            interrupts_accepted: self.interrupts_accepted,
            end_reason: self.turn_end_reason.unwrap_or(TurnEndReason::Silence),
            authority_mode: self.active.profile.authority,
            sensitivity_value: self.active.profile.interruption_sensitivity,
            transcription_ms: self.transcription_ms,
            llm_generation_ms: self.llm_ms,
            total_latency_ms: self
                .turn_start_ms
                .map(|start| now_ms.saturating_sub(start) as f64)
                .unwrap_or(0.0),
            confidence_score_at_cutoff: self
                .final_transcript
                .as_ref()
                .map(|(_, confidence)| *confidence)
                .unwrap_or(0.0),
        }
    }

    /// Build the pipeline job for the current turn, draining the audio buffer
    pub(crate) fn build_job(&mut self, now_ms: u64) -> TurnJob {
        TurnJob {
            turn_id: self.turn_id,
            audio: std::mem::take(&mut self.turn_audio),
            external_text: self.external_text.clone(),
            profile: self.active.profile.clone(),
            phase_id: self.active.phase_id.clone(),
            phase_context: self.active.phase_context.clone(),
            global_context: self.active.global_context.clone(),
            started_at_ms: self.turn_start_ms.unwrap_or(now_ms),
        }
    }
}

impl std::fmt::Debug for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationState")
            .field("speech", &self.speech)
            .field("turn_id", &self.turn_id)
            .field("turn_active", &self.turn_active)
            .field("processing", &self.processing)
            .field("is_human_speaking", &self.is_human_speaking)
            .field("is_ai_speaking", &self.is_ai_speaking)
            .field("is_paused", &self.is_paused)
            .field("phase", &self.active.phase_id)
            .finish_non_exhaustive()
    }
}
