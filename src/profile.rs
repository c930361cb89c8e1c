//! Conversation profiles and phase profiles
//!
//! A `Profile` is the declarative per-role configuration for a conversation:
//! timing thresholds, interruption policy, LLM parameters, and the signal
//! vocabulary advertised to the model. A `PhaseProfile` strings several
//! profiles together into a multi-stage conversation with declarative
//! transition rules.
//!
//! Profiles are plain serde structs loadable from TOML or JSON files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Validation failures for profiles and phase profiles
#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("profile id must not be empty")]
    EmptyId,
    #[error("interruption_sensitivity must be in [0.0, 1.0], got {0}")]
    SensitivityOutOfRange(f32),
    #[error("end_ms must be positive")]
    ZeroEndMs,
    #[error("safety_timeout_ms ({timeout_ms}) must be >= end_ms ({end_ms})")]
    TimeoutBelowEnd { timeout_ms: u64, end_ms: u64 },
    #[error("phase profile must declare at least one phase")]
    NoPhases,
    #[error("unknown phase '{0}'")]
    UnknownPhase(String),
    #[error("transition {from} -> {to} has no trigger signals")]
    NoTriggerSignals { from: String, to: String },
}

/// Who opens a conversation (or a phase)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[default]
    Human,
    Ai,
}

/// Interruption authority policy
///
/// `Human` always permits the user to interrupt the AI; `Ai` mutes the mic
/// while the AI speaks; `Default` lets `interruption_sensitivity` govern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    Human,
    Ai,
    #[default]
    Default,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::Human => "human",
            Authority::Ai => "ai",
            Authority::Default => "default",
        }
    }
}

/// Per-role conversation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Stable identifier
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
    /// Who speaks first
    #[serde(default)]
    pub initial_speaker: Speaker,
    /// TTS voice identifier
    #[serde(default = "default_voice")]
    pub voice: String,
    /// LLM completion cap
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// LLM sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Soft end-of-utterance threshold (informational, UX only)
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    /// Hard end-of-utterance silence threshold
    #[serde(default = "default_end_ms")]
    pub end_ms: u64,
    /// Force-end a turn regardless of silence
    #[serde(default = "default_safety_timeout_ms")]
    pub safety_timeout_ms: u64,
    /// Interruption sensitivity in [0.0, 1.0]
    #[serde(default = "default_sensitivity")]
    pub interruption_sensitivity: f32,
    /// Who may interrupt whom
    #[serde(default)]
    pub authority: Authority,
    /// Optional cap on continuous human speech, in seconds
    #[serde(default)]
    pub human_speaking_limit_sec: Option<u64>,
    /// Interjection phrases for speaking-limit acknowledgments
    #[serde(default)]
    pub acknowledgments: Vec<String>,
    /// System-prompt text for this role
    #[serde(default)]
    pub instructions: String,
    /// Signal names advertised to the LLM, name -> description
    #[serde(default)]
    pub signals: BTreeMap<String, String>,
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_pause_ms() -> u64 {
    600
}

fn default_end_ms() -> u64 {
    1200
}

fn default_safety_timeout_ms() -> u64 {
    15_000
}

fn default_sensitivity() -> f32 {
    0.5
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            display_name: String::new(),
            initial_speaker: Speaker::Human,
            voice: default_voice(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            pause_ms: default_pause_ms(),
            end_ms: default_end_ms(),
            safety_timeout_ms: default_safety_timeout_ms(),
            interruption_sensitivity: default_sensitivity(),
            authority: Authority::Default,
            human_speaking_limit_sec: None,
            acknowledgments: Vec::new(),
            instructions: String::new(),
            signals: BTreeMap::new(),
        }
    }
}

impl Profile {
    /// Load a profile from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read profile {}", path.as_ref().display()))?;
        let profile: Profile = toml::from_str(&text).context("Invalid profile TOML")?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load a profile from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read profile {}", path.as_ref().display()))?;
        let profile: Profile = serde_json::from_str(&text).context("Invalid profile JSON")?;
        profile.validate()?;
        Ok(profile)
    }

    /// Check value ranges
    pub fn validate(&self) -> std::result::Result<(), ProfileError> {
        if self.id.trim().is_empty() {
            return Err(ProfileError::EmptyId);
        }
        if !(0.0..=1.0).contains(&self.interruption_sensitivity) {
            return Err(ProfileError::SensitivityOutOfRange(
                self.interruption_sensitivity,
            ));
        }
        if self.end_ms == 0 {
            return Err(ProfileError::ZeroEndMs);
        }
        if self.safety_timeout_ms < self.end_ms {
            return Err(ProfileError::TimeoutBelowEnd {
                timeout_ms: self.safety_timeout_ms,
                end_ms: self.end_ms,
            });
        }
        Ok(())
    }

    /// Name used in analytics records
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// One named segment of a multi-stage conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Phase identifier, unique within the phase profile
    pub id: String,
    /// The profile active while this phase runs
    pub profile: Profile,
    /// Extra context text appended to the LLM prompt during this phase
    #[serde(default)]
    pub context: Option<String>,
}

/// Declarative rule moving the conversation from one phase to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransitionRule {
    pub from: String,
    pub to: String,
    /// Signals that trigger this rule
    pub trigger_signals: Vec<String>,
    /// If true, every trigger signal must have fired this phase; otherwise any one suffices
    #[serde(default)]
    pub require_all: bool,
}

/// Ordered collection of phases plus transition rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProfile {
    /// Phases in declaration order
    pub phases: Vec<Phase>,
    /// Transition rules, evaluated in declaration order (first match wins)
    #[serde(default)]
    pub transitions: Vec<PhaseTransitionRule>,
    /// Phase the conversation starts in
    pub initial_phase: String,
    /// Context text shared by every phase
    #[serde(default)]
    pub global_context: Option<String>,
}

impl PhaseProfile {
    /// Load a phase profile from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read phase profile {}", path.as_ref().display()))?;
        let profile: PhaseProfile = toml::from_str(&text).context("Invalid phase profile TOML")?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load a phase profile from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read phase profile {}", path.as_ref().display()))?;
        let profile: PhaseProfile =
            serde_json::from_str(&text).context("Invalid phase profile JSON")?;
        profile.validate()?;
        Ok(profile)
    }

    /// Check that the initial phase and every transition endpoint exist
    pub fn validate(&self) -> std::result::Result<(), ProfileError> {
        if self.phases.is_empty() {
            return Err(ProfileError::NoPhases);
        }
        for phase in &self.phases {
            phase.profile.validate()?;
        }
        if self.phase(&self.initial_phase).is_none() {
            return Err(ProfileError::UnknownPhase(self.initial_phase.clone()));
        }
        for rule in &self.transitions {
            if self.phase(&rule.from).is_none() {
                return Err(ProfileError::UnknownPhase(rule.from.clone()));
            }
            if self.phase(&rule.to).is_none() {
                return Err(ProfileError::UnknownPhase(rule.to.clone()));
            }
            if rule.trigger_signals.is_empty() {
                return Err(ProfileError::NoTriggerSignals {
                    from: rule.from.clone(),
                    to: rule.to.clone(),
                });
            }
        }
        Ok(())
    }

    /// Look up a phase by id
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Rules departing from the given phase, in declaration order
    pub fn transitions_from<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a PhaseTransitionRule> {
        self.transitions.iter().filter(move |r| r.from == from)
    }

    /// The phase the conversation starts in
    pub fn initial(&self) -> &Phase {
        self.phase(&self.initial_phase)
            .expect("validated phase profile has an initial phase")
    }
}
