//! Voiceloop - Real-Time Voice Conversation Engine
//!
//! Mediates a full-duplex, voice-based conversation between a human and an
//! AI responder. At the center sits a deterministic, event-driven reducer
//! that decides when the human's turn has ended, whether incoming speech
//! should interrupt an in-progress AI utterance, when to move between
//! configured conversation phases, and which side effects to schedule.
//!
//! Everything around the reducer is an interface: audio capture, VAD, the
//! streaming recognizer, the streaming LLM, and the TTS player all plug in
//! behind small traits, so the whole engine can be driven end-to-end by a
//! test harness that injects synthetic events.
//!
//! # Example
//!
//! ```ignore
//! use voiceloop::engine::{Collaborators, Engine, EngineConfig, ProfileSource};
//! use voiceloop::profile::Profile;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::new(ProfileSource::Single(Profile::default()));
//!     let engine = Engine::new(config, my_collaborators())?;
//!     engine.start()?;
//!     engine.inject_text("hello there");
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod clock;
pub mod profile;
pub mod events;
pub mod signals;
pub mod memory;
pub mod analytics;
pub mod sentence;
pub mod phase;
pub mod reducer;
pub mod interfaces;
pub mod executor;
pub mod engine;

// Re-export commonly used types for convenience
pub use analytics::{AnalyticsLog, SessionStats, TurnRecord};
pub use clock::Clock;
pub use engine::{Collaborators, Engine, EngineConfig, EventSink, ProfileSource};
pub use events::{Action, Command, Event, EventKind, InterruptReason, TurnEndReason};
pub use memory::ConversationMemory;
pub use phase::PhaseController;
pub use profile::{Authority, PhaseProfile, Profile, ProfileError, Speaker};
pub use reducer::{reduce, ConversationState, ReduceOutput, SpeechState};
pub use signals::{Signal, SignalBus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Real-Time Voice Conversation Engine", NAME, VERSION)
}
