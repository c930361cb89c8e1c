//! Turn-taking core: conversation state plus the pure reducer over it

mod reduce;
mod state;

pub use reduce::{is_speakable, reduce, ReduceOutput, INTERRUPT_DEBOUNCE_MS};
pub use state::{ActiveProfile, ConversationState, SpeechState};
