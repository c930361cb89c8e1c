//! Engine assembly
//!
//! Wires the clock, event queue, reducer loop, audio producer, turn executor,
//! signal bus, conversation memory, and analytics into one session, and
//! exposes the external command surface: start, pause, resume, stop,
//! text injection, and reset.
//!
//! ```text
//! AudioSource ─→ VAD ─→ ┌────────────┐      ┌─────────┐
//!                       │ EventQueue │ ───→ │ reduce  │ ─→ Signals
//! ASR / TTS / pipeline ─→└────────────┘      └────┬────┘
//!        ↑                                       │ Actions
//!        └──────────────── TurnExecutor ←────────┘
//! ```

mod audio;
mod event_loop;
mod queue;

pub use audio::{AudioProducer, AudioProducerConfig};
pub use event_loop::EventLoop;
pub use queue::{EventQueue, EventSink, PushOutcome};

use crate::analytics::AnalyticsLog;
use crate::clock::Clock;
use crate::events::{Command, EventKind};
use crate::executor::{ExecutorParts, TurnExecutor};
use crate::interfaces::energy_vad::EnergyVad;
use crate::interfaces::{Asr, AudioSource, Llm, SharedAsr, Tts, Vad};
use crate::memory::{ConversationMemory, MemoryItem};
use crate::phase::PhaseController;
use crate::profile::{PhaseProfile, Profile};
use crate::reducer::ConversationState;
use crate::signals::SignalBus;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// What the session runs: one profile, or a phased conversation
pub enum ProfileSource {
    Single(Profile),
    Phased(PhaseProfile),
}

/// Session configuration
pub struct EngineConfig {
    pub profile: ProfileSource,
    /// Event queue capacity before audio eviction kicks in
    pub queue_capacity: usize,
    /// Conversation memory ring size
    pub memory_capacity: usize,
    /// Memory items rendered into each LLM prompt
    pub memory_window: usize,
    /// JSONL sink for per-turn analytics records
    pub analytics_path: Option<PathBuf>,
    /// Overrides the built-in conversational system prompt
    pub system_prompt: Option<String>,
    /// Fixes the acknowledgment-choice RNG for reproducible runs
    pub rng_seed: Option<u64>,
    /// Defaults to the system clock; tests pass a manual clock
    pub clock: Option<Clock>,
    pub audio: AudioProducerConfig,
}

impl EngineConfig {
    pub fn new(profile: ProfileSource) -> Self {
        Self {
            profile,
            queue_capacity: 256,
            memory_capacity: 64,
            memory_window: 12,
            analytics_path: None,
            system_prompt: None,
            rng_seed: None,
            clock: None,
            audio: AudioProducerConfig::default(),
        }
    }
}

/// The external collaborators a session drives
pub struct Collaborators {
    /// Capture source; `None` runs without an audio producer (event-injected)
    pub source: Option<Box<dyn AudioSource>>,
    /// Defaults to [`EnergyVad`] when omitted
    pub vad: Option<Box<dyn Vad>>,
    pub asr: Box<dyn Asr>,
    pub llm: Arc<dyn Llm>,
    pub tts: Arc<dyn Tts>,
}

/// One full-duplex conversation session
pub struct Engine {
    sink: EventSink,
    bus: Arc<SignalBus>,
    memory: Arc<Mutex<ConversationMemory>>,
    analytics: Arc<AnalyticsLog>,
    controller: Option<Arc<PhaseController>>,
    event_loop: Mutex<Option<EventLoop>>,
    producer: Mutex<Option<AudioProducer>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    producer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let clock = config.clock.clone().unwrap_or_else(Clock::system);
        let bus = Arc::new(SignalBus::new());
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let sink = EventSink::new(queue.clone(), clock.clone(), bus.clone());

        let (state, controller) = match &config.profile {
            ProfileSource::Single(profile) => {
                profile.validate().context("Invalid profile")?;
                (ConversationState::with_profile(profile.clone()), None)
            }
            ProfileSource::Phased(phases) => {
                phases.validate().context("Invalid phase profile")?;
                let phases = Arc::new(phases.clone());
                (
                    ConversationState::with_phase_profile(phases.clone()),
                    Some(Arc::new(PhaseController::new(phases))),
                )
            }
        };
        let state = match config.rng_seed {
            Some(seed) => state.seeded(seed),
            None => state,
        };

        collaborators.tts.bind(sink.clone());

        let memory = Arc::new(Mutex::new(ConversationMemory::new(config.memory_capacity)));
        let analytics = Arc::new(match &config.analytics_path {
            Some(path) => AnalyticsLog::with_file(path)?,
            None => AnalyticsLog::new(),
        });
        let asr: SharedAsr = Arc::new(tokio::sync::Mutex::new(collaborators.asr));

        let executor = Arc::new(TurnExecutor::new(ExecutorParts {
            sink: sink.clone(),
            bus: bus.clone(),
            memory: memory.clone(),
            analytics: analytics.clone(),
            phase: controller.clone(),
            asr: asr.clone(),
            llm: collaborators.llm,
            tts: collaborators.tts,
            system_prompt: config.system_prompt,
            memory_window: config.memory_window,
        }));

        let event_loop = EventLoop::new(queue, state, executor, bus.clone(), clock);

        let producer = collaborators.source.map(|source| {
            let vad = collaborators
                .vad
                .unwrap_or_else(|| Box::new(EnergyVad::new()) as Box<dyn Vad>);
            AudioProducer::new(source, vad, Some(asr), sink.clone(), config.audio)
        });

        Ok(Self {
            sink,
            bus,
            memory,
            analytics,
            controller,
            event_loop: Mutex::new(Some(event_loop)),
            producer: Mutex::new(producer),
            loop_handle: Mutex::new(None),
            producer_handle: Mutex::new(None),
        })
    }

    /// Spawn the event loop and audio producer and open the session
    pub fn start(&self) -> Result<()> {
        let event_loop = self
            .event_loop
            .lock()
            .expect("engine poisoned")
            .take()
            .context("Engine already started")?;
        *self.loop_handle.lock().expect("engine poisoned") = Some(tokio::spawn(event_loop.run()));
        if let Some(producer) = self.producer.lock().expect("engine poisoned").take() {
            *self.producer_handle.lock().expect("engine poisoned") =
                Some(tokio::spawn(producer.run()));
        }
        self.sink.push(EventKind::Command(Command::Start));
        info!("Session started");
        Ok(())
    }

    /// Drop audio frames until resumed; a turn in flight is left untouched
    pub fn pause(&self) {
        self.sink.push(EventKind::Command(Command::Pause));
    }

    pub fn resume(&self) {
        self.sink.push(EventKind::Command(Command::Resume));
    }

    /// Inject text that bypasses ASR entirely
    pub fn inject_text(&self, text: impl Into<String>) {
        self.sink.push(EventKind::ExternalText { text: text.into() });
    }

    /// Clear memory and per-turn state; reload the phase profile from its
    /// initial phase unless `keep_profile`
    pub fn reset(&self, keep_profile: bool) {
        self.memory.lock().expect("engine poisoned").clear();
        if !keep_profile {
            if let Some(controller) = &self.controller {
                controller.reset();
            }
        }
        self.sink.push(EventKind::Command(Command::Reset { keep_profile }));
    }

    /// Graceful shutdown: drain, cancel in-flight work, flush final analytics
    pub async fn stop(&self) {
        self.sink.push(EventKind::Command(Command::Stop));
        let handle = self.loop_handle.lock().expect("engine poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let handle = self.producer_handle.lock().expect("engine poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        info!("Session stopped");
    }

    /// Wait for the audio producer to exhaust its source (scripted runs)
    pub async fn join_producer(&self) {
        let handle = self.producer_handle.lock().expect("engine poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Handle for injecting synthetic events
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    pub fn analytics(&self) -> &Arc<AnalyticsLog> {
        &self.analytics
    }

    /// Snapshot of conversation memory, oldest first
    pub fn memory_items(&self) -> Vec<MemoryItem> {
        self.memory
            .lock()
            .expect("engine poisoned")
            .items()
            .cloned()
            .collect()
    }
}
