//! Structured signal bus
//!
//! Signals are named observations fanned out synchronously to optional
//! listeners. They never mutate conversation state and never substitute for
//! Actions; the system is functionally complete with zero listeners
//! registered. A listener that panics is logged and skipped — delivery
//! continues to the remaining listeners and never propagates into the
//! reducer.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use tracing::{trace, warn};

/// Well-known signal names emitted by the core
pub mod names {
    pub const CONVERSATION_INTERRUPTED: &str = "conversation.interrupted";
    pub const CONVERSATION_SPEAKING_LIMIT_EXCEEDED: &str = "conversation.speaking_limit_exceeded";
    pub const CONVERSATION_WATCHDOG_TIMEOUT: &str = "conversation.watchdog_timeout";
    pub const LLM_GENERATION_START: &str = "llm.generation_start";
    pub const LLM_GENERATION_COMPLETE: &str = "llm.generation_complete";
    pub const LLM_GENERATION_ERROR: &str = "llm.generation_error";
    pub const ANALYTICS_TURN_METRICS_UPDATED: &str = "analytics.turn_metrics_updated";
    pub const AUDIO_FRAME_DROPPED: &str = "audio.frame_dropped";
    pub const REDUCER_INVALID_EVENT: &str = "reducer.invalid_event";
    pub const EXECUTOR_ACTION_FAILED: &str = "executor.action_failed";
    /// Prefix applied to unqualified profile-advertised signal names
    pub const CUSTOM_PREFIX: &str = "custom.";
}

/// Where a signal was observed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalContext {
    pub turn_id: u64,
    pub phase_id: Option<String>,
    pub at_ms: u64,
}

/// A named observation with an opaque payload
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Dotted namespace name, e.g. `conversation.interrupted`
    pub name: String,
    pub payload: Value,
    pub context: SignalContext,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            context: SignalContext::default(),
        }
    }

    pub fn with_context(mut self, context: SignalContext) -> Self {
        self.context = context;
        self
    }
}

type Listener = Box<dyn Fn(&Signal) + Send + Sync>;

struct Registration {
    /// `None` subscribes to every signal
    name: Option<String>,
    listener: Listener,
}

/// Synchronous fan-out of signals to registered listeners
///
/// Listeners run in registration order. They must not re-enter the reducer;
/// a listener that needs to influence behavior enqueues an Event instead.
#[derive(Default)]
pub struct SignalBus {
    registrations: Mutex<Vec<Registration>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a specific signal name
    pub fn subscribe<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.registrations
            .lock()
            .expect("signal bus poisoned")
            .push(Registration {
                name: Some(name.into()),
                listener: Box::new(listener),
            });
    }

    /// Subscribe to every signal
    pub fn subscribe_all<F>(&self, listener: F)
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.registrations
            .lock()
            .expect("signal bus poisoned")
            .push(Registration {
                name: None,
                listener: Box::new(listener),
            });
    }

    /// Deliver a signal to every matching listener
    pub fn emit(&self, signal: &Signal) {
        trace!(name = %signal.name, turn = signal.context.turn_id, "signal");
        let registrations = self.registrations.lock().expect("signal bus poisoned");
        for reg in registrations.iter() {
            let matches = match &reg.name {
                Some(name) => name == &signal.name,
                None => true,
            };
            if !matches {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (reg.listener)(signal))).is_err() {
                warn!(name = %signal.name, "Signal listener panicked, skipping");
            }
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.registrations.lock().expect("signal bus poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_named_subscription_filters() {
        let bus = SignalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(names::CONVERSATION_INTERRUPTED, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Signal::new(names::CONVERSATION_INTERRUPTED, json!({})));
        bus.emit(&Signal::new(names::LLM_GENERATION_START, json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_universal_subscription_sees_everything() {
        let bus = SignalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe_all(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Signal::new("custom.a", json!({})));
        bus.emit(&Signal::new("custom.b", json!({"k": 1})));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_abort_delivery() {
        let bus = SignalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe_all(|_| panic!("listener bug"));
        let hits_clone = hits.clone();
        bus.subscribe_all(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Signal::new("custom.x", json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = SignalBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe_all(move |_| order.lock().unwrap().push(i));
        }

        bus.emit(&Signal::new("custom.ordered", json!({})));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_emit_with_no_listeners_is_fine() {
        let bus = SignalBus::new();
        bus.emit(&Signal::new("custom.quiet", json!({})));
        assert_eq!(bus.listener_count(), 0);
    }
}
