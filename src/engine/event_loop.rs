//! Serialized event loop
//!
//! The single consumer of the event queue. Each iteration pops one event,
//! reduces it, dispatches the resulting Actions synchronously to the turn
//! executor, then emits Signals — no two reduce calls ever run concurrently,
//! so nothing observes a partially updated State. Graceful shutdown drains
//! the queue, cancels in-flight turn processing, and finalizes a turn still
//! in flight so its analytics record is never lost.

use crate::clock::Clock;
use crate::events::{Event, EventKind};
use crate::executor::TurnExecutor;
use crate::reducer::{reduce, ConversationState};
use crate::signals::{names, Signal, SignalBus};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use super::queue::EventQueue;

/// Pops, reduces, dispatches, repeats
pub struct EventLoop {
    queue: Arc<EventQueue>,
    state: ConversationState,
    executor: Arc<TurnExecutor>,
    bus: Arc<SignalBus>,
    clock: Clock,
}

impl EventLoop {
    pub fn new(
        queue: Arc<EventQueue>,
        state: ConversationState,
        executor: Arc<TurnExecutor>,
        bus: Arc<SignalBus>,
        clock: Clock,
    ) -> Self {
        Self {
            queue,
            state,
            executor,
            bus,
            clock,
        }
    }

    /// Run until a Stop command lands or the queue closes
    pub async fn run(mut self) {
        debug!("Event loop started");
        while let Some(event) = self.queue.pop().await {
            self.step(&event);
            if self.state.stopping {
                break;
            }
        }
        self.shutdown().await;
    }

    fn step(&mut self, event: &Event) {
        trace!(kind = event.kind.name(), at_ms = event.at_ms, "reduce");
        let out = reduce(&mut self.state, event);

        // Completion-gate bookkeeping for the turn pipeline. State first, so
        // the gate sees the post-reduce picture of the speech queue.
        match event.kind {
            EventKind::TtsQueueEmpty => self.executor.note_queue_drained(),
            EventKind::AiStreamComplete => self.executor.note_stream_complete(
                self.state.ai_speech_queue.is_empty() && !self.state.is_ai_speaking,
            ),
            _ => {}
        }

        for action in out.actions {
            let name = action.name();
            if let Err(e) = self.executor.dispatch(action) {
                // Fatal for this action only; the session continues.
                error!(action = name, "Action dispatch failed: {:#}", e);
                self.bus.emit(&Signal::new(
                    names::EXECUTOR_ACTION_FAILED,
                    json!({ "action": name, "error": e.to_string() }),
                ));
            }
        }
        for signal in out.signals {
            self.bus.emit(&signal);
        }
    }

    async fn shutdown(&mut self) {
        debug!("Event loop shutting down");
        self.queue.close();
        while let Some(event) = self.queue.try_pop() {
            self.step(&event);
        }
        self.executor.shutdown().await;

        // A turn still open after the drain gets its final analytics record.
        if self.state.turn_active {
            let event = Event::new(
                self.clock.now_ms(),
                EventKind::ResetTurn {
                    turn_id: self.state.turn_id,
                    reason: None,
                    latency: None,
                },
            );
            self.step(&event);
        }
        info!("Event loop stopped");
    }
}
