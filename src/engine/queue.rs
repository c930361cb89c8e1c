//! Bounded, ordered event queue
//!
//! The single channel into the turn-taking core. Producers push from any
//! task; one consumer (the event loop) pops in strict arrival order.
//! Backpressure follows the audio contract: when the queue is full the
//! oldest audio frame is dropped and reported; Ticks are coalesced with the
//! newest pending Tick and are never dropped.

use crate::clock::Clock;
use crate::events::{Event, EventKind};
use crate::signals::{names, Signal, SignalBus};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{trace, warn};

/// What happened to a pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Merged into the pending Tick at the back of the queue
    CoalescedTick,
    /// Enqueued, but the oldest audio frame was evicted to make room
    DroppedOldestAudio,
    /// The queue was closed; the event was discarded
    Closed,
}

struct Inner {
    deque: VecDeque<Event>,
    closed: bool,
}

/// MPSC event queue with audio-aware backpressure
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity.min(256)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(4),
        }
    }

    /// Enqueue one event, applying coalescing and eviction rules
    pub fn push(&self, event: Event) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock().expect("event queue poisoned");
            if inner.closed {
                return PushOutcome::Closed;
            }

            if event.kind == EventKind::Tick {
                if let Some(back) = inner.deque.back_mut() {
                    if back.kind == EventKind::Tick {
                        back.at_ms = event.at_ms;
                        return PushOutcome::CoalescedTick;
                    }
                }
            }

            let mut outcome = PushOutcome::Enqueued;
            if inner.deque.len() >= self.capacity {
                let victim = inner
                    .deque
                    .iter()
                    .position(|e| matches!(e.kind, EventKind::AudioFrame { .. }));
                if let Some(idx) = victim {
                    inner.deque.remove(idx);
                    outcome = PushOutcome::DroppedOldestAudio;
                    trace!("Event queue full, dropped oldest audio frame");
                } else {
                    warn!(len = inner.deque.len(), "Event queue over capacity");
                }
            }
            inner.deque.push_back(event);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next event; `None` once closed and drained
    pub async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut inner = self.inner.lock().expect("event queue poisoned");
                if let Some(event) = inner.deque.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, used while draining at shutdown
    pub fn try_pop(&self) -> Option<Event> {
        self.inner
            .lock()
            .expect("event queue poisoned")
            .deque
            .pop_front()
    }

    /// Refuse further pushes and wake the consumer
    pub fn close(&self) {
        self.inner.lock().expect("event queue poisoned").closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable producer handle: stamps timestamps and reports drops
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
    clock: Clock,
    bus: Arc<SignalBus>,
}

impl EventSink {
    pub fn new(queue: Arc<EventQueue>, clock: Clock, bus: Arc<SignalBus>) -> Self {
        Self { queue, clock, bus }
    }

    /// Stamp and enqueue an event
    pub fn push(&self, kind: EventKind) {
        let at_ms = self.clock.now_ms();
        self.push_at(at_ms, kind);
    }

    /// Enqueue with an explicit timestamp
    pub fn push_at(&self, at_ms: u64, kind: EventKind) {
        match self.queue.push(Event::new(at_ms, kind)) {
            PushOutcome::DroppedOldestAudio => {
                self.bus.emit(&Signal::new(
                    names::AUDIO_FRAME_DROPPED,
                    json!({ "at_ms": at_ms }),
                ));
            }
            PushOutcome::Closed => trace!("Event discarded after queue close"),
            _ => {}
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tick(at_ms: u64) -> Event {
        Event::new(at_ms, EventKind::Tick)
    }

    fn frame(at_ms: u64) -> Event {
        Event::new(
            at_ms,
            EventKind::AudioFrame {
                samples: Arc::new(vec![0.0; 512]),
                is_speech: false,
            },
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new(16);
        queue.push(Event::new(1, EventKind::VadSpeechStart));
        queue.push(Event::new(2, EventKind::VadSpeechStop));
        assert_eq!(queue.pop().await.unwrap().at_ms, 1);
        assert_eq!(queue.pop().await.unwrap().at_ms, 2);
    }

    #[test]
    fn test_ticks_coalesce() {
        let queue = EventQueue::new(16);
        assert_eq!(queue.push(tick(100)), PushOutcome::Enqueued);
        assert_eq!(queue.push(tick(200)), PushOutcome::CoalescedTick);
        assert_eq!(queue.len(), 1);
        // The surviving tick carries the newest timestamp.
        assert_eq!(queue.try_pop().unwrap().at_ms, 200);
    }

    #[test]
    fn test_tick_does_not_coalesce_across_other_events() {
        let queue = EventQueue::new(16);
        queue.push(tick(100));
        queue.push(Event::new(150, EventKind::VadSpeechStart));
        assert_eq!(queue.push(tick(200)), PushOutcome::Enqueued);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_full_queue_evicts_oldest_audio() {
        let queue = EventQueue::new(4);
        queue.push(frame(1));
        queue.push(Event::new(2, EventKind::VadSpeechStart));
        queue.push(frame(3));
        queue.push(frame(4));
        assert_eq!(queue.push(frame(5)), PushOutcome::DroppedOldestAudio);
        assert_eq!(queue.len(), 4);
        // The non-audio event survived; the frame at t=1 is gone.
        let first = queue.try_pop().unwrap();
        assert_eq!(first.at_ms, 2);
    }

    #[test]
    fn test_full_queue_never_drops_non_audio() {
        let queue = EventQueue::new(2);
        queue.push(Event::new(1, EventKind::VadSpeechStart));
        queue.push(Event::new(2, EventKind::VadSpeechStop));
        assert_eq!(
            queue.push(Event::new(3, EventKind::ProcessTurn)),
            PushOutcome::Enqueued
        );
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = EventQueue::new(16);
        queue.push(tick(1));
        queue.close();
        assert_eq!(queue.push(tick(2)), PushOutcome::Closed);
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(16));
        let popped = Arc::new(AtomicUsize::new(0));
        let queue_clone = queue.clone();
        let popped_clone = popped.clone();
        let consumer = tokio::spawn(async move {
            while queue_clone.pop().await.is_some() {
                popped_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        queue.push(tick(1));
        queue.push(Event::new(2, EventKind::VadSpeechStart));
        tokio::task::yield_now().await;
        queue.close();
        consumer.await.unwrap();
        assert_eq!(popped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sink_reports_dropped_frames() {
        let bus = Arc::new(SignalBus::new());
        let drops = Arc::new(AtomicUsize::new(0));
        let drops_clone = drops.clone();
        bus.subscribe(names::AUDIO_FRAME_DROPPED, move |_| {
            drops_clone.fetch_add(1, Ordering::SeqCst);
        });
        let queue = Arc::new(EventQueue::new(4));
        let sink = EventSink::new(queue, Clock::manual(), bus);
        for _ in 0..6 {
            sink.push(EventKind::AudioFrame {
                samples: Arc::new(vec![0.0; 512]),
                is_speech: false,
            });
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
