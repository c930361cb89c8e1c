//! Audio producer
//!
//! Pulls 512-sample frames from the capture source at real-time cadence
//! (32 ms at 16 kHz), runs each through the VAD, feeds speech into the
//! recognizer, and emits `AudioFrame`/`VadSpeechStart`/`VadSpeechStop`,
//! `AsrPartial`, and `Tick` events. It never blocks the event loop: frames
//! land on the bounded queue, which evicts the oldest audio under pressure
//! and coalesces Ticks.

use crate::engine::EventSink;
use crate::events::EventKind;
use crate::interfaces::{AudioSource, SharedAsr, SpeechEdge, Vad};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Producer cadence configuration
#[derive(Debug, Clone)]
pub struct AudioProducerConfig {
    /// Frame period: 512 samples at 16 kHz
    pub frame_interval_ms: u64,
    /// Emit a Tick every N frames (3 frames = ~96 ms, comfortably >= 10 Hz)
    pub tick_every_frames: u64,
    /// Poll the recognizer for partials every N speech frames
    pub partial_poll_frames: u64,
    /// Pace frames against the wall clock; tests run unpaced on a manual clock
    pub realtime: bool,
    /// Ticks emitted after the source is exhausted, so pending silence and
    /// safety thresholds still fire in scripted runs
    pub trailing_ticks: u64,
}

impl Default for AudioProducerConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 32,
            tick_every_frames: 3,
            partial_poll_frames: 5,
            realtime: true,
            trailing_ticks: 0,
        }
    }
}

/// Streams capture frames into the event queue
pub struct AudioProducer {
    source: Box<dyn AudioSource>,
    vad: Box<dyn Vad>,
    asr: Option<SharedAsr>,
    sink: EventSink,
    config: AudioProducerConfig,
}

impl AudioProducer {
    pub fn new(
        source: Box<dyn AudioSource>,
        vad: Box<dyn Vad>,
        asr: Option<SharedAsr>,
        sink: EventSink,
        config: AudioProducerConfig,
    ) -> Self {
        Self {
            source,
            vad,
            asr,
            sink,
            config,
        }
    }

    pub async fn run(mut self) {
        let mut interval = self.config.realtime.then(|| {
            tokio::time::interval(Duration::from_millis(self.config.frame_interval_ms.max(1)))
        });
        let mut frame_index: u64 = 0;

        while let Some(frame) = self.source.next_frame() {
            match interval.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => {
                    // Unpaced run: step the manual clock by one frame period.
                    self.sink.clock().advance(self.config.frame_interval_ms);
                }
            }

            let decision = self.vad.process_frame(&frame);
            match decision.edge {
                Some(SpeechEdge::Started) => self.sink.push(EventKind::VadSpeechStart),
                Some(SpeechEdge::Stopped) => self.sink.push(EventKind::VadSpeechStop),
                None => {}
            }

            if decision.is_speech {
                if let Some(asr) = &self.asr {
                    let mut asr = asr.lock().await;
                    if let Err(e) = asr.feed(&frame).await {
                        warn!("Recognizer feed failed: {:#}", e);
                    }
                    if frame_index % self.config.partial_poll_frames.max(1) == 0 {
                        match asr.poll_partial().await {
                            Ok(Some(text)) => self.sink.push(EventKind::AsrPartial { text }),
                            Ok(None) => {}
                            Err(e) => warn!("Recognizer poll failed: {:#}", e),
                        }
                    }
                }
            }

            self.sink.push(EventKind::AudioFrame {
                samples: Arc::new(frame),
                is_speech: decision.is_speech,
            });

            frame_index += 1;
            if frame_index % self.config.tick_every_frames.max(1) == 0 {
                self.sink.push(EventKind::Tick);
            }
        }

        debug!(frames = frame_index, "Audio source exhausted");
        let tick_period = self.config.frame_interval_ms * self.config.tick_every_frames.max(1);
        for _ in 0..self.config.trailing_ticks {
            match interval.as_mut() {
                Some(interval) => {
                    for _ in 0..self.config.tick_every_frames.max(1) {
                        interval.tick().await;
                    }
                }
                None => self.sink.clock().advance(tick_period),
            }
            self.sink.push(EventKind::Tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::engine::queue::EventQueue;
    use crate::interfaces::doubles::{ScriptedAudioSource, ThresholdVad};
    use crate::signals::SignalBus;

    fn unpaced(trailing_ticks: u64) -> AudioProducerConfig {
        AudioProducerConfig {
            realtime: false,
            trailing_ticks,
            ..Default::default()
        }
    }

    async fn drain(queue: &EventQueue) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Some(event) = queue.try_pop() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_edges_and_frames_emitted() {
        let queue = Arc::new(EventQueue::new(1024));
        let sink = EventSink::new(queue.clone(), Clock::manual(), Arc::new(SignalBus::new()));
        let source = ScriptedAudioSource::new()
            .with_span(0.0, 3)
            .with_span(0.5, 4)
            .with_span(0.0, 3);
        let producer = AudioProducer::new(
            Box::new(source),
            Box::new(ThresholdVad::new(0.1)),
            None,
            sink,
            unpaced(0),
        );
        producer.run().await;

        let kinds = drain(&queue).await;
        let starts = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::VadSpeechStart))
            .count();
        let stops = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::VadSpeechStop))
            .count();
        let frames = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::AudioFrame { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(stops, 1);
        assert_eq!(frames, 10);
    }

    #[tokio::test]
    async fn test_unpaced_run_advances_manual_clock() {
        let clock = Clock::manual();
        let queue = Arc::new(EventQueue::new(1024));
        let sink = EventSink::new(queue.clone(), clock.clone(), Arc::new(SignalBus::new()));
        let source = ScriptedAudioSource::new().with_span(0.0, 10);
        let producer = AudioProducer::new(
            Box::new(source),
            Box::new(ThresholdVad::new(0.1)),
            None,
            sink,
            unpaced(2),
        );
        producer.run().await;
        // 10 frames * 32ms + 2 trailing ticks * 96ms
        assert_eq!(clock.now_ms(), 10 * 32 + 2 * 96);
    }

    #[tokio::test]
    async fn test_trailing_ticks_after_exhaustion() {
        let queue = Arc::new(EventQueue::new(16));
        let sink = EventSink::new(queue.clone(), Clock::manual(), Arc::new(SignalBus::new()));
        let source = ScriptedAudioSource::new().with_span(0.0, 1);
        let producer = AudioProducer::new(
            Box::new(source),
            Box::new(ThresholdVad::new(0.1)),
            None,
            sink,
            unpaced(5),
        );
        producer.run().await;
        let kinds = drain(&queue).await;
        // Consecutive ticks coalesce in the queue; at least one must survive
        // and carry the final timestamp.
        assert!(kinds.iter().any(|k| matches!(k, EventKind::Tick)));
    }
}
