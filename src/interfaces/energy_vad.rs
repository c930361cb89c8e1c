//! Energy-based voice activity detection
//!
//! Frame-by-frame RMS analysis with an adaptive noise floor, onset counting
//! so isolated pops do not open a turn, and a hangover period so natural
//! micro-pauses do not close one.
//!
//! ```text
//! Silence → MaybeSpeech → Speech → SpeechEnding → Silence
//!            (onset)                (hangover)
//! ```

use super::{SpeechEdge, Vad, VadDecision};
use tracing::{debug, trace};

/// Frames of consecutive speech required before the decision flips on
const DEFAULT_ONSET_FRAMES: usize = 2;
/// Frames of consecutive silence tolerated before the decision flips off
const DEFAULT_HANGOVER_FRAMES: usize = 8;
/// Threshold in dB above the adaptive noise floor
const DEFAULT_THRESHOLD_DB: f32 = 12.0;

/// Configuration for [`EnergyVad`]
#[derive(Debug, Clone, Copy)]
pub struct EnergyVadConfig {
    /// dB above the noise floor a frame must reach to count as speech
    pub threshold_db: f32,
    /// Consecutive speech frames required to open
    pub onset_frames: usize,
    /// Consecutive silence frames required to close
    pub hangover_frames: usize,
    /// Adapt the noise floor toward quiet frames
    pub adaptive_noise_floor: bool,
    /// Noise floor adaptation rate in (0.0, 1.0)
    pub adaptation_rate: f32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            threshold_db: DEFAULT_THRESHOLD_DB,
            onset_frames: DEFAULT_ONSET_FRAMES,
            hangover_frames: DEFAULT_HANGOVER_FRAMES,
            adaptive_noise_floor: true,
            adaptation_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Silence,
    MaybeSpeech,
    Speech,
    SpeechEnding,
}

/// Adaptive energy detector implementing [`Vad`]
pub struct EnergyVad {
    config: EnergyVadConfig,
    noise_floor: f32,
    phase: Phase,
    consecutive_speech: usize,
    consecutive_silence: usize,
    smoothed: bool,
    frame_count: u64,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self::with_config(EnergyVadConfig::default())
    }

    pub fn with_config(config: EnergyVadConfig) -> Self {
        Self {
            config,
            noise_floor: 1e-6,
            phase: Phase::Silence,
            consecutive_speech: 0,
            consecutive_silence: 0,
            smoothed: false,
            frame_count: 0,
        }
    }

    /// The decision after onset/hangover smoothing
    pub fn is_speech(&self) -> bool {
        self.smoothed
    }

    /// Current noise floor in dB
    pub fn noise_floor_db(&self) -> f32 {
        10.0 * self.noise_floor.log10().max(-100.0)
    }

    fn frame_is_speech(&mut self, energy: f32) -> bool {
        let threshold = self.noise_floor * 10f32.powf(self.config.threshold_db / 10.0);
        if self.config.adaptive_noise_floor && energy < threshold {
            self.noise_floor = self.noise_floor * (1.0 - self.config.adaptation_rate)
                + energy * self.config.adaptation_rate;
        }
        energy > threshold
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl Vad for EnergyVad {
    fn process_frame(&mut self, samples: &[f32]) -> VadDecision {
        let energy = rms(samples);
        let frame_speech = self.frame_is_speech(energy);
        self.frame_count += 1;

        if frame_speech {
            self.consecutive_speech += 1;
            self.consecutive_silence = 0;
        } else {
            self.consecutive_silence += 1;
            self.consecutive_speech = 0;
        }

        self.phase = match self.phase {
            Phase::Silence if frame_speech => Phase::MaybeSpeech,
            Phase::Silence => Phase::Silence,
            Phase::MaybeSpeech if !frame_speech => Phase::Silence,
            Phase::MaybeSpeech if self.consecutive_speech >= self.config.onset_frames => {
                Phase::Speech
            }
            Phase::MaybeSpeech => Phase::MaybeSpeech,
            Phase::Speech if frame_speech => Phase::Speech,
            Phase::Speech => Phase::SpeechEnding,
            Phase::SpeechEnding if frame_speech => Phase::Speech,
            Phase::SpeechEnding if self.consecutive_silence >= self.config.hangover_frames => {
                Phase::Silence
            }
            Phase::SpeechEnding => Phase::SpeechEnding,
        };

        let now_speaking = matches!(self.phase, Phase::Speech | Phase::SpeechEnding);
        let edge = if now_speaking != self.smoothed {
            self.smoothed = now_speaking;
            if now_speaking {
                debug!(frame = self.frame_count, "Speech started");
                Some(SpeechEdge::Started)
            } else {
                debug!(frame = self.frame_count, "Speech ended");
                Some(SpeechEdge::Stopped)
            }
        } else {
            None
        };

        trace!(
            frame = self.frame_count,
            energy,
            frame_speech,
            smoothed = self.smoothed,
            "vad frame"
        );

        VadDecision {
            is_speech: frame_speech,
            edge,
        }
    }

    fn reset(&mut self) {
        self.noise_floor = 1e-6;
        self.phase = Phase::Silence;
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.smoothed = false;
        self.frame_count = 0;
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
