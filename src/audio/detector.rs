use std::time::Duration;

use crate::config::AudioConfig;

/// Result of feeding one frame into the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// No speech yet; caller keeps discarding frames
    Waiting,
    /// Inside an utterance; caller keeps the frame
    Speaking,
    /// Utterance finished (trailing silence or length cap reached)
    Complete,
}

/// Energy-threshold utterance segmentation
///
/// Speech starts on the first frame whose RMS exceeds the threshold and ends
/// after `pause_threshold` of consecutive quiet frames, or when the utterance
/// reaches `max_phrase`.
#[derive(Debug, Clone)]
pub struct UtteranceDetector {
    floor: f32,
    dynamic_ratio: f32,
    threshold: f32,
    pause_threshold: Duration,
    max_phrase: Duration,
    speaking: bool,
    spoken: Duration,
    silence: Duration,
}

impl UtteranceDetector {
    #[must_use]
    pub const fn new(config: &AudioConfig) -> Self {
        Self {
            floor: config.energy_threshold,
            dynamic_ratio: config.dynamic_energy_ratio,
            threshold: config.energy_threshold,
            pause_threshold: Duration::from_millis(config.pause_threshold_ms),
            max_phrase: Duration::from_secs(config.max_phrase_secs),
            speaking: false,
            spoken: Duration::ZERO,
            silence: Duration::ZERO,
        }
    }

    /// Current speech threshold (RMS)
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Derive the threshold from ambient noise RMS, never going below the configured floor
    pub fn calibrate(&mut self, ambient_rms: f32) {
        let dynamic = ambient_rms * self.dynamic_ratio;
        self.threshold = if dynamic.is_finite() {
            dynamic.max(self.floor)
        } else {
            self.floor
        };
        tracing::debug!(
            ambient_rms = %ambient_rms,
            threshold = %self.threshold,
            "energy threshold calibrated"
        );
    }

    /// Reset per-utterance state, keeping the calibrated threshold
    pub fn reset(&mut self) {
        self.speaking = false;
        self.spoken = Duration::ZERO;
        self.silence = Duration::ZERO;
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one frame's RMS level
    pub fn push_frame(&mut self, rms: f32, frame: Duration) -> Detection {
        let loud = rms > self.threshold;

        if !self.speaking {
            if !loud {
                return Detection::Waiting;
            }
            self.speaking = true;
        }

        self.spoken += frame;
        if loud {
            self.silence = Duration::ZERO;
        } else {
            self.silence += frame;
        }

        if self.silence >= self.pause_threshold || self.spoken >= self.max_phrase {
            Detection::Complete
        } else {
            Detection::Speaking
        }
    }
}

/// Root mean square of a block of samples
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
