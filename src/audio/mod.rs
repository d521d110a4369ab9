/// CPAL microphone implementation
pub mod capture;
/// Energy-based utterance segmentation
pub mod detector;

pub use capture::CpalMicrophone;
pub use detector::{Detection, UtteranceDetector};

use anyhow::Context;
use hound::{WavSpec, WavWriter};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Sample rate every captured utterance is converted to
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// One captured utterance (mono f32 PCM)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSample {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioSample {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Length of the utterance
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Sample counts stay far below f64 precision limits
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Encode as a 16-bit PCM WAV file in memory
    ///
    /// # Errors
    /// Returns error if the WAV writer fails
    pub fn to_wav_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                WavWriter::new(&mut cursor, spec).context("failed to create WAV writer")?;
            for &sample in &self.samples {
                // f32 → i16: clamped to [-1, 1] first so the cast cannot overflow
                #[allow(clippy::cast_possible_truncation)]
                let pcm = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                writer
                    .write_sample(pcm)
                    .context("failed to write sample")?;
            }
            writer.finalize().context("failed to finalize WAV data")?;
        }

        Ok(cursor.into_inner())
    }
}

/// Failures of a single capture attempt
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Nobody spoke before the listen timeout elapsed (not a fault)
    #[error("no speech detected within {0:?}")]
    NoSpeechTimeout(Duration),

    /// The capture was abandoned because the engine is shutting down
    #[error("capture cancelled")]
    Cancelled,

    /// The audio device failed
    #[error("audio device error: {0:#}")]
    Device(#[from] anyhow::Error),
}

/// Audio capture capability consumed by the engine
///
/// Implementations own the physical device. The engine serializes access
/// through its device lock, so methods take `&mut self`.
#[cfg_attr(test, mockall::automock)]
pub trait AudioSource: Send {
    /// Sample ambient noise for `duration` and adjust the speech threshold
    ///
    /// # Errors
    /// Returns error if the device cannot be read
    fn calibrate(&mut self, duration: Duration) -> Result<(), CaptureError>;

    /// Block until one utterance is captured
    ///
    /// # Errors
    /// `NoSpeechTimeout` if speech does not start within `timeout`,
    /// `Cancelled` once `cancel` fires, `Device` on hardware failure
    fn listen(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AudioSample, CaptureError>;
}
