use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapRb,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::detector::{rms, Detection, UtteranceDetector};
use super::{AudioSample, AudioSource, CaptureError, TARGET_SAMPLE_RATE};
use crate::config::AudioConfig;

/// How often `listen` wakes up to analyse newly captured audio
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Trait for controlling audio stream lifecycle
trait StreamControl: Send {
    /// Resume audio stream (activate microphone)
    fn play(&self) -> Result<()>;
    /// Pause audio stream (deactivate microphone)
    fn pause(&self) -> Result<()>;
}

/// CPAL stream wrapper implementing `StreamControl`
struct CpalStreamControl {
    stream: cpal::Stream,
}

impl StreamControl for CpalStreamControl {
    fn play(&self) -> Result<()> {
        self.stream.play().context("failed to resume audio stream")
    }

    fn pause(&self) -> Result<()> {
        self.stream.pause().context("failed to pause audio stream")
    }
}

// SAFETY: the stream handle is only touched through play()/pause(), and the
// owning CpalMicrophone is only reachable through the engine's device mutex,
// so calls are never concurrent.
#[allow(unsafe_code)]
unsafe impl Send for CpalStreamControl {}

/// Default input device exposed as an [`AudioSource`]
///
/// The stream stays paused between captures; `calibrate` and `listen`
/// resume it for their duration only.
pub struct CpalMicrophone {
    /// Stream controller (kept alive to prevent stream drop)
    stream_control: Option<Box<dyn StreamControl>>,
    /// Ring buffer consumer for reading captured samples
    ring_buffer_consumer: HeapCons<f32>,
    /// Gate for the input callback
    is_recording: Arc<AtomicBool>,
    device_sample_rate: u32,
    device_channels: u16,
    detector: UtteranceDetector,
    frame: Duration,
}

impl CpalMicrophone {
    /// Opens the default input device
    ///
    /// # Errors
    /// Returns error if default audio device is unavailable or stream creation fails
    pub fn new(config: &AudioConfig) -> Result<Self> {
        info!("initializing microphone");

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("no input device available")?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_owned());
        info!("using input device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .context("failed to get default input config")?;

        let device_sample_rate = supported_config.sample_rate();
        let device_channels = supported_config.channels();

        info!(
            "device config: {} Hz, {} channels",
            device_sample_rate, device_channels
        );

        // listen() drains continuously, so one utterance worth of headroom is plenty
        let capacity_secs = usize::try_from(config.max_phrase_secs.max(1))
            .context("max_phrase_secs too large")?;
        let ring_buffer_capacity =
            (device_sample_rate as usize) * (device_channels as usize) * capacity_secs;
        let ring_buffer = HeapRb::<f32>::new(ring_buffer_capacity);
        let (mut producer, ring_buffer_consumer) = ring_buffer.split();

        let is_recording = Arc::new(AtomicBool::new(false));
        let is_recording_clone = Arc::clone(&is_recording);

        let stream_config = supported_config.into();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if is_recording_clone.load(Ordering::Relaxed) {
                        let pushed = producer.push_slice(data);
                        if pushed < data.len() {
                            warn!("ring buffer full, dropped {} samples", data.len() - pushed);
                        }
                    }
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                },
                None,
            )
            .context("failed to build input stream")?;

        let stream_control = CpalStreamControl { stream };

        // Start the stream and immediately pause it (mic inactive until a capture)
        stream_control.play()?;
        stream_control.pause()?;
        info!("microphone initialized (paused)");

        Ok(Self::from_parts(
            Some(Box::new(stream_control)),
            ring_buffer_consumer,
            is_recording,
            device_sample_rate,
            device_channels,
            config,
        ))
    }

    fn from_parts(
        stream_control: Option<Box<dyn StreamControl>>,
        ring_buffer_consumer: HeapCons<f32>,
        is_recording: Arc<AtomicBool>,
        device_sample_rate: u32,
        device_channels: u16,
        config: &AudioConfig,
    ) -> Self {
        Self {
            stream_control,
            ring_buffer_consumer,
            is_recording,
            device_sample_rate,
            device_channels,
            detector: UtteranceDetector::new(config),
            frame: Duration::from_millis(config.frame_ms.max(1)),
        }
    }

    /// Resume the stream with an empty buffer
    fn open(&mut self) -> Result<()> {
        self.ring_buffer_consumer.clear();
        // Set recording flag BEFORE resuming stream to avoid race condition
        self.is_recording.store(true, Ordering::Relaxed);
        if let Some(stream_control) = &self.stream_control {
            stream_control.play()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.is_recording.store(false, Ordering::Relaxed);
        if let Some(stream_control) = &self.stream_control {
            stream_control.pause()?;
        }
        Ok(())
    }

    fn drain_into(&mut self, buffer: &mut Vec<f32>) {
        while let Some(sample) = self.ring_buffer_consumer.try_pop() {
            buffer.push(sample);
        }
    }

    /// Interleaved samples per analysis frame
    fn frame_len(&self) -> usize {
        let per_sec = u128::from(self.device_sample_rate) * u128::from(self.device_channels);
        let len = per_sec * self.frame.as_millis() / 1000;
        usize::try_from(len)
            .unwrap_or(usize::MAX)
            .max(usize::from(self.device_channels.max(1)))
    }

    fn capture_utterance(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, CaptureError> {
        let started = Instant::now();
        let frame_len = self.frame_len();
        let mut pending = Vec::new();
        let mut utterance = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }

            self.drain_into(&mut pending);

            let mut consumed = 0;
            while pending.len() - consumed >= frame_len {
                let frame = &pending[consumed..consumed + frame_len];
                consumed += frame_len;
                match self.detector.push_frame(rms(frame), self.frame) {
                    Detection::Waiting => {}
                    Detection::Speaking => utterance.extend_from_slice(frame),
                    Detection::Complete => {
                        utterance.extend_from_slice(frame);
                        return Ok(utterance);
                    }
                }
            }
            pending.drain(..consumed);

            if !self.detector.is_speaking() && started.elapsed() >= timeout {
                return Err(CaptureError::NoSpeechTimeout(timeout));
            }

            std::thread::sleep(POLL_SLICE);
        }
    }

    fn convert_to_16khz_mono(&self, samples: &[f32]) -> Vec<f32> {
        let mono = downmix(samples, self.device_channels);
        resample_linear(&mono, self.device_sample_rate, TARGET_SAMPLE_RATE)
    }
}

impl AudioSource for CpalMicrophone {
    fn calibrate(&mut self, duration: Duration) -> Result<(), CaptureError> {
        if duration.is_zero() {
            return Ok(());
        }
        let _span = tracing::debug_span!("calibrate", duration_ms = duration.as_millis()).entered();

        self.open()?;
        std::thread::sleep(duration);
        let mut ambient = Vec::new();
        self.drain_into(&mut ambient);
        self.close()?;

        self.detector.calibrate(rms(&ambient));
        Ok(())
    }

    fn listen(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AudioSample, CaptureError> {
        let _span = tracing::debug_span!("listen", timeout_ms = timeout.as_millis()).entered();
        let start = Instant::now();

        self.detector.reset();
        self.open()?;
        let captured = self.capture_utterance(timeout, cancel);
        if let Err(e) = self.close() {
            warn!("failed to pause microphone: {:#}", e);
        }
        let raw = captured?;

        let samples = self.convert_to_16khz_mono(&raw);
        info!(
            samples = samples.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "utterance captured"
        );
        Ok(AudioSample::new(samples, TARGET_SAMPLE_RATE))
    }
}

/// Average interleaved channels into mono
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels_f64 = f64::from(channels);
    samples
        .chunks(usize::from(channels))
        .map(|frame| {
            let sum: f64 = frame.iter().map(|&s| f64::from(s)).sum();
            // f64 → f32: audio samples are stored as f32, precision sufficient
            #[allow(clippy::cast_possible_truncation)]
            {
                (sum / channels_f64) as f32
            }
        })
        .collect()
}

/// Linear-interpolation resampling
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let output_len = ((samples.len() as f64) / ratio).ceil() as usize;
    let last = samples.len() - 1;

    let resampled: Vec<f32> = (0..output_len)
        .map(|i| {
            let src = (i as f64) * ratio;
            let lo = (src.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let fract = src - src.floor();
            let s1 = f64::from(samples[lo]);
            let s2 = f64::from(samples[hi]);
            s1.mul_add(1.0 - fract, s2 * fract) as f32
        })
        .collect();

    debug!(
        from_rate,
        to_rate,
        input_samples = samples.len(),
        output_samples = resampled.len(),
        "resampled"
    );
    resampled
}
