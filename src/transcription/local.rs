use anyhow::{anyhow, Context};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::{SpeechToText, TranscriptionError};
use crate::audio::{AudioSample, TARGET_SAMPLE_RATE};

/// In-process Whisper model (whisper.cpp via `whisper-rs`)
pub struct LocalWhisper {
    /// Whisper context (thread-safe)
    ctx: Arc<Mutex<WhisperContext>>,
    /// Number of CPU threads for inference
    threads: i32,
    /// Beam search width
    beam_size: i32,
    /// Language code (None = auto-detect)
    language: Option<String>,
}

impl LocalWhisper {
    /// Determines sampling strategy based on beam size (pure, testable)
    const fn get_sampling_strategy(beam_size: i32) -> SamplingStrategy {
        if beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

    /// Loads the model at `model_path`
    ///
    /// # Errors
    /// Returns error if model file doesn't exist, is invalid, or if `threads`/`beam_size`
    /// are zero or exceed `i32::MAX`
    pub fn new(
        model_path: &Path,
        threads: usize,
        beam_size: usize,
        language: Option<String>,
    ) -> Result<Self, TranscriptionError> {
        let model_error = |source: anyhow::Error| TranscriptionError::ModelLoad {
            path: model_path.display().to_string(),
            source,
        };

        if threads == 0 {
            return Err(model_error(anyhow!("threads must be > 0")));
        }
        if beam_size == 0 {
            return Err(model_error(anyhow!("beam_size must be > 0")));
        }

        // whisper-rs takes i32 for both
        let threads_i32 = i32::try_from(threads)
            .map_err(|_| model_error(anyhow!("threads value too large (max: {})", i32::MAX)))?;
        let beam_size_i32 = i32::try_from(beam_size)
            .map_err(|_| model_error(anyhow!("beam_size value too large (max: {})", i32::MAX)))?;

        tracing::info!(
            path = %model_path.display(),
            threads = threads,
            beam_size = beam_size,
            language = ?language,
            "loading whisper model"
        );

        let path_str = model_path
            .to_str()
            .ok_or_else(|| model_error(anyhow!("model path contains invalid UTF-8")))?;

        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| model_error(anyhow!("{e:?}")))?;

        tracing::info!("whisper model loaded successfully");

        Ok(Self {
            ctx: Arc::new(Mutex::new(ctx)),
            threads: threads_i32,
            beam_size: beam_size_i32,
            language,
        })
    }

    fn run_inference(&self, audio_data: &[f32]) -> Result<String, TranscriptionError> {
        let mut state = self
            .ctx
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {e}"))?
            .create_state()
            .map_err(|_| TranscriptionError::StateCreation)?;

        let mut params = FullParams::new(Self::get_sampling_strategy(self.beam_size));
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(self.language.as_deref());
        params.set_translate(false);

        let start = std::time::Instant::now();
        state
            .full(params, audio_data)
            .context("whisper inference failed")?;

        let mut result = String::new();
        for segment in state.as_iter() {
            result.push_str(&segment.to_string());
        }
        let result = result.trim().to_owned();

        tracing::info!(
            segments = state.full_n_segments(),
            text_len = result.len(),
            inference_ms = start.elapsed().as_millis(),
            "transcription completed"
        );

        Ok(result)
    }
}

impl SpeechToText for LocalWhisper {
    fn transcribe(
        &self,
        sample: &AudioSample,
        cancel: &CancellationToken,
    ) -> Result<String, TranscriptionError> {
        let _span =
            tracing::debug_span!("local_whisper", samples = sample.samples().len()).entered();

        if sample.sample_rate() != TARGET_SAMPLE_RATE {
            return Err(anyhow!(
                "local whisper expects {TARGET_SAMPLE_RATE} Hz audio, got {} Hz",
                sample.sample_rate()
            )
            .into());
        }
        if cancel.is_cancelled() {
            return Err(TranscriptionError::Cancelled);
        }

        let text = self.run_inference(sample.samples())?;

        // Inference cannot be interrupted; drop the result if shutdown started meanwhile
        if cancel.is_cancelled() {
            return Err(TranscriptionError::Cancelled);
        }
        Ok(text)
    }
}

// SAFETY: LocalWhisper is thread-safe because:
// 1. WhisperContext is wrapped in Arc<Mutex<>>, ensuring exclusive access
// 2. All methods require acquiring the mutex lock before accessing the context
// 3. No shared mutable state exists outside the mutex
#[allow(unsafe_code)]
unsafe impl Send for LocalWhisper {}
#[allow(unsafe_code)]
unsafe impl Sync for LocalWhisper {}
