/// In-process whisper.cpp backend
pub mod local;
/// OpenAI-compatible HTTP backend
pub mod whisper_api;

pub use local::LocalWhisper;
pub use whisper_api::WhisperApi;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioSample;
use crate::config::{Config, TranscriptionBackend, TranscriptionConfig};

/// Errors that can occur during transcription
#[derive(Debug, Error)]
pub enum TranscriptionError {
    /// The recognition service failed (network, auth, inference)
    #[error("transcription service error: {0:#}")]
    Service(#[from] anyhow::Error),

    /// The request was abandoned because the engine is shutting down
    #[error("transcription cancelled")]
    Cancelled,

    /// Failed to load a local Whisper model
    #[error("failed to load whisper model from {path}: {source}")]
    ModelLoad {
        /// Path to model file
        path: String,
        /// Underlying error
        source: anyhow::Error,
    },

    /// Failed to create Whisper inference state
    #[error("failed to create whisper state")]
    StateCreation,
}

/// Speech-to-text capability consumed by the engine
#[cfg_attr(test, mockall::automock)]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one captured utterance
    ///
    /// # Errors
    /// `Cancelled` once `cancel` fires, `Service` for any backend failure
    fn transcribe(
        &self,
        sample: &AudioSample,
        cancel: &CancellationToken,
    ) -> Result<String, TranscriptionError>;
}

/// Build the backend selected in the config
///
/// # Errors
/// Returns error if the API key is missing or the local model fails to load
pub fn from_config(config: &TranscriptionConfig) -> Result<Box<dyn SpeechToText>> {
    match config.backend {
        TranscriptionBackend::WhisperApi => {
            let api = WhisperApi::from_config(config).context("failed to set up whisper API")?;
            Ok(Box::new(api))
        }
        TranscriptionBackend::Local => {
            let model_path = Config::expand_path(&config.local_model_path)?;
            let engine = LocalWhisper::new(
                &model_path,
                config.threads,
                config.beam_size,
                config.language.clone(),
            )?;
            Ok(Box::new(engine))
        }
    }
}
