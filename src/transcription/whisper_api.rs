use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use std::fs;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{SpeechToText, TranscriptionError};
use crate::audio::AudioSample;
use crate::config::{Config, TranscriptionConfig};

/// How often a waiting caller checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Whisper transcription over an OpenAI-compatible HTTP endpoint
///
/// Requests run on a helper thread so that a shutdown can abandon a slow
/// request without waiting for the network; the request itself is bounded
/// by the client timeout.
pub struct WhisperApi {
    client: Client,
    endpoint: String,
    model: String,
    language: Option<String>,
    api_key: String,
}

impl WhisperApi {
    /// Build from config, resolving the API key from the environment or key file
    ///
    /// # Errors
    /// Returns error if no API key can be found or the HTTP client fails to build
    pub fn from_config(config: &TranscriptionConfig) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build HTTP client")?;

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            timeout_s = config.request_timeout_secs,
            "whisper API backend ready"
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
            api_key,
        })
    }

    fn build_form(&self, sample: &AudioSample) -> Result<multipart::Form> {
        let wav = sample.to_wav_bytes()?;
        let file = multipart::Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")
            .context("invalid audio mime type")?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }
        Ok(form)
    }
}

fn send_request(
    client: &Client,
    endpoint: &str,
    api_key: &str,
    form: multipart::Form,
) -> Result<String> {
    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .context("transcription request failed")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        bail!("transcription endpoint returned {status}: {body}");
    }

    let parsed: TranscriptionResponse = response
        .json()
        .context("failed to decode transcription response")?;
    Ok(parsed.text.trim().to_owned())
}

impl SpeechToText for WhisperApi {
    fn transcribe(
        &self,
        sample: &AudioSample,
        cancel: &CancellationToken,
    ) -> Result<String, TranscriptionError> {
        let _span =
            tracing::debug_span!("whisper_api", samples = sample.samples().len()).entered();

        if cancel.is_cancelled() {
            return Err(TranscriptionError::Cancelled);
        }

        let form = self.build_form(sample)?;
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let start = Instant::now();

        std::thread::Builder::new()
            .name("whisper-request".to_owned())
            .spawn(move || {
                // Receiver is gone if the caller was cancelled; nothing to report then
                let _ = tx.send(send_request(&client, &endpoint, &api_key, form));
            })
            .context("failed to spawn request thread")?;

        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => {
                    let text = result?;
                    tracing::info!(
                        text_len = text.len(),
                        request_ms = start.elapsed().as_millis(),
                        "transcription completed"
                    );
                    return Ok(text);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        tracing::debug!("abandoning in-flight transcription request");
                        return Err(TranscriptionError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("request thread exited without a result").into());
                }
            }
        }
    }
}

/// Environment variable first, then the key file
fn resolve_api_key(config: &TranscriptionConfig) -> Result<String> {
    if let Ok(key) = std::env::var(&config.api_key_env) {
        let key = key.trim();
        if !key.is_empty() {
            return Ok(key.to_owned());
        }
    }

    if let Some(path) = &config.api_key_file {
        let path = Config::expand_path(path)?;
        let key = fs::read_to_string(&path)
            .with_context(|| format!("failed to read API key file {}", path.display()))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("API key file {} is empty", path.display());
        }
        return Ok(key.to_owned());
    }

    bail!(
        "no API key: set {} or configure transcription.api_key_file",
        config.api_key_env
    )
}
