use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{AudioSource, CaptureError};
use crate::transcription::{SpeechToText, TranscriptionError};

/// Parameters for one [`recognize_once`] cycle
#[derive(Clone, Copy)]
pub struct RecognizeOptions<'a> {
    timeout: Duration,
    calibration: Duration,
    to_lower: bool,
    on_start: Option<&'a (dyn Fn() + Sync)>,
    on_end: Option<&'a (dyn Fn() + Sync)>,
}

impl<'a> RecognizeOptions<'a> {
    /// Wait at most `timeout` for speech to start; lowercase the transcript
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            calibration: Duration::from_secs(1),
            to_lower: true,
            on_start: None,
            on_end: None,
        }
    }

    /// Ambient-noise sampling before listening
    #[must_use]
    pub const fn calibration(mut self, duration: Duration) -> Self {
        self.calibration = duration;
        self
    }

    /// Return the transcript exactly as the backend produced it
    #[must_use]
    pub const fn keep_case(mut self) -> Self {
        self.to_lower = false;
        self
    }

    /// Called right before the blocking listen (e.g. show a "speak now" indicator)
    #[must_use]
    pub const fn on_start(mut self, hook: &'a (dyn Fn() + Sync)) -> Self {
        self.on_start = Some(hook);
        self
    }

    /// Called once listening is over, whether or not speech was captured
    #[must_use]
    pub const fn on_end(mut self, hook: &'a (dyn Fn() + Sync)) -> Self {
        self.on_end = Some(hook);
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Calibrate, listen and transcribe once on a device the caller already holds
///
/// Takes the device by `&mut` so it can run inside a modal command, which
/// already owns the device lock. Returns `Ok(None)` when the transcription
/// service fails.
///
/// # Errors
/// `NoSpeechTimeout` when nobody spoke within the timeout, `Device` on
/// hardware failure, `Cancelled` once `cancel` fires
pub fn recognize_once(
    device: &mut dyn AudioSource,
    speech: &dyn SpeechToText,
    options: &RecognizeOptions<'_>,
    cancel: &CancellationToken,
) -> Result<Option<String>, CaptureError> {
    let _span = tracing::debug_span!("recognize_once", timeout_ms = options.timeout.as_millis())
        .entered();

    device.calibrate(options.calibration)?;

    if let Some(on_start) = options.on_start {
        on_start();
    }
    let captured = device.listen(options.timeout, cancel);
    if let Some(on_end) = options.on_end {
        on_end();
    }
    let sample = captured?;

    match speech.transcribe(&sample, cancel) {
        Ok(text) => {
            let text = if options.to_lower {
                text.to_lowercase()
            } else {
                text
            };
            debug!(transcript = %text, "single-shot recognition finished");
            Ok(Some(text))
        }
        Err(TranscriptionError::Cancelled) => Err(CaptureError::Cancelled),
        Err(e) => {
            warn!(error = %e, "could not get results from transcription service");
            Ok(None)
        }
    }
}
