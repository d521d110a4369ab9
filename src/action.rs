use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioSource, CaptureError};
use crate::recognize::{recognize_once, RecognizeOptions};
use crate::transcription::SpeechToText;

/// Side-effect callback run around a command (e.g. show/hide a progress indicator)
pub type Hook = Box<dyn Fn() + Send + Sync>;

type ImmediateFn = dyn Fn(&str) -> anyhow::Result<()> + Send + Sync;
type ModalFn = dyn Fn(&str, &mut ModalContext<'_>) -> anyhow::Result<()> + Send + Sync;

/// What a trigger does once dispatched; receives the transcript that fired it
pub enum CommandAction {
    /// Runs without the capture device; background listening carries on
    Immediate(Box<ImmediateFn>),
    /// Owns the capture device while it runs; commands queued meanwhile are dropped
    Modal(Box<ModalFn>),
}

impl CommandAction {
    pub fn immediate<F>(action: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Immediate(Box::new(action))
    }

    pub fn modal<F>(action: F) -> Self
    where
        F: Fn(&str, &mut ModalContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Modal(Box::new(action))
    }

    #[must_use]
    pub const fn is_modal(&self) -> bool {
        matches!(self, Self::Modal(_))
    }
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(_) => f.write_str("Immediate"),
            Self::Modal(_) => f.write_str("Modal"),
        }
    }
}

/// Capabilities handed to a modal action
///
/// The device is already locked for the duration of the action, so follow-up
/// captures go through this context instead of the engine.
pub struct ModalContext<'a> {
    device: &'a mut dyn AudioSource,
    speech: &'a dyn SpeechToText,
    cancel: &'a CancellationToken,
    calibration: Duration,
}

impl<'a> ModalContext<'a> {
    pub(crate) fn new(
        device: &'a mut dyn AudioSource,
        speech: &'a dyn SpeechToText,
        cancel: &'a CancellationToken,
        calibration: Duration,
    ) -> Self {
        Self {
            device,
            speech,
            cancel,
            calibration,
        }
    }

    /// Ask a follow-up question: one listen/transcribe cycle on the held device
    ///
    /// # Errors
    /// See [`recognize_once`]
    pub fn recognize(&mut self, timeout: Duration) -> Result<Option<String>, CaptureError> {
        let options = RecognizeOptions::new(timeout).calibration(self.calibration);
        self.recognize_with(&options)
    }

    /// Like [`Self::recognize`] with caller-supplied hooks and options
    ///
    /// # Errors
    /// See [`recognize_once`]
    pub fn recognize_with(
        &mut self,
        options: &RecognizeOptions<'_>,
    ) -> Result<Option<String>, CaptureError> {
        recognize_once(&mut *self.device, self.speech, options, self.cancel)
    }

    /// Raw access to the locked device
    pub fn device(&mut self) -> &mut dyn AudioSource {
        &mut *self.device
    }

    #[must_use]
    pub fn speech(&self) -> &dyn SpeechToText {
        self.speech
    }

    /// Set once the engine is stopping; long-running actions should return early
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }
}
