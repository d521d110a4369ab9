//! Voice Trigger - spoken-phrase command dispatch
//!
//! Listens on a microphone, transcribes each utterance and runs the commands
//! whose trigger phrases appear in the transcript.

/// Command actions and the modal context
pub mod action;
/// Audio capture and processing
pub mod audio;
/// Configuration management
pub mod config;
/// Capture loop, dispatcher and engine lifecycle
pub mod engine;
/// Single-shot listen-and-transcribe
pub mod recognize;
/// Trigger registration and phrase matching
pub mod registry;
/// Logging setup
pub mod telemetry;
/// Speech-to-text backends
pub mod transcription;

pub use action::{CommandAction, ModalContext};
pub use audio::{AudioSample, AudioSource, CaptureError};
pub use engine::{EngineError, EngineSettings, VoiceEngine};
pub use recognize::{recognize_once, RecognizeOptions};
pub use registry::{Trigger, TriggerId, TriggerRegistry};
pub use transcription::{SpeechToText, TranscriptionError};
