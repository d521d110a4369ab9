//! Trigger-phrase dispatch engine
//!
//! Two workers share one engine:
//! - the capture loop listens on the device, transcribes, matches the
//!   transcript against the registry and queues the winning triggers;
//! - the dispatcher drains the queue and runs each trigger's action.
//!
//! A modal action holds the device lock while it runs (so it can ask
//! follow-up questions), and anything queued during it is discarded.

mod capture_loop;
/// Device lock guarding the capture device
pub mod device;
mod dispatcher;
/// Command FIFO shared by the workers
pub mod queue;

pub use device::{DeviceGuard, DeviceLock};
pub use queue::{CommandQueue, QueueEntry};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::action::Hook;
use crate::audio::{AudioSource, CaptureError};
use crate::config::EngineConfig;
use crate::recognize::{recognize_once, RecognizeOptions};
use crate::registry::{TriggerId, TriggerRegistry};
use crate::transcription::SpeechToText;

#[derive(Debug, Error)]
pub enum EngineError {
    /// `trigger()` was given a phrase no trigger owns
    #[error("phrase {0:?} is not registered")]
    NotFound(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("failed to spawn {name} worker")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Worker timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Maximum wait for speech to start in one capture cycle
    pub listen_window: Duration,
    /// Sleep between capture cycles and dispatcher wake-ups
    pub poll_interval: Duration,
    /// Ambient noise sampling before each listen
    pub ambient_calibration: Duration,
    /// Initial state of the background capture loop
    pub background_listening: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            listen_window: config.listen_window(),
            poll_interval: config.poll_interval(),
            ambient_calibration: config.ambient_calibration(),
            background_listening: config.background_listening,
        }
    }
}

/// State both workers and the owning thread see
struct Shared {
    registry: TriggerRegistry,
    queue: CommandQueue,
    device: DeviceLock,
    speech: Box<dyn SpeechToText>,
    settings: EngineSettings,
    modal: AtomicBool,
    background_listening: AtomicBool,
}

impl Shared {
    fn is_modal(&self) -> bool {
        self.modal.load(Ordering::SeqCst)
    }

    fn background_listening(&self) -> bool {
        self.background_listening.load(Ordering::SeqCst)
    }

    /// Match a transcript and queue every winner
    ///
    /// All wait-start hooks run before the first entry is queued, so none of
    /// the winners can be dispatched before every hook has fired.
    fn enqueue_matches(&self, transcript: &str) -> usize {
        let transcript = transcript.to_lowercase();
        let winners = self.registry.match_transcript(&transcript);
        if winners.is_empty() {
            debug!(transcript = %transcript, "no trigger phrase matched");
            return 0;
        }

        for &id in &winners {
            if let Some(trigger) = self.registry.get(id) {
                invoke_hook(id, "on_wait_start", trigger.wait_start_hook());
            }
        }
        for &id in &winners {
            let sequence = self.queue.push(id, transcript.clone());
            info!(trigger = %id, sequence, transcript = %transcript, "command queued");
        }
        winners.len()
    }
}

struct Workers {
    cancel: CancellationToken,
    capture: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Owns the registry, queue and device; runs the two workers between
/// [`start`](Self::start) and [`stop`](Self::stop)
///
/// Dropping a running engine stops it.
pub struct VoiceEngine {
    shared: Arc<Shared>,
    workers: Option<Workers>,
}

impl VoiceEngine {
    /// Take ownership of a fully registered trigger set and the capabilities
    #[must_use]
    pub fn new(
        settings: EngineSettings,
        registry: TriggerRegistry,
        device: Box<dyn AudioSource>,
        speech: Box<dyn SpeechToText>,
    ) -> Self {
        info!(
            triggers = registry.len(),
            listen_window_ms = settings.listen_window.as_millis(),
            poll_interval_ms = settings.poll_interval.as_millis(),
            background_listening = settings.background_listening,
            "voice engine created"
        );
        Self {
            shared: Arc::new(Shared {
                registry,
                queue: CommandQueue::new(),
                device: DeviceLock::new(device),
                speech,
                modal: AtomicBool::new(false),
                background_listening: AtomicBool::new(settings.background_listening),
                settings,
            }),
            workers: None,
        }
    }

    /// Spawn the capture loop and dispatcher
    ///
    /// # Errors
    /// `AlreadyRunning` if started twice, `Spawn` if a thread cannot be created
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.workers.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let capture = spawn_worker("voice-capture", &self.shared, &cancel, capture_loop::run)?;
        let dispatcher =
            match spawn_worker("voice-dispatch", &self.shared, &cancel, dispatcher::run) {
                Ok(handle) => handle,
                Err(e) => {
                    cancel.cancel();
                    join_worker("voice-capture", capture);
                    return Err(e);
                }
            };

        self.workers = Some(Workers {
            cancel,
            capture,
            dispatcher,
        });
        info!("voice engine started");
        Ok(())
    }

    /// Signal both workers and wait for them to finish their current step
    ///
    /// Returns once both threads have exited. An in-flight listen or
    /// transcription request observes the cancellation and returns early;
    /// a running action is allowed to finish. Calling `stop` on a stopped
    /// engine does nothing.
    pub fn stop(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };

        info!("stopping voice engine");
        self.shared.modal.store(false, Ordering::SeqCst);
        workers.cancel.cancel();
        join_worker("voice-capture", workers.capture);
        join_worker("voice-dispatch", workers.dispatcher);
        self.shared.modal.store(false, Ordering::SeqCst);
        info!("voice engine stopped");
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    /// Fire a trigger by its exact phrase, bypassing capture and matching
    ///
    /// Runs the trigger's wait-start hook on the calling thread, then queues
    /// the command for the dispatcher.
    ///
    /// # Errors
    /// `NotFound` if no trigger owns `phrase`
    pub fn trigger(&self, phrase: &str) -> Result<TriggerId, EngineError> {
        let id = self
            .shared
            .registry
            .lookup_exact(phrase)
            .ok_or_else(|| EngineError::NotFound(phrase.to_owned()))?;

        if let Some(trigger) = self.shared.registry.get(id) {
            invoke_hook(id, "on_wait_start", trigger.wait_start_hook());
        }
        let sequence = self.shared.queue.push(id, phrase);
        info!(trigger = %id, sequence, phrase, "manual trigger queued");
        Ok(id)
    }

    /// Suspend or resume the background capture loop
    ///
    /// Takes effect at the loop's next iteration; a capture already in
    /// progress completes.
    pub fn set_background_listening_enabled(&self, enabled: bool) {
        let previous = self
            .shared
            .background_listening
            .swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "background listening toggled");
        }
    }

    #[must_use]
    pub fn is_background_listening_enabled(&self) -> bool {
        self.shared.background_listening()
    }

    /// True while a modal action holds the device
    #[must_use]
    pub fn is_modal(&self) -> bool {
        self.shared.is_modal()
    }

    /// Commands queued but not yet picked up by the dispatcher
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.shared.queue.len()
    }

    #[must_use]
    pub fn registry(&self) -> &TriggerRegistry {
        &self.shared.registry
    }

    /// One-off recognition from the application thread
    ///
    /// Takes the device lock itself, so it waits for any capture or modal
    /// action in progress. Never call it from inside a modal action; use
    /// [`ModalContext::recognize`](crate::action::ModalContext::recognize) there.
    ///
    /// # Errors
    /// See [`recognize_once`]
    pub fn recognize(
        &self,
        options: &RecognizeOptions<'_>,
    ) -> Result<Option<String>, CaptureError> {
        let cancel = self
            .workers
            .as_ref()
            .map_or_else(CancellationToken::new, |w| w.cancel.clone());
        let mut device = self.shared.device.acquire();
        recognize_once(&mut *device, self.shared.speech.as_ref(), options, &cancel)
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    name: &'static str,
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    body: fn(&Shared, &CancellationToken),
) -> Result<JoinHandle<()>, EngineError> {
    let shared = Arc::clone(shared);
    let cancel = cancel.clone();
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || body(&shared, &cancel))
        .map_err(|source| EngineError::Spawn { name, source })
}

fn join_worker(name: &'static str, handle: JoinHandle<()>) {
    if let Err(payload) = handle.join() {
        error!(
            worker = name,
            panic = %panic_message(payload.as_ref()),
            "worker panicked"
        );
    }
}

/// Run a trigger's action; errors and panics are logged, never propagated
fn run_guarded(id: TriggerId, action: impl FnOnce() -> anyhow::Result<()>) {
    let start = Instant::now();
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => debug!(
            trigger = %id,
            elapsed_ms = start.elapsed().as_millis(),
            "command finished"
        ),
        Ok(Err(e)) => error!(trigger = %id, error = %format!("{e:#}"), "command failed"),
        Err(payload) => error!(
            trigger = %id,
            panic = %panic_message(payload.as_ref()),
            "command panicked"
        ),
    }
}

fn invoke_hook(id: TriggerId, name: &'static str, hook: Option<&Hook>) {
    let Some(hook) = hook else {
        return;
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook())) {
        error!(
            trigger = %id,
            hook = name,
            panic = %panic_message(payload.as_ref()),
            "hook panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
