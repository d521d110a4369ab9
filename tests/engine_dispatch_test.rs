//! End-to-end tests for the capture loop and dispatcher
//!
//! The microphone and speech backend are scripted fakes, so these run
//! without audio hardware or network access.

use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use voice_trigger::{
    AudioSample, AudioSource, CaptureError, CommandAction, EngineError, EngineSettings,
    RecognizeOptions, SpeechToText, TranscriptionError, Trigger, TriggerRegistry, VoiceEngine,
};

const WAIT: Duration = Duration::from_secs(3);

/// Yields `utterances` samples, then reports silence until cancelled
struct ScriptedMic {
    utterances: usize,
    listens: Arc<AtomicUsize>,
}

impl ScriptedMic {
    fn new(utterances: usize) -> (Self, Arc<AtomicUsize>) {
        let listens = Arc::new(AtomicUsize::new(0));
        let mic = Self {
            utterances,
            listens: Arc::clone(&listens),
        };
        (mic, listens)
    }
}

impl AudioSource for ScriptedMic {
    fn calibrate(&mut self, _duration: Duration) -> Result<(), CaptureError> {
        Ok(())
    }

    fn listen(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AudioSample, CaptureError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        if self.utterances > 0 {
            self.utterances -= 1;
            return Ok(AudioSample::new(vec![0.1; 1600], 16000));
        }
        std::thread::sleep(Duration::from_millis(5));
        Err(CaptureError::NoSpeechTimeout(timeout))
    }
}

/// Blocks each transcription until the test releases it
struct Gate {
    started: Sender<()>,
    release: Receiver<()>,
}

/// Replies with scripted transcripts in order
struct ScriptedSpeech {
    replies: Mutex<VecDeque<Result<String, TranscriptionError>>>,
    gate: Option<Gate>,
}

impl ScriptedSpeech {
    fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, TranscriptionError>>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            gate: None,
        }
    }

    fn saying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok((*t).to_owned())))
    }

    fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl SpeechToText for ScriptedSpeech {
    fn transcribe(
        &self,
        _sample: &AudioSample,
        cancel: &CancellationToken,
    ) -> Result<String, TranscriptionError> {
        if let Some(gate) = &self.gate {
            let _ = gate.started.send(());
            while gate.release.recv_timeout(Duration::from_millis(10)).is_err() {
                if cancel.is_cancelled() {
                    return Err(TranscriptionError::Cancelled);
                }
            }
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted reply").into()))
    }
}

fn settings(background_listening: bool) -> EngineSettings {
    EngineSettings {
        listen_window: Duration::from_secs(1),
        poll_interval: Duration::from_millis(5),
        ambient_calibration: Duration::ZERO,
        background_listening,
    }
}

fn engine(
    background_listening: bool,
    registry: TriggerRegistry,
    mic: ScriptedMic,
    speech: ScriptedSpeech,
) -> VoiceEngine {
    VoiceEngine::new(
        settings(background_listening),
        registry,
        Box::new(mic),
        Box::new(speech),
    )
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

type Log = Arc<Mutex<Vec<String>>>;

fn recording(log: &Log, label: &'static str) -> CommandAction {
    let log = Arc::clone(log);
    CommandAction::immediate(move |transcript| {
        log.lock().unwrap().push(format!("{label}: {transcript}"));
        Ok(())
    })
}

#[test]
fn test_spoken_phrase_runs_action() {
    let log = Log::default();
    let mut registry = TriggerRegistry::new();
    registry
        .register(Trigger::new(["hello", "hey"], recording(&log, "greet")))
        .unwrap();

    let (mic, _) = ScriptedMic::new(1);
    let mut engine = engine(true, registry, mic, ScriptedSpeech::saying(&["Hello there"]));
    engine.start().unwrap();

    assert!(wait_until(|| !log.lock().unwrap().is_empty()));
    engine.stop();
    assert_eq!(*log.lock().unwrap(), vec!["greet: hello there"]);
}

#[test]
fn test_highest_priority_wins() {
    let log = Log::default();
    let mut registry = TriggerRegistry::new();
    registry
        .register(Trigger::new(["lights"], recording(&log, "low")).with_priority(1))
        .unwrap();
    registry
        .register(Trigger::new(["lights on"], recording(&log, "high")).with_priority(5))
        .unwrap();

    let (mic, _) = ScriptedMic::new(1);
    let speech = ScriptedSpeech::saying(&["turn the lights on"]);
    let mut engine = engine(true, registry, mic, speech);
    engine.start().unwrap();

    assert!(wait_until(|| !log.lock().unwrap().is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    engine.stop();
    assert_eq!(*log.lock().unwrap(), vec!["high: turn the lights on"]);
}

#[test]
fn test_tied_triggers_all_run_after_every_wait_start() {
    let log = Log::default();
    let mut registry = TriggerRegistry::new();
    for name in ["alpha", "beta"] {
        let start_log = Arc::clone(&log);
        let end_log = Arc::clone(&log);
        registry
            .register(
                Trigger::new([name], recording(&log, name))
                    .on_wait_start(move || start_log.lock().unwrap().push(format!("start {name}")))
                    .on_wait_end(move || end_log.lock().unwrap().push(format!("end {name}"))),
            )
            .unwrap();
    }

    let (mic, _) = ScriptedMic::new(1);
    let speech = ScriptedSpeech::saying(&["Beta then alpha"]);
    let mut engine = engine(true, registry, mic, speech);
    engine.start().unwrap();

    assert!(wait_until(|| log.lock().unwrap().len() == 6));
    engine.stop();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "start alpha",
            "start beta",
            "end alpha",
            "alpha: beta then alpha",
            "end beta",
            "beta: beta then alpha",
        ]
    );
}

#[test]
fn test_manual_trigger_without_background_listening() {
    let log = Log::default();
    let mut registry = TriggerRegistry::new();
    registry
        .register(Trigger::new(["hey"], recording(&log, "greet")))
        .unwrap();

    let (mic, listens) = ScriptedMic::new(1);
    let mut engine = engine(false, registry, mic, ScriptedSpeech::saying(&[]));
    engine.start().unwrap();

    engine.trigger("Hey!").unwrap();
    assert!(matches!(
        engine.trigger("goodbye"),
        Err(EngineError::NotFound(phrase)) if phrase == "goodbye"
    ));

    assert!(wait_until(|| !log.lock().unwrap().is_empty()));
    std::thread::sleep(Duration::from_millis(30));
    engine.stop();

    assert_eq!(*log.lock().unwrap(), vec!["greet: Hey!"]);
    assert_eq!(listens.load(Ordering::SeqCst), 0);
}

#[test]
fn test_background_listening_can_be_toggled() {
    let (mic, listens) = ScriptedMic::new(0);
    let mut engine = engine(false, TriggerRegistry::new(), mic, ScriptedSpeech::saying(&[]));
    engine.start().unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(listens.load(Ordering::SeqCst), 0);

    engine.set_background_listening_enabled(true);
    assert!(engine.is_background_listening_enabled());
    assert!(wait_until(|| listens.load(Ordering::SeqCst) > 0));
    engine.stop();
}

#[test]
fn test_stop_returns_promptly_and_restarts() {
    let (mic, listens) = ScriptedMic::new(0);
    let mut engine = engine(true, TriggerRegistry::new(), mic, ScriptedSpeech::saying(&[]));

    for _ in 0..2 {
        engine.start().unwrap();
        assert!(engine.is_running());
        std::thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!engine.is_running());
        assert!(!engine.is_modal());
    }
    assert!(listens.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_commands_queued_during_modal_are_discarded() {
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let (queued_tx, queued_rx) = crossbeam_channel::bounded(1);
    let modal_done = Arc::new(AtomicUsize::new(0));
    let beta_runs = Arc::new(AtomicUsize::new(0));

    let mut registry = TriggerRegistry::new();
    let done = Arc::clone(&modal_done);
    registry
        .register(Trigger::new(
            ["modal a"],
            CommandAction::modal(move |_, _ctx| {
                // Let the capture loop finish its transcription while we run
                release_tx.send(())?;
                queued_rx.recv_timeout(WAIT)?;
                std::thread::sleep(Duration::from_millis(100));
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .unwrap();
    let runs = Arc::clone(&beta_runs);
    registry
        .register(
            Trigger::new(
                ["beta"],
                CommandAction::immediate(move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .on_wait_start(move || {
                let _ = queued_tx.try_send(());
            }),
        )
        .unwrap();

    let (mic, _) = ScriptedMic::new(1);
    let speech = ScriptedSpeech::saying(&["beta"]).gated(Gate {
        started: started_tx,
        release: release_rx,
    });
    let mut engine = engine(true, registry, mic, speech);
    engine.start().unwrap();

    // Capture loop is now transcribing with the device released
    started_rx.recv_timeout(WAIT).unwrap();
    engine.trigger("modal a").unwrap();

    assert!(wait_until(|| modal_done.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| !engine.is_modal()));
    std::thread::sleep(Duration::from_millis(50));
    engine.stop();

    assert_eq!(beta_runs.load(Ordering::SeqCst), 0);
    assert_eq!(engine.pending_commands(), 0);
}

#[test]
fn test_modal_action_asks_follow_up() {
    let answer = Arc::new(Mutex::new(None));
    let mut registry = TriggerRegistry::new();
    let slot = Arc::clone(&answer);
    registry
        .register(Trigger::new(
            ["weather"],
            CommandAction::modal(move |_, ctx| {
                let city = ctx.recognize(Duration::from_secs(1))?;
                *slot.lock().unwrap() = Some(city);
                Ok(())
            }),
        ))
        .unwrap();

    let (mic, listens) = ScriptedMic::new(1);
    let mut engine = engine(false, registry, mic, ScriptedSpeech::saying(&["Boston"]));
    engine.start().unwrap();
    engine.trigger("weather").unwrap();

    assert!(wait_until(|| answer.lock().unwrap().is_some()));
    engine.stop();
    assert_eq!(*answer.lock().unwrap(), Some(Some("boston".to_owned())));
    assert_eq!(listens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_actions_do_not_stop_dispatcher() {
    let log = Log::default();
    let mut registry = TriggerRegistry::new();
    registry
        .register(Trigger::new(
            ["explode"],
            CommandAction::immediate(|_| std::panic::resume_unwind(Box::new("action blew up"))),
        ))
        .unwrap();
    registry
        .register(Trigger::new(
            ["fail"],
            CommandAction::immediate(|_| Err(anyhow::anyhow!("action failed"))),
        ))
        .unwrap();
    registry
        .register(Trigger::new(["ok"], recording(&log, "ok")))
        .unwrap();

    let (mic, _) = ScriptedMic::new(0);
    let mut engine = engine(false, registry, mic, ScriptedSpeech::saying(&[]));
    engine.start().unwrap();
    engine.trigger("explode").unwrap();
    engine.trigger("fail").unwrap();
    engine.trigger("ok").unwrap();

    assert!(wait_until(|| !log.lock().unwrap().is_empty()));
    engine.stop();
    assert_eq!(*log.lock().unwrap(), vec!["ok: ok"]);
}

#[test]
fn test_transcription_failure_keeps_listening() {
    let log = Log::default();
    let mut registry = TriggerRegistry::new();
    registry
        .register(Trigger::new(["hello"], recording(&log, "greet")))
        .unwrap();

    let (mic, _) = ScriptedMic::new(2);
    let speech = ScriptedSpeech::new([
        Err(TranscriptionError::Service(anyhow::anyhow!("service unavailable"))),
        Ok("hello".to_owned()),
    ]);
    let mut engine = engine(true, registry, mic, speech);
    engine.start().unwrap();

    assert!(wait_until(|| !log.lock().unwrap().is_empty()));
    engine.stop();
    assert_eq!(*log.lock().unwrap(), vec!["greet: hello"]);
}

#[test]
fn test_engine_recognize_while_stopped() {
    let (mic, _) = ScriptedMic::new(1);
    let engine = engine(false, TriggerRegistry::new(), mic, ScriptedSpeech::saying(&["Boston"]));

    let options = RecognizeOptions::new(Duration::from_secs(1)).calibration(Duration::ZERO);
    assert_eq!(engine.recognize(&options).unwrap(), Some("boston".to_owned()));

    let options = options.keep_case();
    assert!(matches!(
        engine.recognize(&options),
        Err(CaptureError::NoSpeechTimeout(_))
    ));
}
