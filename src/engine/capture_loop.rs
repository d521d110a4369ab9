use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Shared;
use crate::audio::CaptureError;
use crate::transcription::TranscriptionError;

/// Background listener: capture, transcribe, match, queue
///
/// Skips the cycle while background listening is off or a modal command owns
/// the device; exits once `cancel` fires.
pub(super) fn run(shared: &Shared, cancel: &CancellationToken) {
    info!("capture loop started");
    while !cancel.is_cancelled() {
        if shared.background_listening() && !shared.is_modal() {
            capture_cycle(shared, cancel);
        }
        std::thread::sleep(shared.settings.poll_interval);
    }
    info!("capture loop stopped");
}

fn capture_cycle(shared: &Shared, cancel: &CancellationToken) {
    // Device is released before transcription so a modal command can take it
    let captured = {
        let mut device = shared.device.acquire();
        device
            .calibrate(shared.settings.ambient_calibration)
            .and_then(|()| device.listen(shared.settings.listen_window, cancel))
    };

    let sample = match captured {
        Ok(sample) => sample,
        Err(CaptureError::NoSpeechTimeout(window)) => {
            trace!(window_ms = window.as_millis(), "no speech in listen window");
            return;
        }
        Err(CaptureError::Cancelled) => return,
        Err(e @ CaptureError::Device(_)) => {
            warn!(error = %e, "capture failed");
            return;
        }
    };

    debug!(
        duration_ms = sample.duration().as_millis(),
        "utterance captured"
    );
    match shared.speech.transcribe(&sample, cancel) {
        Ok(text) => {
            debug!(transcript = %text, "transcribed");
            shared.enqueue_matches(&text);
        }
        Err(TranscriptionError::Cancelled) => {}
        Err(e) => warn!(error = %e, "transcription failed; listening again"),
    }
}
