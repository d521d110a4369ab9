use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{invoke_hook, run_guarded, QueueEntry, Shared};
use crate::action::{CommandAction, ModalContext};
use crate::registry::TriggerDescriptor;

/// Drain the queue and run each command in FIFO order
pub(super) fn run(shared: &Shared, cancel: &CancellationToken) {
    info!("dispatcher started");
    let mut pending = VecDeque::new();

    while !cancel.is_cancelled() {
        let Some(first) = shared.queue.recv_timeout(shared.settings.poll_interval) else {
            continue;
        };
        pending.push_back(first);
        pending.extend(shared.queue.drain());

        while let Some(entry) = pending.pop_front() {
            if cancel.is_cancelled() {
                pending.push_front(entry);
                break;
            }
            dispatch(shared, &entry, &mut pending, cancel);
        }
    }

    if !pending.is_empty() {
        warn!(dropped = pending.len(), "undispatched commands dropped on shutdown");
    }
    info!("dispatcher stopped");
}

fn dispatch(
    shared: &Shared,
    entry: &QueueEntry,
    pending: &mut VecDeque<QueueEntry>,
    cancel: &CancellationToken,
) {
    let Some(trigger) = shared.registry.get(entry.trigger_id) else {
        warn!(trigger = %entry.trigger_id, "queued command has no registered trigger");
        return;
    };

    match trigger.action() {
        CommandAction::Immediate(action) => {
            debug!(trigger = %trigger.id(), sequence = entry.sequence, "running command");
            invoke_hook(trigger.id(), "on_wait_end", trigger.wait_end_hook());
            run_guarded(trigger.id(), || action(&entry.transcript));
        }
        CommandAction::Modal(_) => run_modal(shared, trigger, entry, pending, cancel),
    }
}

/// Run a modal command with the device held, then discard whatever was
/// queued while it ran
fn run_modal(
    shared: &Shared,
    trigger: &TriggerDescriptor,
    entry: &QueueEntry,
    pending: &mut VecDeque<QueueEntry>,
    cancel: &CancellationToken,
) {
    let CommandAction::Modal(action) = trigger.action() else {
        return;
    };
    let id = trigger.id();

    shared.modal.store(true, Ordering::SeqCst);
    let watermark = shared.queue.watermark();
    info!(trigger = %id, sequence = entry.sequence, "modal command started");

    {
        let mut device = shared.device.acquire();
        invoke_hook(id, "on_wait_end", trigger.wait_end_hook());

        let mut ctx = ModalContext::new(
            &mut *device,
            shared.speech.as_ref(),
            cancel,
            shared.settings.ambient_calibration,
        );
        run_guarded(id, || action(&entry.transcript, &mut ctx));

        // Entries stamped before the watermark were queued before this
        // command started and still run
        let (stale, kept): (Vec<_>, Vec<_>) = shared
            .queue
            .drain()
            .into_iter()
            .partition(|e| e.sequence >= watermark);
        if !stale.is_empty() {
            info!(
                trigger = %id,
                discarded = stale.len(),
                "commands queued during modal command discarded"
            );
            for e in &stale {
                debug!(trigger = %e.trigger_id, transcript = %e.transcript, "discarded");
            }
        }
        pending.extend(kept);
    }

    shared.modal.store(false, Ordering::SeqCst);
    info!(trigger = %id, "modal command finished");
}
