use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::registry::TriggerId;

/// A matched command waiting for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub trigger_id: TriggerId,
    /// Transcript (or manual phrase) that fired the trigger
    pub transcript: String,
    /// Enqueue order stamp, unique per queue
    pub sequence: u64,
}

/// Unbounded multi-producer FIFO of matched commands
pub struct CommandQueue {
    tx: Sender<QueueEntry>,
    rx: Receiver<QueueEntry>,
    next_sequence: AtomicU64,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Append an entry; returns its sequence number
    pub fn push(&self, trigger_id: TriggerId, transcript: impl Into<String>) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let entry = QueueEntry {
            trigger_id,
            transcript: transcript.into(),
            sequence,
        };
        // The queue owns both ends, so the channel cannot be disconnected
        let _ = self.tx.send(entry);
        sequence
    }

    /// Sequence number the next push will receive
    ///
    /// Every entry pushed after this call has a sequence at or above the
    /// returned value.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for one entry
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<QueueEntry> {
        match self.rx.recv_timeout(timeout) {
            Ok(entry) => Some(entry),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take everything currently queued, in FIFO order
    #[must_use]
    pub fn drain(&self) -> Vec<QueueEntry> {
        self.rx.try_iter().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::CommandAction;
    use crate::registry::{Trigger, TriggerRegistry};
    use std::sync::Arc;

    fn ids(count: usize) -> Vec<TriggerId> {
        let mut registry = TriggerRegistry::new();
        (0..count)
            .map(|i| {
                registry
                    .register(Trigger::new(
                        [format!("phrase {i}")],
                        CommandAction::immediate(|_| Ok(())),
                    ))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_fifo_order_and_sequences() {
        let ids = ids(3);
        let queue = CommandQueue::new();

        assert_eq!(queue.push(ids[2], "c"), 0);
        assert_eq!(queue.push(ids[0], "a"), 1);
        assert_eq!(queue.push(ids[1], "b"), 2);
        assert_eq!(queue.len(), 3);

        let drained = queue.drain();
        let order: Vec<_> = drained.iter().map(|e| e.transcript.as_str()).collect();
        assert_eq!(order, ["c", "a", "b"]);
        assert_eq!(drained[1].trigger_id, ids[0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_watermark_separates_later_entries() {
        let ids = ids(1);
        let queue = CommandQueue::new();
        queue.push(ids[0], "before");

        let watermark = queue.watermark();
        queue.push(ids[0], "after");

        let (stale, kept): (Vec<_>, Vec<_>) = queue
            .drain()
            .into_iter()
            .partition(|e| e.sequence >= watermark);
        assert_eq!(kept[0].transcript, "before");
        assert_eq!(stale[0].transcript, "after");
    }

    #[test]
    fn test_recv_timeout_empty() {
        let queue = CommandQueue::new();
        assert_eq!(queue.recv_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_concurrent_producers() {
        let ids = ids(1);
        let id = ids[0];
        let queue = Arc::new(CommandQueue::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        queue.push(id, "x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut sequences: Vec<u64> = queue.drain().iter().map(|e| e.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (0..100).collect::<Vec<_>>());
    }
}
