use super::detector::{Frame, FrameBatch};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Outcome of offering a batch to a transfer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Batch handed over
    Sent,
    /// Queue full, batch kept for the next attempt
    Pending,
    /// Nothing to send
    Idle,
    /// Receiver gone, queue removed
    Closed,
}

/// Frames held back per queue slot while the consumer lags.
pub(crate) const PENDING_FRAMES_PER_SLOT: usize = 256;

/// Bounded queue carrying one detector's frames to a consumer.
///
/// Delivery never blocks the poll loop: a full queue keeps the batch and
/// merges later frames into it. The held batch is capped at
/// `capacity * PENDING_FRAMES_PER_SLOT` frames; newer frames beyond that are
/// dropped and counted.
#[derive(Debug)]
struct TransferQueue {
    sender: mpsc::Sender<FrameBatch>,
    pending: FrameBatch,
    max_pending: usize,
    dropped: u64,
}

impl TransferQueue {
    fn offer(&mut self, detector: &str, mut frames: Vec<Frame>) -> Delivery {
        let room = self.max_pending.saturating_sub(self.pending.len());
        if frames.len() > room {
            let dropped = frames.len() - room;
            frames.truncate(room);
            self.dropped += dropped as u64;
            warn!(
                detector,
                dropped,
                total_dropped = self.dropped,
                "Transfer queue backlog full, dropping frames"
            );
        }
        self.pending.extend(frames);
        if self.pending.is_empty() {
            return Delivery::Idle;
        }
        match self.sender.try_send(std::mem::take(&mut self.pending)) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                self.pending = batch;
                Delivery::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Open transfer queues by detector name.
#[derive(Debug, Default)]
pub(crate) struct TransferQueues {
    queues: Mutex<HashMap<String, TransferQueue>>,
}

impl TransferQueues {
    /// Open a queue for `detector`, replacing any previous one.
    pub(crate) fn open(&self, detector: &str, capacity: usize) -> mpsc::Receiver<FrameBatch> {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = TransferQueue {
            sender,
            pending: Vec::new(),
            max_pending: capacity * PENDING_FRAMES_PER_SLOT,
            dropped: 0,
        };
        if self.queues.lock().insert(detector.to_string(), queue).is_some() {
            debug!(detector, "Transfer queue replaced");
        }
        receiver
    }

    /// Detectors that currently have an open queue.
    pub(crate) fn detectors(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Offer newly drained frames to the detector's queue.
    pub(crate) fn deliver(&self, detector: &str, frames: Vec<Frame>) -> Delivery {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(detector) else {
            return Delivery::Closed;
        };
        let delivery = queue.offer(detector, frames);
        match delivery {
            Delivery::Closed => {
                queues.remove(detector);
                debug!(detector, "Transfer queue closed by consumer");
            }
            Delivery::Pending => {
                trace!(detector, pending = queue.pending.len(), "Transfer queue full, batch deferred")
            }
            _ => {}
        }
        delivery
    }

    /// Frames waiting for a full queue.
    #[cfg(test)]
    pub(crate) fn pending_frames(&self, detector: &str) -> usize {
        self.queues.lock().get(detector).map_or(0, |q| q.pending.len())
    }

    /// Frames discarded because the backlog was full.
    #[cfg(test)]
    pub(crate) fn dropped_frames(&self, detector: &str) -> u64 {
        self.queues.lock().get(detector).map_or(0, |q| q.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(first: u64, count: u64) -> Vec<Frame> {
        (first..first + count)
            .map(|s| Frame::new(2, 2, vec![0; 4], s))
            .collect()
    }

    #[tokio::test]
    async fn test_full_queue_keeps_batch() {
        let queues = TransferQueues::default();
        let mut rx = queues.open("Camera1", 1);

        assert_eq!(queues.deliver("Camera1", frames(0, 2)), Delivery::Sent);
        assert_eq!(queues.deliver("Camera1", frames(2, 2)), Delivery::Pending);
        assert_eq!(queues.pending_frames("Camera1"), 2);
        assert_eq!(queues.deliver("Camera1", frames(4, 1)), Delivery::Pending);

        assert_eq!(rx.recv().await.unwrap().len(), 2);
        assert_eq!(queues.deliver("Camera1", Vec::new()), Delivery::Sent);
        let merged: Vec<u64> = rx.recv().await.unwrap().iter().map(|f| f.sequence).collect();
        assert_eq!(merged, vec![2, 3, 4]);
        assert_eq!(queues.deliver("Camera1", Vec::new()), Delivery::Idle);
    }

    #[tokio::test]
    async fn test_backlog_is_capped() {
        let queues = TransferQueues::default();
        let mut rx = queues.open("Camera1", 1);
        let cap = PENDING_FRAMES_PER_SLOT as u64;

        assert_eq!(queues.deliver("Camera1", frames(0, 1)), Delivery::Sent);
        // Consumer stalls while the detector keeps producing
        assert_eq!(queues.deliver("Camera1", frames(1, cap - 10)), Delivery::Pending);
        assert_eq!(queues.deliver("Camera1", frames(cap - 9, 30)), Delivery::Pending);
        assert_eq!(queues.pending_frames("Camera1"), PENDING_FRAMES_PER_SLOT);
        assert_eq!(queues.dropped_frames("Camera1"), 20);

        // Oldest frames are kept, in order
        assert_eq!(rx.recv().await.unwrap().len(), 1);
        assert_eq!(queues.deliver("Camera1", Vec::new()), Delivery::Sent);
        let held: Vec<u64> = rx.recv().await.unwrap().iter().map(|f| f.sequence).collect();
        assert_eq!(held, (1..=cap).collect::<Vec<u64>>());
        assert_eq!(queues.pending_frames("Camera1"), 0);
    }

    #[test]
    fn test_closed_queue_removed() {
        let queues = TransferQueues::default();
        drop(queues.open("Camera1", 4));
        assert_eq!(queues.deliver("Camera1", frames(0, 1)), Delivery::Closed);
        assert_eq!(queues.count(), 0);
    }
}
