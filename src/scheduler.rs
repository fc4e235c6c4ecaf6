//! Ordered execution of delayed actions.
//!
//! ```text
//! schedule(a, 0ms) ─ schedule(b, 500ms) ─ schedule(c, 500ms)
//!
//! t=0 ──▶ a ──(a done)── 500ms ──▶ b ──(b done)── 500ms ──▶ c
//! ```
//!
//! Each delay is measured from the completion of the previous action, so a
//! slow action pushes every later one back instead of overlapping it.

use crate::error::Result;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Deferred action.
pub type ScheduledAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Entry {
    label: String,
    delay: Duration,
    action: ScheduledAction,
}

/// What happened to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Actions that ran to completion
    pub completed: usize,
    /// Actions skipped because of cancellation
    pub cancelled: usize,
}

/// FIFO of `(action, delay)` pairs.
#[derive(Default)]
pub struct DelayedTaskScheduler {
    queue: VecDeque<Entry>,
}

impl DelayedTaskScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `action` to run `delay` after the previous action completes.
    pub fn schedule<F, Fut>(&mut self, label: impl Into<String>, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.queue.push_back(Entry {
            label: label.into(),
            delay,
            action: Box::new(move || Box::pin(action())),
        });
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Run every action in order on the current task.
    ///
    /// The first failing action stops the queue and its error is returned.
    pub async fn run(self) -> Result<ScheduleReport> {
        let (_keep, cancel) = watch::channel(false);
        run_queue(self.queue, cancel).await
    }

    /// Run the queue on a background task.
    pub fn spawn(self) -> ScheduledRun {
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_queue(self.queue, cancel_rx));
        ScheduledRun { cancel, task }
    }
}

/// Background run of a [`DelayedTaskScheduler`].
pub struct ScheduledRun {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<ScheduleReport>>,
}

impl ScheduledRun {
    /// Skip every action that has not started yet.
    ///
    /// An action already running finishes normally.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the queue to drain or be cancelled.
    pub async fn wait(self) -> Result<ScheduleReport> {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Scheduler task ended abnormally");
                Ok(ScheduleReport {
                    completed: 0,
                    cancelled: 0,
                })
            }
        }
    }
}

async fn run_queue(
    mut queue: VecDeque<Entry>,
    mut cancel: watch::Receiver<bool>,
) -> Result<ScheduleReport> {
    let mut completed = 0;
    while let Some(entry) = queue.pop_front() {
        let cancelled = tokio::select! {
            biased;
            Ok(_) = cancel.wait_for(|c| *c) => true,
            _ = tokio::time::sleep(entry.delay) => false,
        };
        if cancelled || *cancel.borrow() {
            let skipped = queue.len() + 1;
            info!(label = %entry.label, skipped, "Scheduled actions cancelled");
            return Ok(ScheduleReport {
                completed,
                cancelled: skipped,
            });
        }

        debug!(label = %entry.label, "Running scheduled action");
        (entry.action)().await?;
        completed += 1;
    }
    Ok(ScheduleReport {
        completed,
        cancelled: 0,
    })
}
