//! Scan sessions, the device exclusivity lock and exactly-once completion.

use super::driver::IoTask;
use crate::error::{Result, ScanError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Process-wide exclusivity lock of the I/O device.
///
/// Holding the device is represented by an owned [`SessionToken`]; dropping the
/// token releases it, so a release can neither be repeated nor forgotten.
#[derive(Clone, Default)]
pub struct ExclusiveLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    releases: Arc<AtomicU64>,
}

impl ExclusiveLock {
    /// Create an unlocked device lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting, failing with [`ScanError::DeviceBusy`].
    pub fn try_acquire(&self, holder: &str) -> Result<SessionToken> {
        let guard = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| ScanError::DeviceBusy)?;
        trace!(holder, "Device lock acquired");
        Ok(SessionToken {
            _guard: guard,
            holder: holder.to_string(),
            releases: self.releases.clone(),
        })
    }

    /// True while a token is alive.
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Number of tokens released so far.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Acquire)
    }
}

/// Proof of exclusive access to the I/O device.
pub struct SessionToken {
    _guard: OwnedMutexGuard<()>,
    holder: String,
    releases: Arc<AtomicU64>,
}

impl SessionToken {
    /// Operation holding the device.
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::AcqRel);
        trace!(holder = %self.holder, "Device lock released");
    }
}

/// Lifecycle of one hardware task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Not created yet
    Idle,
    /// Created with channels and clock
    Configured,
    /// Samples loaded, waiting for start
    Armed,
    /// Clocking samples
    Running,
    /// Finished and released
    Completed,
    /// Stopped early and released
    Aborted,
}

/// A driver task owned by one scan session.
pub struct HardwareTask {
    io: Arc<dyn IoTask>,
    state: Mutex<TaskState>,
}

impl HardwareTask {
    pub(crate) fn new(io: Arc<dyn IoTask>) -> Self {
        Self {
            io,
            state: Mutex::new(TaskState::Configured),
        }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        self.io.name()
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn io(&self) -> &Arc<dyn IoTask> {
        &self.io
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    /// Stop and close the task once; later calls are no-ops.
    pub(crate) fn teardown(&self, outcome: TaskState) {
        {
            let mut state = self.state.lock();
            if matches!(*state, TaskState::Completed | TaskState::Aborted) {
                return;
            }
            *state = outcome;
        }
        if let Err(e) = self.io.stop() {
            warn!(task = self.name(), error = %e, "Failed to stop task");
        }
        if let Err(e) = self.io.close() {
            warn!(task = self.name(), error = %e, "Failed to close task");
        }
        debug!(task = self.name(), state = ?outcome, "Task released");
    }
}

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Created, nothing built
    Idle,
    /// Tasks being created and written
    Building,
    /// All tasks written, none started
    Armed,
    /// Output tasks clocking
    Running,
    /// Every output task finished
    Completed,
    /// Stopped early or failed
    Aborted,
}

impl ScanState {
    /// True for `Completed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Session-level notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Tasks armed, about to start
    Initiated {
        /// Session id
        session: Uuid,
        /// Samples per channel
        samples: usize,
    },
    /// All output tasks started
    Started {
        /// Session id
        session: Uuid,
    },
    /// All output tasks finished
    Done {
        /// Session id
        session: Uuid,
    },
    /// Session stopped early
    Aborted {
        /// Session id
        session: Uuid,
    },
    /// Session could not be built
    BuildFailed {
        /// Device error message
        reason: String,
    },
}

/// Counts finished monitors and fires the session end exactly once.
pub(crate) struct CompletionLatch {
    remaining: AtomicUsize,
    fired: AtomicBool,
}

impl CompletionLatch {
    pub(crate) fn new(tasks: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(tasks),
            fired: AtomicBool::new(false),
        }
    }

    /// Record one finished task; true for the last one.
    pub(crate) fn task_finished(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// True for exactly one caller.
    pub(crate) fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) samples: usize,
    pub(crate) clock_source: String,
    pub(crate) has_analog: bool,
    pub(crate) outputs: Vec<Arc<HardwareTask>>,
    pub(crate) inputs: Mutex<BTreeMap<String, Arc<HardwareTask>>>,
    pub(crate) token: Mutex<Option<SessionToken>>,
    pub(crate) latch: CompletionLatch,
    pub(crate) failed: AtomicBool,
    pub(crate) state: watch::Sender<ScanState>,
    pub(crate) events: broadcast::Sender<ScanEvent>,
}

impl SessionShared {
    pub(crate) fn set_state(&self, state: ScanState) {
        self.state.send_replace(state);
    }

    /// Move forward unless the session already ended.
    pub(crate) fn advance(&self, state: ScanState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// End the session once: release tasks and the device, then notify.
    pub(crate) fn finish(&self, outcome: ScanState) -> bool {
        if !self.latch.try_fire() {
            return false;
        }
        let task_outcome = match outcome {
            ScanState::Completed => TaskState::Completed,
            _ => TaskState::Aborted,
        };
        for task in &self.outputs {
            task.teardown(task_outcome);
        }
        let inputs: Vec<_> = std::mem::take(&mut *self.inputs.lock()).into_values().collect();
        for task in inputs {
            task.teardown(TaskState::Completed);
        }

        // Release the device before anyone is told about the end
        drop(self.token.lock().take());
        self.set_state(outcome);

        let event = match outcome {
            ScanState::Completed => ScanEvent::Done { session: self.id },
            _ => ScanEvent::Aborted { session: self.id },
        };
        info!(session = %self.id, state = ?outcome, "Scan session finished");
        let _ = self.events.send(event);
        true
    }
}

/// Handle to a running scan session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ScanSession {
    pub(crate) shared: Arc<SessionShared>,
}

impl ScanSession {
    /// Session id.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Samples per channel of the output tasks.
    pub fn samples(&self) -> usize {
        self.shared.samples
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ScanState> {
        self.shared.state.subscribe()
    }

    /// Names and states of the output tasks in start order.
    pub fn output_tasks(&self) -> Vec<(String, TaskState)> {
        self.shared
            .outputs
            .iter()
            .map(|t| (t.name().to_string(), t.state()))
            .collect()
    }

    /// Names of the armed input tasks.
    pub fn input_tasks(&self) -> Vec<String> {
        self.shared.inputs.lock().keys().cloned().collect()
    }

    /// Wait for the session to end and return its final state.
    pub async fn wait(&self) -> ScanState {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(ScanState::is_terminal).await {
            Ok(state) => *state,
            // Sender lives in `shared`, which this handle keeps alive
            Err(_) => self.state(),
        };
        state
    }

    /// Stop and close every task and release the device.
    ///
    /// Returns false if the session had already ended.
    pub fn abort(&self) -> bool {
        let aborted = self.shared.finish(ScanState::Aborted);
        if aborted {
            warn!(session = %self.id(), "Scan session aborted");
        }
        aborted
    }
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("id", &self.id())
            .field("samples", &self.samples())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let lock = ExclusiveLock::new();
        let token = lock.try_acquire("scan").unwrap();
        assert_eq!(token.holder(), "scan");
        assert!(lock.is_held());
        assert!(matches!(lock.try_acquire("setDigitalTask"), Err(ScanError::DeviceBusy)));

        drop(token);
        assert!(!lock.is_held());
        assert_eq!(lock.release_count(), 1);
        assert!(lock.try_acquire("scan").is_ok());
    }

    #[test]
    fn test_latch_fires_once() {
        let latch = CompletionLatch::new(2);
        assert!(!latch.task_finished());
        assert!(latch.task_finished());
        assert!(latch.try_fire());
        assert!(!latch.try_fire());
    }

    #[test]
    fn test_latch_concurrent_fire() {
        let latch = Arc::new(CompletionLatch::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.task_finished() && latch.try_fire())
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&f| f)
            .count();
        assert_eq!(fired, 1);
    }
}
