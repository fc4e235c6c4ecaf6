//! Mock I/O Driver
//!
//! Simulated multi-channel I/O device for testing without physical hardware.
//! All timing uses `tokio::time`, so tests can run under a paused clock.
//!
//! # Behavior
//!
//! - Every driver call is recorded as a [`DriverEvent`], in call order
//! - A channel can be owned by one open task at a time
//! - Analog writes outside the task's voltage range are rejected
//! - Tasks complete after `samples / rate` ([`CompletionMode::Auto`]) or when
//!   the test calls [`MockIoDriver::complete_all`] ([`CompletionMode::Manual`])
//! - Failures can be injected per channel or task with [`FaultScenario`]

use super::driver::{DeviceResult, IoDriver, IoTask, TaskKind, TaskSamples, TaskSpec};
use crate::error::{DeviceError, DeviceErrorKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

// =============================================================================
// Events and fault injection
// =============================================================================

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Task created
    Created {
        /// Task name
        task: String,
        /// Physical channels
        channels: Vec<String>,
        /// Sample clock source
        clock: String,
    },
    /// Samples loaded
    Written {
        /// Task name
        task: String,
        /// Samples per channel
        samples: usize,
    },
    /// Task started
    Started {
        /// Task name
        task: String,
    },
    /// Task stopped
    Stopped {
        /// Task name
        task: String,
    },
    /// Task closed
    Closed {
        /// Task name
        task: String,
    },
    /// Samples read from an input
    Read {
        /// Task name
        task: String,
        /// Samples per channel
        samples: usize,
    },
}

/// How mock tasks reach completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Complete after the clock's nominal duration
    #[default]
    Auto,
    /// Complete only when the test says so
    Manual,
}

/// Injected driver failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultScenario {
    /// Creating a task on this channel fails
    CreateFails {
        /// Physical channel name
        channel: String,
    },
    /// Writing to a task owning this channel fails
    WriteFails {
        /// Physical channel name
        channel: String,
    },
    /// Starting the named task fails
    StartFails {
        /// Task name
        task: String,
    },
}

#[derive(Default)]
struct DriverState {
    events: Vec<DriverEvent>,
    /// channel -> owning task
    reserved: HashMap<String, String>,
    open: Vec<Arc<MockTaskShared>>,
    written: BTreeMap<String, TaskSamples>,
    faults: Vec<FaultScenario>,
}

struct DriverShared {
    state: Mutex<DriverState>,
    mode: CompletionMode,
}

impl DriverShared {
    fn record(&self, event: DriverEvent) {
        trace!(?event, "Mock driver call");
        self.state.lock().events.push(event);
    }

    fn has_fault(&self, predicate: impl Fn(&FaultScenario) -> bool) -> bool {
        self.state.lock().faults.iter().any(predicate)
    }
}

// =============================================================================
// MockIoDriver
// =============================================================================

/// Simulated I/O device.
///
/// Cloning yields another handle to the same device, so a test can keep one
/// handle for inspection while the coordinator owns another.
#[derive(Clone)]
pub struct MockIoDriver {
    shared: Arc<DriverShared>,
}

impl Default for MockIoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIoDriver {
    /// Create a device whose tasks complete on their own.
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Auto)
    }

    /// Create a device with the given completion behavior.
    pub fn with_mode(mode: CompletionMode) -> Self {
        Self {
            shared: Arc::new(DriverShared {
                state: Mutex::new(DriverState::default()),
                mode,
            }),
        }
    }

    /// Add a failure scenario.
    pub fn inject(&self, fault: FaultScenario) {
        self.shared.state.lock().faults.push(fault);
    }

    /// Remove every failure scenario.
    pub fn clear_faults(&self) {
        self.shared.state.lock().faults.clear();
    }

    /// Recorded calls in order.
    pub fn events(&self) -> Vec<DriverEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Forget recorded calls.
    pub fn clear_events(&self) {
        self.shared.state.lock().events.clear();
    }

    /// Last samples written to the task with this name.
    pub fn written_samples(&self, task: &str) -> Option<TaskSamples> {
        self.shared.state.lock().written.get(task).cloned()
    }

    /// Number of tasks created and not yet closed.
    pub fn open_task_count(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    /// Channels currently owned by open tasks.
    pub fn reserved_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.shared.state.lock().reserved.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Complete every open task.
    pub fn complete_all(&self) {
        let open = self.shared.state.lock().open.clone();
        for task in open {
            task.mark_done(false);
        }
    }

    /// Complete open tasks with this name; returns false if none was open.
    pub fn complete(&self, task: &str) -> bool {
        let open: Vec<_> = self
            .shared
            .state
            .lock()
            .open
            .iter()
            .filter(|t| t.spec.name == task)
            .cloned()
            .collect();
        open.iter().for_each(|t| t.mark_done(false));
        !open.is_empty()
    }
}

impl IoDriver for MockIoDriver {
    fn create_task(&self, spec: TaskSpec) -> DeviceResult<Arc<dyn IoTask>> {
        if self.shared.has_fault(|f| {
            matches!(f, FaultScenario::CreateFails { channel } if spec.channels.contains(channel))
        }) {
            return Err(DeviceError::new(
                &spec.name,
                DeviceErrorKind::Configuration,
                "Injected task creation failure",
            ));
        }

        let task = {
            let mut state = self.shared.state.lock();
            if let Some(channel) = spec.channels.iter().find(|c| state.reserved.contains_key(*c)) {
                return Err(DeviceError::new(
                    &spec.name,
                    DeviceErrorKind::ResourceReserved,
                    format!("{} is owned by task '{}'", channel, state.reserved[channel]),
                ));
            }
            for channel in &spec.channels {
                state.reserved.insert(channel.clone(), spec.name.clone());
            }
            let (done, _) = watch::channel(false);
            let task = Arc::new(MockTaskShared {
                spec,
                done,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                read_cursor: AtomicUsize::new(0),
            });
            state.open.push(task.clone());
            task
        };

        self.shared.record(DriverEvent::Created {
            task: task.spec.name.clone(),
            channels: task.spec.channels.clone(),
            clock: task.spec.clock.source.clone(),
        });
        debug!(task = %task.spec.name, channels = ?task.spec.channels, "Mock task created");
        Ok(Arc::new(MockTask {
            shared: task,
            driver: self.shared.clone(),
        }))
    }
}

// =============================================================================
// MockTask
// =============================================================================

struct MockTaskShared {
    spec: TaskSpec,
    done: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
    aborted: AtomicBool,
    read_cursor: AtomicUsize,
}

impl MockTaskShared {
    /// Finish the task; `aborted` records that it ended before completing.
    fn mark_done(&self, aborted: bool) {
        self.done.send_if_modified(|done| {
            if *done {
                return false;
            }
            if aborted {
                self.aborted.store(true, Ordering::Release);
            }
            *done = true;
            true
        });
    }
}

struct MockTask {
    shared: Arc<MockTaskShared>,
    driver: Arc<DriverShared>,
}

impl MockTask {
    fn error(&self, kind: DeviceErrorKind, message: impl Into<String>) -> DeviceError {
        DeviceError::new(&self.shared.spec.name, kind, message)
    }

    fn check_open(&self) -> DeviceResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.error(DeviceErrorKind::Configuration, "Task is closed"));
        }
        Ok(())
    }

    fn validate(&self, samples: &TaskSamples) -> DeviceResult<()> {
        let spec = &self.shared.spec;
        if samples.channel_count() != spec.channels.len() {
            return Err(self.error(
                DeviceErrorKind::InvalidSamples,
                format!(
                    "{} channels of samples for {} channels",
                    samples.channel_count(),
                    spec.channels.len()
                ),
            ));
        }
        match (spec.kind, samples) {
            (TaskKind::AnalogOut { min, max }, TaskSamples::Analog(channels)) => {
                if let Some(v) = channels.iter().flatten().find(|v| **v < min || **v > max) {
                    return Err(self.error(
                        DeviceErrorKind::InvalidSamples,
                        format!("{} V outside [{}, {}]", v, min, max),
                    ));
                }
                Ok(())
            }
            (TaskKind::DigitalOut, TaskSamples::Digital(_)) => Ok(()),
            (kind, _) => Err(self.error(
                DeviceErrorKind::InvalidSamples,
                format!("Sample type does not match {:?} task", kind),
            )),
        }
    }
}

#[async_trait]
impl IoTask for MockTask {
    fn name(&self) -> &str {
        &self.shared.spec.name
    }

    fn write(&self, samples: &TaskSamples, auto_start: bool) -> DeviceResult<usize> {
        self.check_open()?;
        let channels = &self.shared.spec.channels;
        if self.driver.has_fault(
            |f| matches!(f, FaultScenario::WriteFails { channel } if channels.contains(channel)),
        ) {
            return Err(self.error(DeviceErrorKind::Hardware, "Injected write failure"));
        }
        self.validate(samples)?;

        let count = samples.samples_per_channel();
        self.driver
            .state
            .lock()
            .written
            .insert(self.shared.spec.name.clone(), samples.clone());
        self.driver.record(DriverEvent::Written {
            task: self.shared.spec.name.clone(),
            samples: count,
        });
        if auto_start {
            self.start()?;
        }
        Ok(count)
    }

    fn start(&self) -> DeviceResult<()> {
        self.check_open()?;
        let name = &self.shared.spec.name;
        if self
            .driver
            .has_fault(|f| matches!(f, FaultScenario::StartFails { task } if task == name))
        {
            return Err(self.error(DeviceErrorKind::Hardware, "Injected start failure"));
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(self.error(DeviceErrorKind::Configuration, "Task already started"));
        }
        self.driver.record(DriverEvent::Started { task: name.clone() });

        if self.driver.mode == CompletionMode::Auto {
            let task = self.shared.clone();
            let duration = task.spec.clock.duration();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                task.mark_done(false);
            });
        }
        Ok(())
    }

    async fn wait_until_done(&self, timeout: Option<Duration>) -> DeviceResult<()> {
        let mut rx = self.shared.done.subscribe();
        let wait = rx.wait_for(|done| *done);
        let finished = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| self.error(DeviceErrorKind::Timeout, format!("Not done after {:?}", limit)))?,
            None => wait.await,
        };
        // The sender lives as long as this task
        finished.map_err(|_| self.error(DeviceErrorKind::Hardware, "Task dropped"))?;

        if self.shared.aborted.load(Ordering::Acquire) {
            return Err(self.error(DeviceErrorKind::Hardware, "Task stopped before completion"));
        }
        Ok(())
    }

    async fn read(&self, samples: usize, timeout: Option<Duration>) -> DeviceResult<Vec<f64>> {
        self.check_open()?;
        let spec = &self.shared.spec;
        if spec.kind.is_output() {
            return Err(self.error(DeviceErrorKind::Configuration, "Cannot read from an output task"));
        }
        if !self.shared.started.load(Ordering::Acquire) {
            return Err(self.error(DeviceErrorKind::Configuration, "Task not started"));
        }
        let _ = timeout;

        let cursor = self.shared.read_cursor.fetch_add(samples, Ordering::AcqRel);
        let values = (0..samples * spec.channels.len())
            .map(|i| {
                let n = (cursor + i / spec.channels.len()) as f64;
                match spec.kind {
                    TaskKind::AnalogIn { min, max } => {
                        let mid = (min + max) / 2.0;
                        mid + (max - mid) * 0.5 * (n * 0.01).sin()
                    }
                    // Cumulative edge count
                    _ => n,
                }
            })
            .collect();
        self.driver.record(DriverEvent::Read {
            task: spec.name.clone(),
            samples,
        });
        Ok(values)
    }

    fn stop(&self) -> DeviceResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.shared.mark_done(true);
        self.driver.record(DriverEvent::Stopped {
            task: self.shared.spec.name.clone(),
        });
        Ok(())
    }

    fn close(&self) -> DeviceResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.mark_done(true);
        {
            let mut state = self.driver.state.lock();
            state.reserved.retain(|_, owner| owner != &self.shared.spec.name);
            state.open.retain(|t| !Arc::ptr_eq(t, &self.shared));
        }
        self.driver.record(DriverEvent::Closed {
            task: self.shared.spec.name.clone(),
        });
        Ok(())
    }
}
