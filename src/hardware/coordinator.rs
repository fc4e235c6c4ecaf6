//! Builds, starts and tears down the clocked tasks of a scan session.

use super::driver::{IoDriver, IoTask, SampleClock, TaskKind, TaskSamples, TaskSpec};
use super::session::{
    CompletionLatch, ExclusiveLock, HardwareTask, ScanEvent, ScanSession, ScanState, SessionShared,
    TaskState,
};
use crate::config::HardwareConfig;
use crate::error::{Result, ScanError};
use crate::registry::{DeviceRegistry, ResourceKind};
use crate::waveform::WaveformSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Terminal exported by the analog output task's sample clock.
pub const AO_SAMPLE_CLOCK: &str = "ao/SampleClock";
/// Terminal exported by the analog output task's start trigger.
pub const AO_START_TRIGGER: &str = "ao/StartTrigger";

const ANALOG_SCAN_TASK: &str = "ScanAOTask";
const DIGITAL_SCAN_TASK: &str = "ScanDOTask";
const TIMER_SCAN_TASK: &str = "ScanTimerTask";
const DIGITAL_ONE_SHOT_TASK: &str = "setDigitalTask";
const ANALOG_ONE_SHOT_TASK: &str = "setAnalogTask";
const DIGITAL_ONE_SHOT_SAMPLES: usize = 100;
const ANALOG_ONE_SHOT_SAMPLES: usize = 2;
/// Slack added to a one-shot task's nominal duration before timing out.
const ONE_SHOT_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 64;

/// Channel type of a synchronized input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InputKind {
    /// Analog voltage input
    Analog {
        /// Lower voltage limit
        min: f64,
        /// Upper voltage limit
        max: f64,
    },
    /// Edge-counting input
    Counter,
}

/// Input task clocked by a running scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Task name, unique within the session
    pub name: String,
    /// Logical target providing the channel
    pub target: String,
    /// Channel type
    pub kind: InputKind,
    /// Samples per channel
    pub samples: usize,
}

impl InputKind {
    fn resource(&self) -> ResourceKind {
        match self {
            Self::Analog { .. } => ResourceKind::AnalogIn,
            Self::Counter => ResourceKind::CounterIn,
        }
    }

    fn task_kind(&self) -> TaskKind {
        match *self {
            Self::Analog { min, max } => TaskKind::AnalogIn { min, max },
            Self::Counter => TaskKind::CounterIn,
        }
    }
}

/// Output tasks of one session under construction.
#[derive(Default)]
struct OutputTasks {
    analog: Option<Arc<HardwareTask>>,
    digital: Option<Arc<HardwareTask>>,
    timer: Option<Arc<HardwareTask>>,
}

impl OutputTasks {
    /// Timer first, analog last: the analog task drives the shared clock.
    fn start_order(&self) -> Vec<Arc<HardwareTask>> {
        [&self.timer, &self.digital, &self.analog]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Channels and per-channel samples of one resource kind.
struct ChannelSamples<T> {
    targets: Vec<String>,
    channels: Vec<String>,
    samples: Vec<Vec<T>>,
}

impl<T> ChannelSamples<T> {
    fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Drives the I/O device for scans and one-shot writes.
///
/// Every operation that touches the device takes the process-wide
/// [`ExclusiveLock`] first; a scan holds it until its session ends.
pub struct TaskCoordinator {
    driver: Arc<dyn IoDriver>,
    registry: Arc<DeviceRegistry>,
    config: HardwareConfig,
    lock: ExclusiveLock,
    events: broadcast::Sender<ScanEvent>,
}

impl TaskCoordinator {
    /// Create a coordinator for one device.
    pub fn new(driver: Arc<dyn IoDriver>, registry: Arc<DeviceRegistry>, config: HardwareConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            driver,
            registry,
            config,
            lock: ExclusiveLock::new(),
            events,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// True while a scan or one-shot write holds the device.
    pub fn is_busy(&self) -> bool {
        self.lock.is_held()
    }

    /// The device lock, shared with sessions.
    pub fn lock(&self) -> &ExclusiveLock {
        &self.lock
    }

    /// Target registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Hardware settings.
    pub fn config(&self) -> &HardwareConfig {
        &self.config
    }

    /// Drive a digital line to `level` with a short finite write.
    #[instrument(skip(self))]
    pub async fn set_digital_level(&self, target: &str, level: bool) -> Result<()> {
        let binding = self.registry.binding(target, ResourceKind::DigitalOut)?;
        let _token = self.lock.try_acquire(DIGITAL_ONE_SHOT_TASK)?;

        let spec = TaskSpec {
            name: DIGITAL_ONE_SHOT_TASK.to_string(),
            kind: TaskKind::DigitalOut,
            channels: vec![ResourceKind::DigitalOut
                .channel_name(&self.config.device, binding.resource.index)],
            clock: self.one_shot_clock(DIGITAL_ONE_SHOT_SAMPLES),
            start_trigger: None,
        };
        let samples = TaskSamples::Digital(vec![vec![level; DIGITAL_ONE_SHOT_SAMPLES]]);
        self.one_shot(spec, &samples, target, level.to_string()).await?;
        debug!(target, level, "Digital level set");
        Ok(())
    }

    /// Drive an analog channel to `value` volts within `[min, max]`.
    #[instrument(skip(self))]
    pub async fn set_analog_level(&self, target: &str, value: f64, min: f64, max: f64) -> Result<()> {
        let binding = self.registry.binding(target, ResourceKind::AnalogOut)?;
        let _token = self.lock.try_acquire(ANALOG_ONE_SHOT_TASK)?;

        let spec = TaskSpec {
            name: ANALOG_ONE_SHOT_TASK.to_string(),
            kind: TaskKind::AnalogOut { min, max },
            channels: vec![ResourceKind::AnalogOut
                .channel_name(&self.config.device, binding.resource.index)],
            clock: self.one_shot_clock(ANALOG_ONE_SHOT_SAMPLES),
            start_trigger: None,
        };
        let samples = TaskSamples::Analog(vec![vec![value; ANALOG_ONE_SHOT_SAMPLES]]);
        self.one_shot(spec, &samples, target, value.to_string()).await?;
        debug!(target, value, "Analog level set");
        Ok(())
    }

    fn one_shot_clock(&self, samples: usize) -> SampleClock {
        SampleClock {
            source: self.config.scan_clock.clone(),
            rate: self.config.one_shot_rate,
            samples_per_channel: samples,
        }
    }

    /// Create, write with auto-start, wait, then stop and close on every path.
    async fn one_shot(
        &self,
        spec: TaskSpec,
        samples: &TaskSamples,
        target: &str,
        value: String,
    ) -> Result<()> {
        let timeout = spec.clock.duration() + ONE_SHOT_TIMEOUT_MARGIN;
        let task = self.driver.create_task(spec)?;

        let result = match task.write(samples, true) {
            Ok(_) => task
                .wait_until_done(Some(timeout))
                .await
                .map_err(ScanError::from),
            Err(source) => Err(ScanError::HardwareWrite {
                target: target.to_string(),
                value,
                source,
            }),
        };
        release(task.as_ref());
        if let Err(e) = &result {
            warn!(target, error = %e, "One-shot write failed");
        }
        result
    }

    /// Build and start a synchronized scan from `waveforms`.
    ///
    /// Returns `Ok(None)` when no target of the set is bound to the device.
    /// On success the device stays locked until the returned session ends.
    #[instrument(skip_all)]
    pub async fn run_scan(&self, waveforms: &WaveformSet) -> Result<Option<ScanSession>> {
        let samples = waveforms.validate_shared_clock()?.unwrap_or(0);
        let analog = self.collect_channels(ResourceKind::AnalogOut, &waveforms.analog);
        let digital = self.collect_channels(ResourceKind::DigitalOut, &waveforms.digital);
        if analog.is_empty() && digital.is_empty() {
            info!("No signals to send");
            return Ok(None);
        }

        let token = self.lock.try_acquire("scan")?;
        let mut outputs = OutputTasks::default();
        if let Err(err) = self.build_outputs(&analog, &digital, samples, &mut outputs) {
            for task in outputs.start_order() {
                task.teardown(TaskState::Aborted);
            }
            drop(token);
            error!(error = %err, "Failed to build scan tasks");
            let _ = self.events.send(ScanEvent::BuildFailed {
                reason: err.to_string(),
            });
            return Err(err);
        }

        let has_analog = outputs.analog.is_some();
        let started = outputs.start_order();
        let (state, _) = watch::channel(ScanState::Building);
        let session = ScanSession {
            shared: Arc::new(SessionShared {
                id: Uuid::new_v4(),
                samples,
                clock_source: if has_analog {
                    AO_SAMPLE_CLOCK.to_string()
                } else {
                    self.config.scan_clock.clone()
                },
                has_analog,
                latch: CompletionLatch::new(started.len()),
                outputs: started.clone(),
                inputs: Mutex::new(BTreeMap::new()),
                token: Mutex::new(Some(token)),
                failed: AtomicBool::new(false),
                state,
                events: self.events.clone(),
            }),
        };

        session.shared.set_state(ScanState::Armed);
        info!(session = %session.id(), samples, tasks = started.len(), "Scan initiated");
        let _ = self.events.send(ScanEvent::Initiated {
            session: session.id(),
            samples,
        });

        for task in &started {
            if let Err(e) = task.io().start() {
                error!(task = task.name(), error = %e, "Failed to start scan task");
                session.abort();
                return Err(e.into());
            }
            task.set_state(TaskState::Running);
        }
        session.shared.advance(ScanState::Running);
        let _ = self.events.send(ScanEvent::Started {
            session: session.id(),
        });

        for task in started {
            tokio::spawn(monitor(session.shared.clone(), task));
        }
        Ok(Some(session))
    }

    /// Bound channels of `kind`, ordered by physical index.
    fn collect_channels<T: Clone>(
        &self,
        kind: ResourceKind,
        waveforms: &BTreeMap<String, Vec<T>>,
    ) -> ChannelSamples<T> {
        let mut out = ChannelSamples {
            targets: Vec::new(),
            channels: Vec::new(),
            samples: Vec::new(),
        };
        for binding in self.registry.sorted_bindings(kind) {
            if let Some(samples) = waveforms.get(&binding.target) {
                out.channels
                    .push(kind.channel_name(&self.config.device, binding.resource.index));
                out.samples.push(samples.clone());
                out.targets.push(binding.target);
            }
        }
        for target in waveforms.keys().filter(|t| !out.targets.contains(t)) {
            warn!(target = %target, resource = kind.label(), "Target not bound, skipping");
        }
        out
    }

    fn build_outputs(
        &self,
        analog: &ChannelSamples<f64>,
        digital: &ChannelSamples<bool>,
        samples: usize,
        outputs: &mut OutputTasks,
    ) -> Result<()> {
        let scan_clock = SampleClock {
            source: self.config.scan_clock.clone(),
            rate: self.config.sample_rate,
            samples_per_channel: samples,
        };

        if !analog.is_empty() {
            let task = self.create(TaskSpec {
                name: ANALOG_SCAN_TASK.to_string(),
                kind: TaskKind::AnalogOut {
                    min: self.config.scan_min_voltage,
                    max: self.config.scan_max_voltage,
                },
                channels: analog.channels.clone(),
                clock: scan_clock.clone(),
                start_trigger: None,
            })?;
            outputs.analog = Some(task.clone());
            arm(&task, &TaskSamples::Analog(analog.samples.clone()), &analog.targets, samples)?;
        }

        let has_analog = outputs.analog.is_some();
        if !digital.is_empty() {
            let source = if has_analog {
                AO_SAMPLE_CLOCK.to_string()
            } else {
                self.config.scan_clock.clone()
            };
            let task = self.create(TaskSpec {
                name: DIGITAL_SCAN_TASK.to_string(),
                kind: TaskKind::DigitalOut,
                channels: digital.channels.clone(),
                clock: SampleClock {
                    source,
                    ..scan_clock.clone()
                },
                start_trigger: None,
            })?;
            outputs.digital = Some(task.clone());
            arm(&task, &TaskSamples::Digital(digital.samples.clone()), &digital.targets, samples)?;
        }

        if let Some(timer) = &self.config.timer {
            let task = self.create(TaskSpec {
                name: TIMER_SCAN_TASK.to_string(),
                kind: TaskKind::CounterOut {
                    frequency_hz: timer.frequency_hz,
                },
                channels: vec![format!("{}/ctr{}", self.config.device, timer.counter)],
                clock: SampleClock {
                    source: self.config.scan_clock.clone(),
                    rate: timer.frequency_hz,
                    samples_per_channel: samples * timer.pulses_per_sample,
                },
                start_trigger: has_analog.then(|| AO_START_TRIGGER.to_string()),
            })?;
            // Pulse trains carry no samples
            task.set_state(TaskState::Armed);
            outputs.timer = Some(task);
        }
        Ok(())
    }

    fn create(&self, spec: TaskSpec) -> Result<Arc<HardwareTask>> {
        debug!(task = %spec.name, channels = ?spec.channels, clock = %spec.clock.source, "Creating task");
        let io = self.driver.create_task(spec)?;
        Ok(Arc::new(HardwareTask::new(io)))
    }

    /// Arm an input task on the clock of a running session.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn acquire_synchronized_input(&self, session: &ScanSession, spec: InputSpec) -> Result<()> {
        if session.state() != ScanState::Running {
            return Err(ScanError::SessionInactive(session.id()));
        }
        if spec.samples == 0 {
            return Err(ScanError::invalid_parameter("samples", "must be > 0"));
        }
        if session.shared.inputs.lock().contains_key(&spec.name) {
            return Err(ScanError::invalid_parameter(
                "name",
                format!("input task '{}' already exists", spec.name),
            ));
        }
        let resource = spec.kind.resource();
        let binding = self.registry.binding(&spec.target, resource)?;
        let shared = &session.shared;

        let task_spec = TaskSpec {
            name: spec.name.clone(),
            kind: spec.kind.task_kind(),
            channels: vec![resource.channel_name(&self.config.device, binding.resource.index)],
            clock: SampleClock {
                source: shared.clock_source.clone(),
                rate: self.config.sample_rate,
                samples_per_channel: spec.samples,
            },
            start_trigger: (self.config.use_start_trigger && shared.has_analog)
                .then(|| AO_START_TRIGGER.to_string()),
        };

        let task = match self.create(task_spec) {
            Ok(task) => task,
            Err(e) => {
                error!(input = %spec.name, error = %e, "Failed to create input task, aborting scan");
                session.abort();
                return Err(e);
            }
        };
        if let Err(e) = task.io().start() {
            error!(input = %spec.name, error = %e, "Failed to start input task, aborting scan");
            task.teardown(TaskState::Aborted);
            session.abort();
            return Err(e.into());
        }
        task.set_state(TaskState::Running);

        shared.inputs.lock().insert(spec.name.clone(), task.clone());
        // The session may have ended while the task was being armed
        if session.state().is_terminal() {
            shared.inputs.lock().remove(&spec.name);
            task.teardown(TaskState::Aborted);
            return Err(ScanError::SessionInactive(session.id()));
        }
        info!(input = %spec.name, target = %spec.target, "Synchronized input armed");
        Ok(())
    }

    /// Read samples from an armed input task.
    pub async fn read_input(
        &self,
        session: &ScanSession,
        name: &str,
        samples: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<f64>> {
        let task = session
            .shared
            .inputs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_input(name))?;
        Ok(task.io().read(samples, timeout).await?)
    }

    /// Stop and close an armed input task.
    pub fn stop_input(&self, session: &ScanSession, name: &str) -> Result<()> {
        let task = session
            .shared
            .inputs
            .lock()
            .remove(name)
            .ok_or_else(|| unknown_input(name))?;
        task.teardown(TaskState::Completed);
        Ok(())
    }
}

fn unknown_input(name: &str) -> ScanError {
    ScanError::invalid_parameter("name", format!("no input task named '{}'", name))
}

/// Load samples without starting; a rejected buffer names the targets it carried.
fn arm(task: &HardwareTask, samples: &TaskSamples, targets: &[String], count: usize) -> Result<()> {
    task.io()
        .write(samples, false)
        .map_err(|source| ScanError::HardwareWrite {
            target: targets.join(","),
            value: format!("{} samples", count),
            source,
        })?;
    task.set_state(TaskState::Armed);
    Ok(())
}

fn release(task: &dyn IoTask) {
    if let Err(e) = task.stop() {
        warn!(task = task.name(), error = %e, "Failed to stop task");
    }
    if let Err(e) = task.close() {
        warn!(task = task.name(), error = %e, "Failed to close task");
    }
}

/// Wait for one output task, release it and end the session after the last.
async fn monitor(shared: Arc<SessionShared>, task: Arc<HardwareTask>) {
    match task.io().wait_until_done(None).await {
        Ok(()) => {
            debug!(task = task.name(), "Task done");
            task.teardown(TaskState::Completed);
        }
        Err(e) => {
            if shared.state.borrow().is_terminal() {
                debug!(task = task.name(), "Task ended with session");
            } else {
                warn!(task = task.name(), error = %e, "Task failed");
                shared.failed.store(true, Ordering::Release);
            }
            task.teardown(TaskState::Aborted);
        }
    }

    if shared.latch.task_finished() {
        let outcome = if shared.failed.load(Ordering::Acquire) {
            ScanState::Aborted
        } else {
            ScanState::Completed
        };
        shared.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CompletionMode, DriverEvent, FaultScenario, MockIoDriver};
    use crate::registry::TargetInfo;

    fn target(analog: Option<u32>, digital: Option<u32>, ai: Option<u32>) -> TargetInfo {
        TargetInfo {
            analog_channel: analog,
            digital_line: digital,
            analog_input: ai,
            counter_input: None,
            conversion_factor: 1.0,
            for_scanning: analog.is_some(),
        }
    }

    fn coordinator(mode: CompletionMode) -> (TaskCoordinator, MockIoDriver) {
        let mut registry = DeviceRegistry::new();
        registry.insert("Stage_X", target(Some(1), None, None));
        registry.insert("Stage_Y", target(Some(0), None, None));
        registry.insert("Laser488", target(None, Some(3), None));
        registry.insert("Laser405", target(None, Some(1), None));
        registry.insert("PMT", target(None, None, Some(0)));
        let driver = MockIoDriver::with_mode(mode);
        let coordinator = TaskCoordinator::new(
            Arc::new(driver.clone()),
            Arc::new(registry),
            HardwareConfig::default(),
        );
        (coordinator, driver)
    }

    fn waveforms(samples: usize) -> WaveformSet {
        let mut set = WaveformSet::default();
        set.analog.insert("Stage_X".into(), vec![1.0; samples]);
        set.analog.insert("Stage_Y".into(), vec![2.0; samples]);
        set.digital.insert("Laser488".into(), vec![true; samples]);
        set.digital.insert("Laser405".into(), vec![false; samples]);
        set
    }

    #[tokio::test]
    async fn test_digital_one_shot() {
        let (coordinator, driver) = coordinator(CompletionMode::Auto);
        coordinator.set_digital_level("Laser488", true).await.unwrap();

        let written = driver.written_samples(DIGITAL_ONE_SHOT_TASK).unwrap();
        assert_eq!(written, TaskSamples::Digital(vec![vec![true; 100]]));
        assert_eq!(driver.open_task_count(), 0);
        assert!(!coordinator.is_busy());
        assert_eq!(coordinator.lock().release_count(), 1);
    }

    #[tokio::test]
    async fn test_one_shot_unbound_target() {
        let (coordinator, driver) = coordinator(CompletionMode::Auto);
        let err = coordinator.set_digital_level("Stage_X", true).await.unwrap_err();
        assert!(matches!(err, ScanError::UnboundTarget { .. }));
        assert!(driver.events().is_empty());
    }

    #[tokio::test]
    async fn test_analog_one_shot_out_of_range() {
        let (coordinator, driver) = coordinator(CompletionMode::Auto);
        let err = coordinator
            .set_analog_level("Stage_X", 12.0, -10.0, 10.0)
            .await
            .unwrap_err();
        match err {
            ScanError::HardwareWrite { target, value, .. } => {
                assert_eq!(target, "Stage_X");
                assert_eq!(value, "12");
            }
            other => panic!("expected HardwareWrite, got {:?}", other),
        }
        assert_eq!(driver.open_task_count(), 0);
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_scan_channel_order_and_clocks() {
        let (coordinator, driver) = coordinator(CompletionMode::Manual);
        let session = coordinator.run_scan(&waveforms(50)).await.unwrap().unwrap();
        assert_eq!(session.state(), ScanState::Running);

        let created: Vec<(String, Vec<String>, String)> = driver
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DriverEvent::Created { task, channels, clock } => Some((task, channels, clock)),
                _ => None,
            })
            .collect();
        assert_eq!(created[0].0, ANALOG_SCAN_TASK);
        assert_eq!(created[0].1, vec!["Dev1/ao0", "Dev1/ao1"]);
        assert_eq!(created[0].2, "100kHzTimebase");
        assert_eq!(created[1].1, vec!["Dev1/port0/line1", "Dev1/port0/line3"]);
        assert_eq!(created[1].2, AO_SAMPLE_CLOCK);

        // Y is on ao0 so its samples come first
        match driver.written_samples(ANALOG_SCAN_TASK).unwrap() {
            TaskSamples::Analog(channels) => assert_eq!(channels[0][0], 2.0),
            other => panic!("unexpected samples {:?}", other),
        }

        let starts: Vec<String> = driver
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DriverEvent::Started { task } => Some(task),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![DIGITAL_SCAN_TASK, ANALOG_SCAN_TASK]);

        driver.complete_all();
        assert_eq!(session.wait().await, ScanState::Completed);
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_digital_only_uses_scan_clock() {
        let (coordinator, driver) = coordinator(CompletionMode::Auto);
        let mut set = WaveformSet::default();
        set.digital.insert("Laser488".into(), vec![true; 10]);
        let session = coordinator.run_scan(&set).await.unwrap().unwrap();
        assert_eq!(session.wait().await, ScanState::Completed);

        let clock = driver.events().into_iter().find_map(|e| match e {
            DriverEvent::Created { clock, .. } => Some(clock),
            _ => None,
        });
        assert_eq!(clock.as_deref(), Some("100kHzTimebase"));
    }

    #[tokio::test]
    async fn test_empty_scan_does_not_lock() {
        let (coordinator, driver) = coordinator(CompletionMode::Auto);
        assert!(coordinator.run_scan(&WaveformSet::default()).await.unwrap().is_none());

        let mut unbound = WaveformSet::default();
        unbound.analog.insert("Unknown".into(), vec![0.0; 5]);
        assert!(coordinator.run_scan(&unbound).await.unwrap().is_none());
        assert!(driver.events().is_empty());
        assert_eq!(coordinator.lock().release_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_leaves_session_untouched() {
        let (coordinator, driver) = coordinator(CompletionMode::Manual);
        let session = coordinator.run_scan(&waveforms(20)).await.unwrap().unwrap();
        let events_before = driver.events().len();

        let err = coordinator.run_scan(&waveforms(20)).await.unwrap_err();
        assert!(matches!(err, ScanError::DeviceBusy));
        let err = coordinator.set_digital_level("Laser405", true).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(driver.events().len(), events_before);
        assert_eq!(session.state(), ScanState::Running);

        assert!(session.abort());
        assert!(!session.abort());
        assert_eq!(session.wait().await, ScanState::Aborted);
        assert_eq!(driver.open_task_count(), 0);
        assert_eq!(coordinator.lock().release_count(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_releases_everything() {
        let (coordinator, driver) = coordinator(CompletionMode::Manual);
        driver.inject(FaultScenario::CreateFails {
            channel: "Dev1/port0/line3".into(),
        });
        let mut events = coordinator.subscribe();

        let err = coordinator.run_scan(&waveforms(20)).await.unwrap_err();
        assert!(matches!(err, ScanError::Device(_)));
        assert_eq!(driver.open_task_count(), 0);
        assert!(!coordinator.is_busy());
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::BuildFailed { .. }));
    }

    #[tokio::test]
    async fn test_synchronized_input() {
        let (coordinator, driver) = coordinator(CompletionMode::Manual);
        let session = coordinator.run_scan(&waveforms(20)).await.unwrap().unwrap();
        let spec = InputSpec {
            name: "PMTInput".into(),
            target: "PMT".into(),
            kind: InputKind::Analog { min: -5.0, max: 5.0 },
            samples: 20,
        };
        coordinator.acquire_synchronized_input(&session, spec.clone()).await.unwrap();
        assert_eq!(session.input_tasks(), vec!["PMTInput"]);

        let clock = driver.events().into_iter().find_map(|e| match e {
            DriverEvent::Created { task, clock, .. } if task == "PMTInput" => Some(clock),
            _ => None,
        });
        assert_eq!(clock.as_deref(), Some(AO_SAMPLE_CLOCK));

        let data = coordinator.read_input(&session, "PMTInput", 20, None).await.unwrap();
        assert_eq!(data.len(), 20);

        driver.complete_all();
        session.wait().await;
        let err = coordinator
            .acquire_synchronized_input(&session, spec)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::SessionInactive(_)));
        assert!(session.input_tasks().is_empty());
        assert_eq!(driver.open_task_count(), 0);
    }
}
