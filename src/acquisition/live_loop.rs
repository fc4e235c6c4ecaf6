//! Fixed-period detector polling with live slots and transfer queues.

use super::detector::{Detector, Frame, FrameBatch};
use super::transfer::{Delivery, TransferQueues};
use crate::config::AcquisitionConfig;
use crate::error::{Result, ScanError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// Which surface opened a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Acquisition for recording or processing
    Acquisition,
    /// Live display
    LiveView,
}

/// Keeps acquisition running while held; release with the matching stop call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AcquisitionHandle {
    id: u64,
    kind: HandleKind,
}

impl AcquisitionHandle {
    /// Handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Surface that opened the handle.
    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

/// Frame published for the current detector.
#[derive(Debug, Clone)]
pub struct ImageUpdate {
    /// Detector name
    pub detector: String,
    /// The frame
    pub frame: Arc<Frame>,
    /// First frame after a switch
    pub init: bool,
    /// Always true for broadcast updates
    pub is_current: bool,
}

/// Notifications from the acquisition loop.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// Capture and polling started
    Started,
    /// Polling and capture stopped
    Stopped,
    /// New frame of the current detector
    Image(ImageUpdate),
    /// Current detector changed
    DetectorSwitched {
        /// Newly current detector
        new: String,
        /// Previously current detector
        old: String,
    },
}

struct PublishState {
    current: String,
    /// Next published frame of the current detector is marked `init`
    pending_init: bool,
}

struct LoopShared {
    detectors: Vec<Arc<dyn Detector>>,
    slots: BTreeMap<String, watch::Sender<Option<Arc<Frame>>>>,
    publish: tokio::sync::Mutex<PublishState>,
    events: broadcast::Sender<AcquisitionEvent>,
    transfers: TransferQueues,
    period: watch::Sender<Duration>,
    running: AtomicBool,
}

impl LoopShared {
    fn polled(&self) -> impl Iterator<Item = &Arc<dyn Detector>> {
        self.detectors.iter().filter(|d| d.for_acquisition())
    }

    fn detector(&self, name: &str) -> Option<&Arc<dyn Detector>> {
        self.detectors.iter().find(|d| d.name() == name)
    }

    async fn tick(&self) {
        for detector in self.polled() {
            match detector.latest_frame().await {
                Ok(Some(frame)) => self.publish(detector.name(), frame, false).await,
                Ok(None) => trace!(detector = detector.name(), "No frame yet"),
                Err(e) => warn!(detector = detector.name(), error = %e, "Frame fetch failed"),
            }
        }
        self.transfer().await;
    }

    /// Drain buffered frames into every open transfer queue.
    async fn transfer(&self) {
        for name in self.transfers.detectors() {
            let Some(detector) = self.detector(&name) else {
                continue;
            };
            let frames = match detector.buffered_frames().await {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(detector = %name, error = %e, "Buffered frame fetch failed");
                    Vec::new()
                }
            };
            if self.transfers.deliver(&name, frames) == Delivery::Pending {
                debug!(detector = %name, "Transfer queue full, keeping batch");
            }
        }
    }

    async fn publish(&self, detector: &str, frame: Frame, force: bool) {
        let mut publish = self.publish.lock().await;
        self.publish_locked(&mut publish, detector, frame, force);
    }

    /// Store in the live slot and broadcast if current. Stale or repeated
    /// frames are skipped unless `force` is set.
    fn publish_locked(&self, publish: &mut PublishState, detector: &str, mut frame: Frame, force: bool) {
        let Some(slot) = self.slots.get(detector) else {
            return;
        };
        let is_current = publish.current == detector;
        let seen = slot
            .borrow()
            .as_ref()
            .is_some_and(|last| last.sequence >= frame.sequence);
        if seen && !force && !(is_current && publish.pending_init) {
            return;
        }

        if is_current {
            frame.init = publish.pending_init;
            publish.pending_init = false;
        } else {
            frame.init = false;
        }
        let frame = Arc::new(frame);
        slot.send_replace(Some(frame.clone()));
        if is_current {
            let _ = self.events.send(AcquisitionEvent::Image(ImageUpdate {
                detector: detector.to_string(),
                init: frame.init,
                frame,
                is_current: true,
            }));
        }
    }
}

struct PollTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct LoopControl {
    next_handle: u64,
    handles: HashMap<u64, HandleKind>,
    poll: Option<PollTask>,
}

/// Keeps per-detector live frames current while any handle is open.
///
/// Opening the first handle starts capture on every polled detector and the
/// poll task; releasing the last one stops the poll (awaited) and then
/// capture, so no fetch reaches a stopped detector.
pub struct LiveAcquisitionLoop {
    shared: Arc<LoopShared>,
    control: tokio::sync::Mutex<LoopControl>,
    queue_capacity: usize,
}

impl LiveAcquisitionLoop {
    /// Create a loop over `detectors`; the first one is current.
    pub fn new(detectors: Vec<Arc<dyn Detector>>, config: &AcquisitionConfig) -> Result<Self> {
        let first = detectors.first().ok_or(ScanError::NoDetectors)?.name().to_string();
        let period = config.update_period();
        if period.is_zero() {
            return Err(ScanError::invalid_parameter("update_period_ms", "must be > 0"));
        }
        let slots = detectors
            .iter()
            .map(|d| (d.name().to_string(), watch::channel(None).0))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(LoopShared {
                detectors,
                slots,
                publish: tokio::sync::Mutex::new(PublishState {
                    current: first,
                    pending_init: false,
                }),
                events,
                transfers: TransferQueues::default(),
                period: watch::channel(period).0,
                running: AtomicBool::new(false),
            }),
            control: tokio::sync::Mutex::new(LoopControl::default()),
            queue_capacity: config.transfer_queue_capacity,
        })
    }

    /// Open an acquisition handle.
    pub async fn start_acquisition(&self) -> Result<AcquisitionHandle> {
        self.open_handle(HandleKind::Acquisition).await
    }

    /// Open a live-view handle.
    pub async fn start_live_view(&self) -> Result<AcquisitionHandle> {
        self.open_handle(HandleKind::LiveView).await
    }

    /// Release an acquisition handle.
    pub async fn stop_acquisition(&self, handle: AcquisitionHandle) -> Result<()> {
        self.close_handle(handle, HandleKind::Acquisition).await
    }

    /// Release a live-view handle.
    pub async fn stop_live_view(&self, handle: AcquisitionHandle) -> Result<()> {
        self.close_handle(handle, HandleKind::LiveView).await
    }

    /// True while the poll task runs.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Subscribe to loop events.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.shared.events.subscribe()
    }

    /// Live slot of one detector.
    pub fn latest(&self, detector: &str) -> Result<watch::Receiver<Option<Arc<Frame>>>> {
        self.shared
            .slots
            .get(detector)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| ScanError::UnknownDetector(detector.to_string()))
    }

    /// Names of all detectors in construction order.
    pub fn detector_names(&self) -> Vec<String> {
        self.shared.detectors.iter().map(|d| d.name().to_string()).collect()
    }

    /// Detector by name.
    pub fn detector(&self, name: &str) -> Result<Arc<dyn Detector>> {
        self.shared
            .detector(name)
            .cloned()
            .ok_or_else(|| ScanError::UnknownDetector(name.to_string()))
    }

    /// Name of the current detector.
    pub async fn current_detector(&self) -> String {
        self.shared.publish.lock().await.current.clone()
    }

    /// Poll period.
    pub fn update_period(&self) -> Duration {
        *self.shared.period.borrow()
    }

    /// Change the poll period; a running poll picks it up immediately.
    pub fn set_update_period(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(ScanError::invalid_parameter("update_period", "must be > 0"));
        }
        self.shared.period.send_replace(period);
        debug!(?period, "Update period changed");
        Ok(())
    }

    /// Stream buffered frames of `detector` into a bounded queue.
    ///
    /// `capacity` of `None` uses the configured default. Replaces an earlier
    /// queue of the same detector.
    pub fn open_transfer_queue(
        &self,
        detector: &str,
        capacity: Option<usize>,
    ) -> Result<mpsc::Receiver<FrameBatch>> {
        if !self.shared.slots.contains_key(detector) {
            return Err(ScanError::UnknownDetector(detector.to_string()));
        }
        Ok(self
            .shared
            .transfers
            .open(detector, capacity.unwrap_or(self.queue_capacity)))
    }

    /// Make `name` the current detector.
    ///
    /// The next frame published for it carries `init = true`. When running,
    /// its latest frame is published right away. Capture is left untouched.
    #[instrument(skip(self))]
    pub async fn set_current_detector(&self, name: &str) -> Result<()> {
        let detector = self.detector(name)?;
        let mut publish = self.shared.publish.lock().await;
        if publish.current == name {
            return Ok(());
        }
        let old = std::mem::replace(&mut publish.current, name.to_string());
        publish.pending_init = true;
        info!(new = name, old = %old, "Current detector switched");
        let _ = self.shared.events.send(AcquisitionEvent::DetectorSwitched {
            new: name.to_string(),
            old,
        });

        if self.is_running() {
            let frame = match detector.latest_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(detector = name, error = %e, "Frame fetch failed");
                    None
                }
            };
            let frame = frame.or_else(|| {
                self.shared.slots[name]
                    .borrow()
                    .as_ref()
                    .map(|f| Frame::clone(f))
            });
            if let Some(frame) = frame {
                self.shared.publish_locked(&mut publish, name, frame, true);
            }
        }
        Ok(())
    }

    async fn open_handle(&self, kind: HandleKind) -> Result<AcquisitionHandle> {
        let mut control = self.control.lock().await;
        if control.handles.is_empty() {
            self.start_polling(&mut control).await?;
        }
        let id = control.next_handle;
        control.next_handle += 1;
        control.handles.insert(id, kind);
        debug!(handle = id, ?kind, open = control.handles.len(), "Handle opened");
        Ok(AcquisitionHandle { id, kind })
    }

    async fn close_handle(&self, handle: AcquisitionHandle, kind: HandleKind) -> Result<()> {
        let mut control = self.control.lock().await;
        if handle.kind != kind || control.handles.get(&handle.id) != Some(&kind) {
            return Err(ScanError::InvalidHandle(handle.id));
        }
        control.handles.remove(&handle.id);
        debug!(handle = handle.id, ?kind, open = control.handles.len(), "Handle released");
        if control.handles.is_empty() {
            self.stop_polling(&mut control).await;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn start_polling(&self, control: &mut LoopControl) -> Result<()> {
        let mut started: Vec<&Arc<dyn Detector>> = Vec::new();
        for detector in self.shared.polled() {
            if let Err(e) = detector.start_capture().await {
                error!(detector = detector.name(), error = %e, "Failed to start capture");
                for d in started {
                    if let Err(e) = d.stop_capture().await {
                        warn!(detector = d.name(), error = %e, "Failed to stop capture");
                    }
                }
                return Err(e);
            }
            started.push(detector);
        }

        // Prime every live slot once
        for detector in self.shared.polled() {
            if let Ok(Some(frame)) = detector.latest_frame().await {
                let mut frame = frame;
                frame.init = false;
                if let Some(slot) = self.shared.slots.get(detector.name()) {
                    slot.send_replace(Some(Arc::new(frame)));
                }
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        shared.running.store(true, Ordering::Release);
        let handle = tokio::spawn(poll_loop(shared, shutdown_rx));
        control.poll = Some(PollTask { handle, shutdown });

        info!(detectors = self.shared.polled().count(), period = ?self.update_period(), "Acquisition started");
        let _ = self.shared.events.send(AcquisitionEvent::Started);
        Ok(())
    }

    #[instrument(skip_all)]
    async fn stop_polling(&self, control: &mut LoopControl) {
        if let Some(poll) = control.poll.take() {
            let _ = poll.shutdown.send(true);
            if let Err(e) = poll.handle.await {
                error!(error = %e, "Poll task failed");
            }
        }
        self.shared.running.store(false, Ordering::Release);

        // Poll is joined; drain once more while the drivers are still live
        self.shared.transfer().await;
        for detector in self.shared.polled() {
            if let Err(e) = detector.stop_capture().await {
                warn!(detector = detector.name(), error = %e, "Failed to stop capture");
            }
        }

        info!("Acquisition stopped");
        let _ = self.shared.events.send(AcquisitionEvent::Stopped);
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn poll_loop(shared: Arc<LoopShared>, mut shutdown: watch::Receiver<bool>) {
    let mut period = shared.period.subscribe();
    let mut ticks = ticker(*period.borrow_and_update());
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = period.changed() => {
                if changed.is_err() {
                    break;
                }
                ticks = ticker(*period.borrow_and_update());
            }
            _ = ticks.tick() => shared.tick().await,
        }
    }
    debug!("Poll loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::MockDetector;

    fn config() -> AcquisitionConfig {
        AcquisitionConfig {
            update_period_ms: 10,
            transfer_queue_capacity: 4,
        }
    }

    fn detectors() -> (Arc<MockDetector>, Arc<MockDetector>, Vec<Arc<dyn Detector>>) {
        let a = Arc::new(MockDetector::manual("CamA", 4, 4));
        let b = Arc::new(MockDetector::manual("CamB", 4, 4));
        let list: Vec<Arc<dyn Detector>> = vec![a.clone(), b.clone()];
        (a, b, list)
    }

    #[test]
    fn test_requires_detectors() {
        assert!(matches!(
            LiveAcquisitionLoop::new(Vec::new(), &config()),
            Err(ScanError::NoDetectors)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_are_reference_counted() {
        let (a, _b, list) = detectors();
        let acq = LiveAcquisitionLoop::new(list, &config()).unwrap();

        let h1 = acq.start_acquisition().await.unwrap();
        let h2 = acq.start_live_view().await.unwrap();
        assert_eq!(a.capture_starts(), 1);
        assert!(acq.is_running());

        // Wrong surface
        let h2_id = h2.id();
        assert!(matches!(
            acq.stop_acquisition(h2.clone()).await,
            Err(ScanError::InvalidHandle(id)) if id == h2_id
        ));
        acq.stop_acquisition(h1.clone()).await.unwrap();
        assert!(acq.is_running());
        assert!(acq.stop_acquisition(h1).await.is_err());
        acq.stop_live_view(h2).await.unwrap();
        assert!(!acq.is_running());

        let h3 = acq.start_live_view().await.unwrap();
        acq.stop_live_view(h3).await.unwrap();
        assert!(!acq.is_running());
        assert_eq!(a.capture_starts(), 2);
        assert_eq!(a.capture_stops(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_current_detector_only() {
        let (a, b, list) = detectors();
        let acq = LiveAcquisitionLoop::new(list, &config()).unwrap();
        let mut events = acq.subscribe();
        let handle = acq.start_acquisition().await.unwrap();

        a.inject_frames(1);
        b.inject_frames(1);
        tokio::time::sleep(Duration::from_millis(25)).await;

        let mut images = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AcquisitionEvent::Image(update) = event {
                images.push(update);
            }
        }
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].detector, "CamA");
        assert!(!images[0].init);
        assert!(acq.latest("CamB").unwrap().borrow().is_some());

        acq.stop_acquisition(handle).await.unwrap();
        let fetches = a.fetches_after_stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.fetches_after_stop(), fetches);
        assert_eq!(fetches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_transfer_precedes_capture_stop() {
        let (a, b, list) = detectors();
        let acq = LiveAcquisitionLoop::new(list, &config()).unwrap();
        let mut queue_a = acq.open_transfer_queue("CamA", None).unwrap();
        let _queue_b = acq.open_transfer_queue("CamB", None).unwrap();
        let handle = acq.start_acquisition().await.unwrap();

        a.inject_frames(2);
        tokio::time::sleep(Duration::from_millis(15)).await;
        // Captured after the last tick, picked up by the stop drain
        a.inject_frames(3);
        acq.stop_acquisition(handle).await.unwrap();

        let mut sequences = Vec::new();
        while let Ok(batch) = queue_a.try_recv() {
            sequences.extend(batch.iter().map(|f| f.sequence));
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.fetches_after_stop(), 0);
        assert_eq!(b.fetches_after_stop(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_last_frame() {
        let (a, _b, list) = detectors();
        let acq = LiveAcquisitionLoop::new(list, &config()).unwrap();
        let handle = acq.start_acquisition().await.unwrap();

        a.inject_frames(1);
        tokio::time::sleep(Duration::from_millis(15)).await;
        a.set_fail_fetch(true);
        a.inject_frames(1);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let slot = acq.latest("CamA").unwrap();
        assert_eq!(slot.borrow().as_ref().map(|f| f.sequence), Some(0));
        a.set_fail_fetch(false);
        acq.stop_acquisition(handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_period_change() {
        let (_a, _b, list) = detectors();
        let acq = LiveAcquisitionLoop::new(list, &config()).unwrap();
        assert!(acq.set_update_period(Duration::ZERO).is_err());
        acq.set_update_period(Duration::from_millis(50)).unwrap();
        assert_eq!(acq.update_period(), Duration::from_millis(50));
    }
}
