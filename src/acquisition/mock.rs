//! Simulated detector.
//!
//! Frames come either from an internal generator task running at the
//! configured frame interval, or from [`MockDetector::inject_frames`] when
//! built with [`MockDetector::manual`]. Pixels follow the test pattern in
//! [`super::pattern`].

use super::detector::{Detector, Frame};
use super::pattern::generate_test_pattern;
use crate::config::DetectorConfig;
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Frames kept for `buffered_frames` before the oldest are dropped
const MAX_BUFFERED_FRAMES: usize = 256;

#[derive(Default)]
struct SensorState {
    latest: Option<Frame>,
    buffer: VecDeque<Frame>,
    next_sequence: u64,
    dropped: u64,
}

struct Sensor {
    name: String,
    width: u32,
    height: u32,
    capturing: AtomicBool,
    state: Mutex<SensorState>,
}

impl Sensor {
    fn capture(&self) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let frame = Frame::new(
            self.width,
            self.height,
            generate_test_pattern(self.width, self.height, sequence),
            sequence,
        );
        if state.buffer.len() == MAX_BUFFERED_FRAMES {
            state.buffer.pop_front();
            state.dropped += 1;
            if state.dropped == 1 || state.dropped % 100 == 0 {
                warn!(detector = %self.name, dropped = state.dropped, "Frame buffer overrun");
            }
        }
        state.buffer.push_back(frame.clone());
        state.latest = Some(frame);
        sequence
    }
}

/// Simulated detector with failure injection and call accounting.
pub struct MockDetector {
    sensor: Arc<Sensor>,
    pixel_size_um: f64,
    for_acquisition: bool,
    /// `None` for manually driven detectors
    frame_interval: Option<Duration>,
    generator: Mutex<Option<JoinHandle<()>>>,
    fail_fetch: AtomicBool,
    capture_starts: AtomicU64,
    capture_stops: AtomicU64,
    fetches_after_stop: AtomicU64,
}

impl MockDetector {
    /// Detector whose generator produces a frame every `frame_interval_ms`.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let mut detector = Self::manual(&config.name, config.width, config.height);
        detector.pixel_size_um = config.pixel_size_um;
        detector.for_acquisition = config.for_acquisition;
        detector.frame_interval = Some(Duration::from_millis(config.frame_interval_ms.max(1)));
        detector
    }

    /// Detector that only produces frames through [`inject_frames`](Self::inject_frames).
    pub fn manual(name: &str, width: u32, height: u32) -> Self {
        Self {
            sensor: Arc::new(Sensor {
                name: name.to_string(),
                width,
                height,
                capturing: AtomicBool::new(false),
                state: Mutex::new(SensorState::default()),
            }),
            pixel_size_um: 1.0,
            for_acquisition: true,
            frame_interval: None,
            generator: Mutex::new(None),
            fail_fetch: AtomicBool::new(false),
            capture_starts: AtomicU64::new(0),
            capture_stops: AtomicU64::new(0),
            fetches_after_stop: AtomicU64::new(0),
        }
    }

    /// Exclude the detector from acquisition polling.
    pub fn excluded(mut self) -> Self {
        self.for_acquisition = false;
        self
    }

    /// Capture `count` frames now; returns the last sequence number.
    pub fn inject_frames(&self, count: usize) -> Option<u64> {
        (0..count).map(|_| self.sensor.capture()).last()
    }

    /// Make `latest_frame` fail until cleared.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::Release);
    }

    /// True between `start_capture` and `stop_capture`.
    pub fn is_capturing(&self) -> bool {
        self.sensor.capturing.load(Ordering::Acquire)
    }

    /// Number of `start_capture` calls.
    pub fn capture_starts(&self) -> u64 {
        self.capture_starts.load(Ordering::Acquire)
    }

    /// Number of `stop_capture` calls.
    pub fn capture_stops(&self) -> u64 {
        self.capture_stops.load(Ordering::Acquire)
    }

    /// Frame reads (`latest_frame` or `buffered_frames`) made after capture
    /// was stopped.
    pub fn fetches_after_stop(&self) -> u64 {
        self.fetches_after_stop.load(Ordering::Acquire)
    }

    fn note_fetch(&self) {
        if !self.is_capturing() && self.capture_stops() > 0 {
            self.fetches_after_stop.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Frames dropped by buffer overrun.
    pub fn dropped_frames(&self) -> u64 {
        self.sensor.state.lock().dropped
    }
}

impl Drop for MockDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.generator.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn name(&self) -> &str {
        &self.sensor.name
    }

    fn shape(&self) -> (u32, u32) {
        (self.sensor.width, self.sensor.height)
    }

    fn pixel_size_um(&self) -> f64 {
        self.pixel_size_um
    }

    fn for_acquisition(&self) -> bool {
        self.for_acquisition
    }

    async fn start_capture(&self) -> Result<()> {
        if self.sensor.capturing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.capture_starts.fetch_add(1, Ordering::AcqRel);

        if let Some(interval) = self.frame_interval {
            let sensor = self.sensor.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // First tick fires immediately
                ticker.tick().await;
                while sensor.capturing.load(Ordering::Acquire) {
                    ticker.tick().await;
                    let sequence = sensor.capture();
                    trace!(detector = %sensor.name, sequence, "Frame captured");
                }
            });
            if let Some(old) = self.generator.lock().replace(handle) {
                old.abort();
            }
        }
        debug!(detector = %self.sensor.name, "Capture started");
        Ok(())
    }

    async fn stop_capture(&self) -> Result<()> {
        self.sensor.capturing.store(false, Ordering::Release);
        self.capture_stops.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = self.generator.lock().take() {
            handle.abort();
        }
        debug!(detector = %self.sensor.name, "Capture stopped");
        Ok(())
    }

    async fn latest_frame(&self) -> Result<Option<Frame>> {
        self.note_fetch();
        if self.fail_fetch.load(Ordering::Acquire) {
            return Err(ScanError::Detector {
                detector: self.sensor.name.clone(),
                message: "Injected fetch failure".to_string(),
            });
        }
        Ok(self.sensor.state.lock().latest.clone())
    }

    async fn buffered_frames(&self) -> Result<Vec<Frame>> {
        self.note_fetch();
        Ok(self.sensor.state.lock().buffer.drain(..).collect())
    }
}
