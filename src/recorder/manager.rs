//! Recording sessions on top of the live acquisition loop.

use super::dataset::{open_dataset, Attributes, DatasetLayout, DatasetWriter};
use super::streaming::{RecordingHandle, RecordingMode, RecordingSummary, StreamingRecorder};
use super::SaveFormat;
use crate::acquisition::{AcquisitionHandle, Frame, FrameBatch, LiveAcquisitionLoop};
use crate::error::{Result, ScanError};
use crate::scheduler::{DelayedTaskScheduler, ScheduledRun};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// How long a snap waits for the first live frame
const SNAP_TIMEOUT: Duration = Duration::from_secs(2);

/// First free `dir/name.ext`, then `dir/name_1.ext`, `dir/name_2.ext`, ...
pub fn save_file_path(dir: &Path, name: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{}.{}", name, extension));
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|i| dir.join(format!("{}_{}.{}", name, i, extension)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Where and what to record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRequest {
    /// Detectors to record, one dataset each
    pub detectors: Vec<String>,
    /// Output directory, created if missing
    pub save_dir: PathBuf,
    /// Base file name; the detector name is appended
    pub name: String,
    /// Container format
    pub format: SaveFormat,
    /// Caller metadata stored as root attributes
    pub attributes: Attributes,
}

impl RecordingRequest {
    /// Request for `detectors` with empty metadata.
    pub fn new(
        detectors: impl IntoIterator<Item = impl Into<String>>,
        save_dir: impl Into<PathBuf>,
        name: impl Into<String>,
        format: SaveFormat,
    ) -> Self {
        Self {
            detectors: detectors.into_iter().map(Into::into).collect(),
            save_dir: save_dir.into(),
            name: name.into(),
            format,
            attributes: Attributes::new(),
        }
    }

    /// Add one root attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.detectors.is_empty() {
            return Err(ScanError::invalid_parameter("detectors", "at least one detector is required"));
        }
        if self.name.trim().is_empty() {
            return Err(ScanError::invalid_parameter("name", "must not be empty"));
        }
        Ok(())
    }

    fn file_name(&self, detector: &str) -> String {
        format!("{}_{}", self.name, detector)
    }
}

/// Recordings started together, one per detector.
///
/// Holds an acquisition handle that is released by [`wait`](Self::wait).
pub struct RecordingGroup {
    recordings: Vec<(String, RecordingHandle)>,
    acquisition: Arc<LiveAcquisitionLoop>,
    handle: AcquisitionHandle,
}

impl RecordingGroup {
    /// Dataset paths keyed by detector.
    pub fn paths(&self) -> Vec<(String, PathBuf)> {
        self.recordings
            .iter()
            .map(|(d, h)| (d.clone(), h.path().to_path_buf()))
            .collect()
    }

    /// Recording of one detector.
    pub fn recording(&mut self, detector: &str) -> Option<&mut RecordingHandle> {
        self.recordings
            .iter_mut()
            .find(|(d, _)| d == detector)
            .map(|(_, h)| h)
    }

    /// Stop every recording.
    pub fn stop(&self) {
        for (_, handle) in &self.recordings {
            handle.stop();
        }
    }

    /// Wait for every recording, then release acquisition.
    ///
    /// All recordings are awaited even if one fails; the first error is returned.
    pub async fn wait(self) -> Result<Vec<RecordingSummary>> {
        let results = futures::future::join_all(
            self.recordings.into_iter().map(|(_, handle)| handle.wait()),
        )
        .await;
        if let Err(e) = self.acquisition.stop_acquisition(self.handle).await {
            warn!(error = %e, "Failed to release acquisition handle");
        }
        results.into_iter().collect()
    }
}

/// Starts recordings, snaps and time-lapses against a shared acquisition loop.
#[derive(Clone)]
pub struct RecordingManager {
    acquisition: Arc<LiveAcquisitionLoop>,
}

impl RecordingManager {
    /// Manager over `acquisition`.
    pub fn new(acquisition: Arc<LiveAcquisitionLoop>) -> Self {
        Self { acquisition }
    }

    /// The shared acquisition loop.
    pub fn acquisition(&self) -> &Arc<LiveAcquisitionLoop> {
        &self.acquisition
    }

    async fn open_writer(&self, request: &RecordingRequest, detector: &str) -> Result<Box<dyn DatasetWriter>> {
        let layout = DatasetLayout::for_detector(self.acquisition.detector(detector)?.as_ref());
        let path = save_file_path(
            &request.save_dir,
            &request.file_name(detector),
            request.format.extension(),
        );
        open_dataset(request.format, &path, layout, &request.attributes).await
    }

    async fn prepare_dir(dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    /// Record every requested detector until `mode` is satisfied.
    ///
    /// Frame-count recordings accept exactly one detector.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn start_recording(&self, request: &RecordingRequest, mode: RecordingMode) -> Result<RecordingGroup> {
        request.validate()?;
        if matches!(mode, RecordingMode::FrameCount(_)) && request.detectors.len() != 1 {
            return Err(ScanError::invalid_parameter(
                "detectors",
                format!(
                    "frame-count recording needs exactly one detector, got {}",
                    request.detectors.len()
                ),
            ));
        }
        for detector in &request.detectors {
            self.acquisition.detector(detector)?;
        }
        Self::prepare_dir(&request.save_dir).await?;

        let mut writers = Vec::with_capacity(request.detectors.len());
        for detector in &request.detectors {
            match self.open_writer(request, detector).await {
                Ok(writer) => writers.push((detector.clone(), writer)),
                Err(e) => {
                    close_all(writers).await;
                    return Err(e);
                }
            }
        }

        // Queues exist before capture starts so no early frame is missed
        let mut queues: Vec<mpsc::Receiver<FrameBatch>> = Vec::with_capacity(writers.len());
        for (detector, _) in &writers {
            match self.acquisition.open_transfer_queue(detector, None) {
                Ok(queue) => queues.push(queue),
                Err(e) => {
                    close_all(writers).await;
                    return Err(e);
                }
            }
        }

        let handle = match self.acquisition.start_acquisition().await {
            Ok(handle) => handle,
            Err(e) => {
                close_all(writers).await;
                return Err(e);
            }
        };

        let recordings = writers
            .into_iter()
            .zip(queues)
            .map(|((detector, writer), queue)| (detector, StreamingRecorder::start(writer, mode, queue)))
            .collect::<Vec<_>>();
        info!(recordings = recordings.len(), "Recording group started");

        Ok(RecordingGroup {
            recordings,
            acquisition: self.acquisition.clone(),
            handle,
        })
    }

    /// Write the current live frame of each requested detector to its own
    /// one-frame dataset.
    ///
    /// Acquisition is started briefly if it is not running.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn snap(&self, request: &RecordingRequest) -> Result<Vec<PathBuf>> {
        request.validate()?;
        Self::prepare_dir(&request.save_dir).await?;

        let handle = self.acquisition.start_acquisition().await?;
        let frames = self.collect_live_frames(&request.detectors).await;
        if let Err(e) = self.acquisition.stop_acquisition(handle).await {
            warn!(error = %e, "Failed to release acquisition handle");
        }

        let mut paths = Vec::with_capacity(request.detectors.len());
        for (detector, frame) in request.detectors.iter().zip(frames?) {
            let mut writer = self.open_writer(request, detector).await?;
            let path = writer.path().to_path_buf();
            let written = writer.append(std::slice::from_ref(&frame)).await;
            let closed = writer.close().await;
            written.and(closed).map_err(|e| ScanError::StorageWrite {
                path: path.clone(),
                frames_written: writer.frames_written(),
                reason: format!("{:#}", e),
            })?;
            info!(detector = %detector, path = %path.display(), sequence = frame.sequence, "Snap saved");
            paths.push(path);
        }
        Ok(paths)
    }

    async fn collect_live_frames(&self, detectors: &[String]) -> Result<Vec<Frame>> {
        let mut frames = Vec::with_capacity(detectors.len());
        for detector in detectors {
            let mut slot = self.acquisition.latest(detector)?;
            let frame = tokio::time::timeout(SNAP_TIMEOUT, slot.wait_for(Option::is_some))
                .await
                .ok()
                .and_then(|r| r.ok().and_then(|f| f.as_deref().cloned()));
            let frame = frame.ok_or_else(|| ScanError::Detector {
                detector: detector.clone(),
                message: "no frame available".to_string(),
            })?;
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Take `count` snaps `interval` apart on a background task.
    ///
    /// Snap `i` is named `<name>_t<i>`; the first is taken immediately.
    pub fn record_lapse(&self, request: RecordingRequest, count: usize, interval: Duration) -> Result<ScheduledRun> {
        request.validate()?;
        if count == 0 {
            return Err(ScanError::invalid_parameter("count", "must be > 0"));
        }

        let mut scheduler = DelayedTaskScheduler::new();
        for i in 0..count {
            let manager = self.clone();
            let mut snap = request.clone();
            snap.name = format!("{}_t{:04}", request.name, i);
            snap.attributes.insert("timepoint".into(), Value::from(i));
            let delay = if i == 0 { Duration::ZERO } else { interval };
            scheduler.schedule(snap.name.clone(), delay, move || async move {
                manager.snap(&snap).await.map(|_| ())
            });
        }
        info!(name = %request.name, count, ?interval, "Time-lapse scheduled");
        Ok(scheduler.spawn())
    }
}

async fn close_all(writers: Vec<(String, Box<dyn DatasetWriter>)>) {
    for (detector, mut writer) in writers {
        if let Err(e) = writer.close().await {
            warn!(detector = %detector, error = %e, "Failed to close dataset");
        }
    }
}
