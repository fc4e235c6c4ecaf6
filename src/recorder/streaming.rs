//! Drain loop that appends transfer-queue batches to a dataset.

use super::dataset::DatasetWriter;
use crate::acquisition::{Frame, FrameBatch};
use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// When a recording ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RecordingMode {
    /// After exactly this many frames
    FrameCount(u64),
    /// Once this much time has elapsed
    Duration(Duration),
    /// Only on `stop()` or when the queue closes
    UntilStopped,
}

/// Progress notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordingProgress {
    /// Frames written so far
    Frames {
        /// Total frames written
        frame_number: u64,
    },
    /// Time elapsed since start
    Elapsed {
        /// Seconds since the recording started
        seconds: f64,
    },
    /// Dataset closed cleanly
    Completed {
        /// Total frames written
        frames_written: u64,
    },
}

/// How a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingOutcome {
    /// Target reached or the queue closed
    Completed,
    /// `stop()` was called
    Stopped,
}

/// Result of a finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    /// Dataset path
    pub path: PathBuf,
    /// Frames in the dataset
    pub frames_written: u64,
    /// How it ended
    pub outcome: RecordingOutcome,
    /// Wall time from start to close
    pub elapsed: Duration,
}

/// Control of one running recording.
pub struct RecordingHandle {
    path: PathBuf,
    stop: watch::Sender<bool>,
    progress: Option<mpsc::UnboundedReceiver<RecordingProgress>>,
    frames: Arc<AtomicU64>,
    task: JoinHandle<Result<RecordingSummary>>,
}

impl RecordingHandle {
    /// Dataset path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Take the progress stream; `None` after the first call.
    pub fn progress(&mut self) -> Option<mpsc::UnboundedReceiver<RecordingProgress>> {
        self.progress.take()
    }

    /// Ask the recording to flush queued batches and close.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// True once the drain loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the recording to end.
    pub async fn wait(self) -> Result<RecordingSummary> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ScanError::StorageWrite {
                path: self.path,
                frames_written: self.frames.load(Ordering::Acquire),
                reason: format!("recording task failed: {}", e),
            }),
        }
    }
}

/// Spawns drain loops.
pub struct StreamingRecorder;

impl StreamingRecorder {
    /// Start appending batches from `batches` to `writer` until `mode` is satisfied.
    pub fn start(
        writer: Box<dyn DatasetWriter>,
        mode: RecordingMode,
        batches: mpsc::Receiver<FrameBatch>,
    ) -> RecordingHandle {
        let path = writer.path().to_path_buf();
        let (stop, stop_rx) = watch::channel(false);
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let frames = Arc::new(AtomicU64::new(0));

        let session = Session {
            writer,
            mode,
            progress: progress_tx,
            frames: frames.clone(),
            started: Instant::now(),
        };
        info!(path = %path.display(), ?mode, "Recording started");
        let task = tokio::spawn(session.run(batches, stop_rx));

        RecordingHandle {
            path,
            stop,
            progress: Some(progress),
            frames,
            task,
        }
    }
}

struct Session {
    writer: Box<dyn DatasetWriter>,
    mode: RecordingMode,
    progress: mpsc::UnboundedSender<RecordingProgress>,
    frames: Arc<AtomicU64>,
    started: Instant,
}

/// Resolves to true on a stop request, false if the handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) -> bool {
    stop.wait_for(|s| *s).await.is_ok()
}

impl Session {
    fn deadline(&self) -> Option<Instant> {
        match self.mode {
            RecordingMode::Duration(d) => Some(self.started + d),
            _ => None,
        }
    }

    fn target_reached(&self) -> bool {
        matches!(self.mode, RecordingMode::FrameCount(n) if self.writer.frames_written() >= n)
    }

    async fn run(
        mut self,
        mut batches: mpsc::Receiver<FrameBatch>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<RecordingSummary> {
        let deadline = self.deadline();
        let mut stop_live = true;
        let mut outcome = RecordingOutcome::Completed;

        while !self.target_reached() {
            let batch = tokio::select! {
                biased;
                requested = stop_requested(&mut stop), if stop_live => {
                    if requested {
                        outcome = RecordingOutcome::Stopped;
                        break;
                    }
                    stop_live = false;
                    continue;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!("Recording duration reached");
                    break;
                }
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        debug!("Transfer queue closed");
                        break;
                    }
                },
            };
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            self.write(batch).await?;
        }

        if outcome == RecordingOutcome::Stopped {
            while let Ok(batch) = batches.try_recv() {
                if self.target_reached() {
                    break;
                }
                self.write(batch).await?;
            }
        }
        self.finish(outcome).await
    }

    async fn write(&mut self, mut batch: Vec<Frame>) -> Result<()> {
        if let RecordingMode::FrameCount(n) = self.mode {
            let room = n.saturating_sub(self.writer.frames_written());
            batch.truncate(usize::try_from(room).unwrap_or(usize::MAX));
        }
        if batch.is_empty() {
            return Ok(());
        }

        match self.writer.append(&batch).await {
            Ok(total) => {
                self.frames.store(total, Ordering::Release);
                let progress = match self.mode {
                    RecordingMode::Duration(_) => RecordingProgress::Elapsed {
                        seconds: self.started.elapsed().as_secs_f64(),
                    },
                    _ => RecordingProgress::Frames { frame_number: total },
                };
                let _ = self.progress.send(progress);
                Ok(())
            }
            Err(e) => {
                let frames_written = self.writer.frames_written();
                self.frames.store(frames_written, Ordering::Release);
                error!(path = %self.writer.path().display(), frames_written, error = %e, "Recording write failed");
                if let Err(close_err) = self.writer.close().await {
                    warn!(error = %close_err, "Failed to close dataset after write failure");
                }
                Err(ScanError::StorageWrite {
                    path: self.writer.path().to_path_buf(),
                    frames_written,
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    async fn finish(mut self, outcome: RecordingOutcome) -> Result<RecordingSummary> {
        let frames_written = self.writer.frames_written();
        let path = self.writer.path().to_path_buf();
        self.writer
            .close()
            .await
            .map_err(|e| ScanError::StorageWrite {
                path: path.clone(),
                frames_written,
                reason: format!("{:#}", e),
            })?;

        let _ = self.progress.send(RecordingProgress::Completed { frames_written });
        let elapsed = self.started.elapsed();
        info!(path = %path.display(), frames_written, ?outcome, ?elapsed, "Recording finished");
        Ok(RecordingSummary {
            path,
            frames_written,
            outcome,
            elapsed,
        })
    }
}
