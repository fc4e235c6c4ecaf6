//! Dataset writer contract and the in-memory backend.

use super::SaveFormat;
use crate::acquisition::{Detector, Frame};
use crate::error::{Result, ScanError};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Caller metadata stored as root attributes.
pub type Attributes = serde_json::Map<String, Value>;

/// Geometry and provenance of one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    /// Source detector
    pub detector_name: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel size in micrometres
    pub pixel_size_um: f64,
}

impl DatasetLayout {
    /// Layout for frames of `detector`.
    pub fn for_detector(detector: &dyn Detector) -> Self {
        let (width, height) = detector.shape();
        Self {
            detector_name: detector.name().to_string(),
            width,
            height,
            pixel_size_um: detector.pixel_size_um(),
        }
    }

    /// Voxel size along `[frame, y, x]`.
    pub fn element_size_um(&self) -> [f64; 3] {
        [1.0, self.pixel_size_um, self.pixel_size_um]
    }

    /// Root attributes: caller metadata plus the detector name.
    pub fn root_attributes(&self, attrs: &Attributes) -> Attributes {
        let mut root = attrs.clone();
        root.insert("detector_name".into(), Value::from(self.detector_name.clone()));
        root
    }

    /// Reject frames whose geometry differs from the layout.
    pub fn check_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        if frame.width != self.width || frame.height != self.height || !frame.is_consistent() {
            bail!(
                "frame {} is {}x{} with {} pixels, dataset expects {}x{}",
                frame.sequence,
                frame.width,
                frame.height,
                frame.pixels.len(),
                self.width,
                self.height
            );
        }
        Ok(())
    }
}

/// Append-only frame dataset.
///
/// Backends report failures with `anyhow`; the recorder maps them to
/// [`ScanError::StorageWrite`].
#[async_trait]
pub trait DatasetWriter: Send {
    /// Container path.
    fn path(&self) -> &Path;

    /// Frames persisted so far.
    fn frames_written(&self) -> u64;

    /// Append frames in order; returns the new total.
    async fn append(&mut self, frames: &[Frame]) -> anyhow::Result<u64>;

    /// Flush and release the container. Safe to call twice.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Snapshot of an in-memory dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContents {
    /// Root attributes
    pub attributes: Attributes,
    /// Frames in append order
    pub frames: Vec<Frame>,
    /// `close` was called
    pub closed: bool,
}

/// In-process dataset for tests and dry runs.
pub struct MemoryDataset {
    path: PathBuf,
    layout: DatasetLayout,
    contents: Arc<Mutex<MemoryContents>>,
    fail_after: Option<u64>,
}

impl MemoryDataset {
    /// Create an empty dataset.
    pub fn new(path: impl Into<PathBuf>, layout: DatasetLayout, attrs: &Attributes) -> Self {
        let contents = MemoryContents {
            attributes: layout.root_attributes(attrs),
            ..Default::default()
        };
        Self {
            path: path.into(),
            layout,
            contents: Arc::new(Mutex::new(contents)),
            fail_after: None,
        }
    }

    /// Fail any append that would take the total past `frames`.
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Shared view of the contents, valid after the writer is gone.
    pub fn contents(&self) -> Arc<Mutex<MemoryContents>> {
        self.contents.clone()
    }
}

#[async_trait]
impl DatasetWriter for MemoryDataset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frames_written(&self) -> u64 {
        self.contents.lock().frames.len() as u64
    }

    async fn append(&mut self, frames: &[Frame]) -> anyhow::Result<u64> {
        let mut contents = self.contents.lock();
        if contents.closed {
            bail!("dataset is closed");
        }
        for frame in frames {
            self.layout.check_frame(frame)?;
            if let Some(limit) = self.fail_after {
                if contents.frames.len() as u64 >= limit {
                    return Err(anyhow!("injected failure after {} frames", limit));
                }
            }
            contents.frames.push(frame.clone());
        }
        Ok(contents.frames.len() as u64)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.contents.lock().closed = true;
        Ok(())
    }
}

/// Create a dataset of `format` at `path`.
pub async fn open_dataset(
    format: SaveFormat,
    path: &Path,
    layout: DatasetLayout,
    attrs: &Attributes,
) -> Result<Box<dyn DatasetWriter>> {
    if !format.is_available() {
        return Err(ScanError::Config(format!(
            "Save format '{}' is not enabled in this build",
            format
        )));
    }
    tracing::debug!(?path, %format, detector = %layout.detector_name, "Opening dataset");
    let storage_error = |e: anyhow::Error| ScanError::StorageWrite {
        path: path.to_path_buf(),
        frames_written: 0,
        reason: format!("{:#}", e),
    };

    match format {
        SaveFormat::Memory => Ok(Box::new(MemoryDataset::new(path, layout, attrs))),
        #[cfg(feature = "storage_zarr")]
        SaveFormat::Zarr => Ok(Box::new(
            super::zarr::ZarrDataset::create(path, layout, attrs)
                .await
                .map_err(storage_error)?,
        )),
        #[cfg(feature = "storage_hdf5")]
        SaveFormat::Hdf5 => Ok(Box::new(
            super::h5::Hdf5Dataset::create(path, layout, attrs)
                .await
                .map_err(storage_error)?,
        )),
        #[allow(unreachable_patterns)]
        other => Err(storage_error(anyhow!("no backend for {}", other))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn layout() -> DatasetLayout {
        DatasetLayout {
            detector_name: "Camera1".into(),
            width: 4,
            height: 2,
            pixel_size_um: 0.65,
        }
    }

    pub(crate) fn frames(first: u64, count: u64) -> Vec<Frame> {
        (first..first + count)
            .map(|s| Frame::new(4, 2, vec![s as u16; 8], s))
            .collect()
    }

    #[tokio::test]
    async fn test_memory_dataset() {
        let mut attrs = Attributes::new();
        attrs.insert("objective".into(), Value::from("20x"));
        let mut dataset = MemoryDataset::new("mem://scan", layout(), &attrs);
        let contents = dataset.contents();

        assert_eq!(dataset.append(&frames(0, 3)).await.unwrap(), 3);
        assert_eq!(dataset.append(&frames(3, 2)).await.unwrap(), 5);
        dataset.close().await.unwrap();
        assert!(dataset.append(&frames(5, 1)).await.is_err());

        let contents = contents.lock();
        assert!(contents.closed);
        assert_eq!(contents.frames.len(), 5);
        assert_eq!(contents.attributes["detector_name"], "Camera1");
        assert_eq!(contents.attributes["objective"], "20x");
    }

    #[tokio::test]
    async fn test_shape_mismatch_rejected() {
        let mut dataset = MemoryDataset::new("mem://scan", layout(), &Attributes::new());
        let wrong = Frame::new(2, 2, vec![0; 4], 0);
        assert!(dataset.append(&[wrong]).await.is_err());
        assert_eq!(dataset.frames_written(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let mut dataset =
            MemoryDataset::new("mem://scan", layout(), &Attributes::new()).failing_after(2);
        assert!(dataset.append(&frames(0, 3)).await.is_err());
        assert_eq!(dataset.frames_written(), 2);
    }

    #[test]
    fn test_element_size() {
        assert_eq!(layout().element_size_um(), [1.0, 0.65, 0.65]);
    }
}
