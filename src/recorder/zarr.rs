//! Zarr V3 backend.
//!
//! All store I/O runs on the blocking pool. The frame dimension is grown by
//! rewriting the array metadata with the new extent before the new chunks
//! are stored; chunks are one frame each, so existing chunks are untouched.

use super::dataset::{Attributes, DatasetLayout, DatasetWriter};
use crate::acquisition::Frame;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

/// Path of the frame array inside the store.
pub const DATA_ARRAY: &str = "/data";

/// Growable `[frames, height, width]` u16 array in a filesystem store.
pub struct ZarrDataset {
    path: PathBuf,
    store: ReadableWritableListableStorage,
    layout: DatasetLayout,
    root_attributes: Attributes,
    frames: u64,
    closed: bool,
}

impl ZarrDataset {
    /// Create the store, the root group and an empty frame array.
    pub async fn create(path: &Path, layout: DatasetLayout, attrs: &Attributes) -> anyhow::Result<Self> {
        let output_path = path.to_path_buf();
        let mut root_attributes = layout.root_attributes(attrs);
        root_attributes.insert("created".into(), Value::from(chrono::Utc::now().to_rfc3339()));

        let store = {
            let path = output_path.clone();
            let layout = layout.clone();
            let root_attributes = root_attributes.clone();
            tokio::task::spawn_blocking(move || -> anyhow::Result<ReadableWritableListableStorage> {
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                let store: ReadableWritableListableStorage = Arc::new(
                    FilesystemStore::new(&path)
                        .map_err(|e| anyhow!("Failed to create Zarr store: {}", e))?,
                );
                write_root_group(&store, root_attributes)?;
                frame_array(&store, &layout, 0)?
                    .store_metadata()
                    .map_err(|e| anyhow!("Failed to store array metadata: {}", e))?;
                Ok(store)
            })
            .await??
        };

        tracing::info!(path = %output_path.display(), detector = %layout.detector_name, "Zarr dataset created");
        Ok(Self {
            path: output_path,
            store,
            layout,
            root_attributes,
            frames: 0,
            closed: false,
        })
    }
}

fn write_root_group(store: &ReadableWritableListableStorage, attributes: Attributes) -> anyhow::Result<()> {
    GroupBuilder::new()
        .attributes(attributes)
        .build(store.clone(), "/")
        .map_err(|e| anyhow!("Failed to create root group: {}", e))?
        .store_metadata()
        .map_err(|e| anyhow!("Failed to store root group metadata: {}", e))
}

/// Array handle describing `frames` frames of `layout`.
fn frame_array(
    store: &ReadableWritableListableStorage,
    layout: &DatasetLayout,
    frames: u64,
) -> anyhow::Result<Array<dyn ReadableWritableListableStorageTraits>> {
    let height = u64::from(layout.height);
    let width = u64::from(layout.width);
    let mut attributes = serde_json::Map::new();
    attributes.insert("element_size_um".into(), json!(layout.element_size_um()));
    attributes.insert("_ARRAY_DIMENSIONS".into(), json!(["frame", "y", "x"]));

    let mut builder = ArrayBuilder::new(
        vec![frames, height, width],
        vec![1, height, width],
        DataType::UInt16,
        FillValue::from(0u16),
    );
    builder.attributes(attributes);
    builder.dimension_names(Some(vec![
        Some("frame".to_string()),
        Some("y".to_string()),
        Some("x".to_string()),
    ]));
    builder
        .build(store.clone(), DATA_ARRAY)
        .map_err(|e| anyhow!("Failed to build array '{}': {}", DATA_ARRAY, e))
}

#[async_trait]
impl DatasetWriter for ZarrDataset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    async fn append(&mut self, frames: &[Frame]) -> anyhow::Result<u64> {
        if self.closed {
            return Err(anyhow!("dataset is closed"));
        }
        if frames.is_empty() {
            return Ok(self.frames);
        }
        for frame in frames {
            self.layout.check_frame(frame)?;
        }

        let start = self.frames;
        let total = start + frames.len() as u64;
        let chunks: Vec<Vec<u16>> = frames.iter().map(|f| f.pixels.clone()).collect();
        let store = self.store.clone();
        let layout = self.layout.clone();

        // Count only frames whose chunk reached the store
        let written = tokio::task::spawn_blocking(move || -> (u64, anyhow::Result<()>) {
            let array = match frame_array(&store, &layout, total) {
                Ok(array) => array,
                Err(e) => return (0, Err(e)),
            };
            if let Err(e) = array.store_metadata() {
                return (0, Err(anyhow!("Failed to grow array to {} frames: {}", total, e)));
            }
            for (i, pixels) in chunks.iter().enumerate() {
                let index = start + i as u64;
                if let Err(e) = array.store_chunk_elements(&[index, 0, 0], pixels) {
                    return (i as u64, Err(anyhow!("Failed to write frame {}: {}", index, e)));
                }
            }
            (chunks.len() as u64, Ok(()))
        })
        .await
        .map_err(|e| anyhow!("Zarr write task failed: {}", e))?;

        self.frames += written.0;
        written.1?;
        tracing::trace!(path = %self.path.display(), frames = self.frames, "Frames appended");
        Ok(self.frames)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let store = self.store.clone();
        let mut attributes = self.root_attributes.clone();
        attributes.insert("frame_count".into(), Value::from(self.frames));
        tokio::task::spawn_blocking(move || write_root_group(&store, attributes)).await??;
        tracing::info!(path = %self.path.display(), frames = self.frames, "Zarr dataset closed");
        Ok(())
    }
}
