//! HDF5 backend (hdf5-metno).

use super::dataset::{Attributes, DatasetLayout, DatasetWriter};
use crate::acquisition::Frame;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hdf5::types::VarLenUnicode;
use ndarray::{s, Array3};
use std::path::{Path, PathBuf};

/// Resizable chunked `data` dataset in an HDF5 file.
pub struct Hdf5Dataset {
    path: PathBuf,
    file: Option<hdf5::File>,
    dataset: hdf5::Dataset,
    layout: DatasetLayout,
    frames: u64,
}

fn write_group_attr(group: &hdf5::Group, name: &str, value: &str) -> Result<()> {
    let value = value
        .parse::<VarLenUnicode>()
        .map_err(|e| anyhow!("Attribute '{}' is not valid text: {}", name, e))?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

impl Hdf5Dataset {
    /// Create the file with root attributes and an empty dataset.
    pub async fn create(path: &Path, layout: DatasetLayout, attrs: &Attributes) -> Result<Self> {
        let output_path = path.to_path_buf();
        let root_attributes = layout.root_attributes(attrs);
        let task_layout = layout.clone();
        let task_path = output_path.clone();

        let (file, dataset) = tokio::task::spawn_blocking(move || -> Result<(hdf5::File, hdf5::Dataset)> {
            let file = hdf5::File::create(&task_path)?;
            for (key, value) in &root_attributes {
                // Strings stay as-is, everything else as JSON text
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                write_group_attr(&file, key, &text)?;
            }

            let h = task_layout.height as usize;
            let w = task_layout.width as usize;
            let dataset = file
                .new_dataset::<u16>()
                .chunk((1, h, w))
                .shape((0.., h, w))
                .create("data")?;
            let element_size = task_layout.element_size_um();
            dataset
                .new_attr::<f64>()
                .shape(element_size.len())
                .create("element_size_um")?
                .write_raw(&element_size[..])?;
            Ok((file, dataset))
        })
        .await??;

        tracing::info!(path = %output_path.display(), detector = %layout.detector_name, "HDF5 dataset created");
        Ok(Self {
            path: output_path,
            file: Some(file),
            dataset,
            layout,
            frames: 0,
        })
    }
}

#[async_trait]
impl DatasetWriter for Hdf5Dataset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    async fn append(&mut self, frames: &[Frame]) -> Result<u64> {
        if self.file.is_none() {
            return Err(anyhow!("dataset is closed"));
        }
        if frames.is_empty() {
            return Ok(self.frames);
        }
        for frame in frames {
            self.layout.check_frame(frame)?;
        }

        let h = self.layout.height as usize;
        let w = self.layout.width as usize;
        let n = frames.len();
        let start = self.frames as usize;
        let pixels: Vec<u16> = frames.iter().flat_map(|f| f.pixels.iter().copied()).collect();
        let dataset = self.dataset.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let block = Array3::from_shape_vec((n, h, w), pixels)?;
            dataset.resize((start + n, h, w))?;
            dataset.write_slice(&block, s![start..start + n, .., ..])?;
            Ok(())
        })
        .await??;

        self.frames += n as u64;
        Ok(self.frames)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let frames = self.frames;
        tokio::task::spawn_blocking(move || -> Result<()> {
            file.flush()?;
            file.close()?;
            Ok(())
        })
        .await??;
        tracing::info!(path = %self.path.display(), frames, "HDF5 dataset closed");
        Ok(())
    }
}
