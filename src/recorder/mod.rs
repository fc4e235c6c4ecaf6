//! Streaming recorder
//!
//! Appends frame batches from a transfer queue to a growable chunked dataset.
//!
//! # Dataset layout
//!
//! One container per recording session:
//!
//! ```text
//! <name>.zarr / <name>.h5
//! ├── (root attributes)   caller metadata + detector_name
//! └── data                u16 [frames, height, width], chunk [1, height, width]
//!                         element_size_um = [1, px, px]
//! ```
//!
//! The frame dimension grows with every append. Frames written before a
//! failure stay in the container.

mod dataset;
#[cfg(feature = "storage_hdf5")]
mod h5;
mod manager;
mod streaming;
#[cfg(feature = "storage_zarr")]
mod zarr;

pub use dataset::{open_dataset, Attributes, DatasetLayout, DatasetWriter, MemoryContents, MemoryDataset};
#[cfg(feature = "storage_hdf5")]
pub use h5::Hdf5Dataset;
pub use manager::{save_file_path, RecordingGroup, RecordingManager, RecordingRequest};
pub use streaming::{
    RecordingHandle, RecordingMode, RecordingOutcome, RecordingProgress, RecordingSummary,
    StreamingRecorder,
};
#[cfg(feature = "storage_zarr")]
pub use zarr::ZarrDataset;

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk container format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Zarr V3 directory store
    #[default]
    Zarr,
    /// HDF5 file
    Hdf5,
    /// In-process buffer, nothing reaches disk
    Memory,
}

impl SaveFormat {
    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zarr => "zarr",
            Self::Hdf5 => "h5",
            Self::Memory => "mem",
        }
    }

    /// True when the backend was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Zarr => cfg!(feature = "storage_zarr"),
            Self::Hdf5 => cfg!(feature = "storage_hdf5"),
            Self::Memory => true,
        }
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Zarr => "zarr",
            Self::Hdf5 => "hdf5",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        assert_eq!(SaveFormat::default(), SaveFormat::Zarr);
        let format: SaveFormat = toml::from_str::<toml::Value>("f = \"hdf5\"")
            .unwrap()
            .get("f")
            .cloned()
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(format, SaveFormat::Hdf5);
        assert_eq!(format.extension(), "h5");
        assert!(SaveFormat::Memory.is_available());
    }
}
