//! # scan_daq
//!
//! Hardware-synchronized scan-and-acquire engine. A scan drives stage
//! positioners with analog ramps and light sources with TTL pulse trains,
//! all clocked off one sample clock, while detectors stream frames to a
//! live view and to chunked on-disk datasets.
//!
//! ## Crate Structure
//!
//! - **`waveform`**: raster ramps and pulse trains from designer parameters
//!   (`ScanPlanner`, `RasterScanDesigner`, `PulseCycleDesigner`).
//! - **`registry`**: logical target → physical channel/line lookup.
//! - **`hardware`**: timed I/O tasks on a clocked device (`TaskCoordinator`,
//!   `ScanSession`), the `IoDriver` contract and a simulated driver.
//! - **`acquisition`**: detector polling with live slots and recorder
//!   transfer queues (`LiveAcquisitionLoop`).
//! - **`recorder`**: streaming of frame batches to Zarr, HDF5 or memory
//!   datasets (`StreamingRecorder`, `RecordingManager`).
//! - **`scheduler`**: ordered delayed actions (`DelayedTaskScheduler`).
//! - **`config`**: figment-based configuration (`AppConfig`).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `ScanError` taxonomy.
//!
//! ## Data flow
//!
//! ```text
//! ScanParameters ──▶ ScanPlanner ──▶ WaveformSet ──▶ TaskCoordinator ──▶ IoDriver
//!                                                         │ ScanEvent
//! Detector ──▶ LiveAcquisitionLoop ──▶ live slots / AcquisitionEvent
//!                       │ FrameBatch
//!                       ▼
//!               StreamingRecorder ──▶ DatasetWriter (zarr | hdf5 | memory)
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod waveform;

pub use acquisition::{Detector, Frame, LiveAcquisitionLoop};
pub use config::AppConfig;
pub use error::{Result, ScanError};
pub use hardware::{ScanSession, TaskCoordinator};
pub use recorder::{RecordingManager, StreamingRecorder};
pub use registry::DeviceRegistry;
pub use scheduler::DelayedTaskScheduler;
pub use waveform::{ScanPlanner, WaveformSet};
