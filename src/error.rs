//! Error types for the scan-and-acquire engine.
//!
//! `ScanError` is the single error type surfaced by every public operation.
//! Variants carry enough context (target, requested value, device message) to
//! reproduce a failure from the log line alone.
//!
//! ## Error Hierarchy
//!
//! - **Synthesis** (`ParameterMismatch`, `InvalidParameter`, `SampleCountMismatch`):
//!   raised before any hardware is touched.
//! - **Hardware** (`UnboundTarget`, `DeviceBusy`, `HardwareWrite`, `Device`,
//!   `SessionInactive`): a scan session always releases its lock before one of
//!   these propagates.
//! - **Acquisition** (`NoDetectors`, `UnknownDetector`, `InvalidHandle`, `Detector`).
//! - **Storage** (`StorageWrite`): the dataset is closed before it propagates;
//!   frames already written stay on disk.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Category of a device-level failure reported by an I/O driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The channel or line is already owned by another task.
    ResourceReserved,
    /// The sample buffer was rejected (size or range).
    InvalidSamples,
    /// The task could not be configured.
    Configuration,
    /// Waiting for the task timed out.
    Timeout,
    /// Any other hardware fault.
    Hardware,
}

/// Error reported by an I/O driver for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceError {
    /// Name of the task that failed.
    pub task: String,
    /// Failure category.
    pub kind: DeviceErrorKind,
    /// Driver message.
    pub message: String,
}

impl DeviceError {
    /// Create a new device error.
    pub fn new(task: impl Into<String>, kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.task, self.kind, self.message)
    }
}

impl std::error::Error for DeviceError {}

/// Errors raised by the scan-and-acquire engine.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Caller parameters differ from the designer's declared key set.
    #[error("Parameter mismatch for {designer}: missing {missing:?}, unexpected {extra:?}")]
    ParameterMismatch {
        /// Designer that rejected the parameters.
        designer: String,
        /// Expected keys that were not supplied.
        missing: Vec<String>,
        /// Supplied keys the designer does not know.
        extra: Vec<String>,
    },

    /// A parameter is present but its value is unusable.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Sequences sharing one sample clock have different lengths.
    #[error("Sample count mismatch for '{target}': expected {expected}, found {found}")]
    SampleCountMismatch {
        /// Offending target.
        target: String,
        /// Length shared by the other sequences.
        expected: usize,
        /// Length of this target's sequence.
        found: usize,
    },

    /// The logical target has no physical channel or line of the requested kind.
    #[error("Target '{target}' has no {resource} assigned")]
    UnboundTarget {
        /// Logical target name.
        target: String,
        /// Resource kind that was looked up.
        resource: &'static str,
    },

    /// Another hardware operation holds the exclusivity lock.
    #[error("I/O device is busy with another operation")]
    DeviceBusy,

    /// The device rejected samples for a target.
    #[error("Hardware write to '{target}' (value {value}) failed: {source}")]
    HardwareWrite {
        /// Logical target name.
        target: String,
        /// Requested value, formatted.
        value: String,
        /// Underlying device error.
        #[source]
        source: DeviceError,
    },

    /// Task creation, start or teardown failed.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// The operation needs a running scan session.
    #[error("Scan session {0} is not running")]
    SessionInactive(uuid::Uuid),

    /// The acquisition loop was created without detectors.
    #[error("No detectors available")]
    NoDetectors,

    /// No detector with this name is attached.
    #[error("Unknown detector '{0}'")]
    UnknownDetector(String),

    /// The acquisition handle is unknown or was already released.
    #[error("Invalid or already used handle {0}")]
    InvalidHandle(u64),

    /// A detector driver reported a failure.
    #[error("Detector '{detector}' failed: {message}")]
    Detector {
        /// Detector name.
        detector: String,
        /// Driver message.
        message: String,
    },

    /// Writing a recording failed; frames written before remain on disk.
    #[error("Storage write to {path:?} failed after {frames_written} frames: {reason}")]
    StorageWrite {
        /// Dataset container path.
        path: PathBuf,
        /// Frames persisted before the failure.
        frames_written: u64,
        /// Backend message.
        reason: String,
    },

    /// Configuration could not be loaded or is semantically invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Shorthand for [`ScanError::InvalidParameter`].
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Check if the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy)
    }

    /// Check if this error ends the session it occurred in.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::Device(_) | Self::StorageWrite { .. } | Self::SampleCountMismatch { .. }
        )
    }
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
