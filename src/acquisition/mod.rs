//! Live acquisition
//!
//! A [`LiveAcquisitionLoop`] polls every participating detector at a fixed
//! period while at least one handle is open.
//!
//! ```text
//!                ┌──► live slot (watch, one per detector)
//! latest_frame ──┤
//!                └──► ImageUpdate broadcast (current detector only)
//!
//! buffered_frames ──► transfer queue (bounded mpsc, one per detector)
//! ```
//!
//! Transfer queues feed recorders. A full queue defers the batch to the next
//! tick; a dropped receiver closes the queue.

mod detector;
mod live_loop;
mod mock;
mod pattern;
mod transfer;

pub use detector::{
    Detector, DetectorFactories, DetectorFactory, DetectorKind, Frame, FrameBatch,
    MockDetectorFactory,
};
pub use live_loop::{AcquisitionEvent, AcquisitionHandle, HandleKind, ImageUpdate, LiveAcquisitionLoop};
pub use mock::MockDetector;
pub use pattern::generate_test_pattern;
