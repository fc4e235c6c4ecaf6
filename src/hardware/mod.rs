//! Hardware task coordination
//!
//! Turns a [`WaveformSet`](crate::waveform::WaveformSet) into clocked driver
//! tasks, starts them in dependency order and tears them down exactly once.
//!
//! # Clocking
//!
//! ```text
//! scan_clock ──► ScanAOTask ──► ao/SampleClock ──► ScanDOTask
//!                    │                        └──► synchronized inputs
//!                    └────────► ao/StartTrigger ─► ScanTimerTask
//! ```
//!
//! Start order is timer, digital, analog: every follower is armed before the
//! analog task emits its first clock edge.
//!
//! # Exclusivity
//!
//! The device is guarded by one [`ExclusiveLock`]. A scan session owns its
//! [`SessionToken`] until the last output task completes or the session is
//! aborted. One-shot writes take and drop a token per call.

mod coordinator;
pub mod driver;
pub mod mock;
mod session;

pub use coordinator::{InputKind, InputSpec, TaskCoordinator, AO_SAMPLE_CLOCK, AO_START_TRIGGER};
pub use driver::{DeviceResult, IoDriver, IoTask, SampleClock, TaskKind, TaskSamples, TaskSpec};
pub use mock::{CompletionMode, DriverEvent, FaultScenario, MockIoDriver};
pub use session::{ExclusiveLock, HardwareTask, ScanEvent, ScanSession, ScanState, SessionToken, TaskState};
