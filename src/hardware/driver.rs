//! I/O driver contract consumed by the coordinator.
//!
//! A driver creates finite, clocked tasks bound to named physical channels.
//! Tasks are shared between the coordinator and their completion monitor, so
//! every method takes `&self` and implementations use interior mutability.

use crate::error::DeviceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result of a driver call.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Channel type and range of a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Analog voltage output
    AnalogOut {
        /// Lower voltage limit
        min: f64,
        /// Upper voltage limit
        max: f64,
    },
    /// Digital line output
    DigitalOut,
    /// Analog voltage input
    AnalogIn {
        /// Lower voltage limit
        min: f64,
        /// Upper voltage limit
        max: f64,
    },
    /// Edge-counting input
    CounterIn,
    /// Pulse-train counter output
    CounterOut {
        /// Pulse frequency in Hz
        frequency_hz: f64,
    },
}

impl TaskKind {
    /// True for tasks that drive outputs.
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Self::AnalogOut { .. } | Self::DigitalOut | Self::CounterOut { .. }
        )
    }
}

/// Sample clock of a finite task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleClock {
    /// Clock terminal (`100kHzTimebase`, `ao/SampleClock`, ...)
    pub source: String,
    /// Sample rate in Hz
    pub rate: f64,
    /// Samples per channel
    pub samples_per_channel: usize,
}

impl SampleClock {
    /// Time the task needs to clock out all samples.
    pub fn duration(&self) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel as f64 / self.rate)
    }
}

/// Everything needed to create one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name, unique per device
    pub name: String,
    /// Channel type
    pub kind: TaskKind,
    /// Physical channel names in sample order
    pub channels: Vec<String>,
    /// Sample clock
    pub clock: SampleClock,
    /// Optional digital start trigger terminal
    pub start_trigger: Option<String>,
}

/// Samples for one write, one inner vector per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskSamples {
    /// Analog channels
    Analog(Vec<Vec<f64>>),
    /// Digital lines
    Digital(Vec<Vec<bool>>),
}

impl TaskSamples {
    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        match self {
            Self::Analog(c) => c.len(),
            Self::Digital(c) => c.len(),
        }
    }

    /// Samples per channel (length of the first channel).
    pub fn samples_per_channel(&self) -> usize {
        match self {
            Self::Analog(c) => c.first().map_or(0, Vec::len),
            Self::Digital(c) => c.first().map_or(0, Vec::len),
        }
    }
}

/// One task created by an [`IoDriver`].
#[async_trait]
pub trait IoTask: Send + Sync {
    /// Task name.
    fn name(&self) -> &str;

    /// Load samples into the task buffer; returns samples written per channel.
    fn write(&self, samples: &TaskSamples, auto_start: bool) -> DeviceResult<usize>;

    /// Start the task.
    fn start(&self) -> DeviceResult<()>;

    /// Wait until the task has clocked out all samples; `None` waits indefinitely.
    async fn wait_until_done(&self, timeout: Option<Duration>) -> DeviceResult<()>;

    /// Read up to `samples` values per channel from an input task.
    async fn read(&self, samples: usize, timeout: Option<Duration>) -> DeviceResult<Vec<f64>>;

    /// Stop the task.
    fn stop(&self) -> DeviceResult<()>;

    /// Release the task and its channels.
    fn close(&self) -> DeviceResult<()>;
}

/// Multi-channel timed I/O device.
pub trait IoDriver: Send + Sync {
    /// Create and configure a task; fails if a channel is already owned.
    fn create_task(&self, spec: TaskSpec) -> DeviceResult<Arc<dyn IoTask>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_duration() {
        let clock = SampleClock {
            source: "100kHzTimebase".into(),
            rate: 100_000.0,
            samples_per_channel: 50_000,
        };
        assert_eq!(clock.duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_sample_shape() {
        let samples = TaskSamples::Digital(vec![vec![true; 100], vec![false; 100]]);
        assert_eq!(samples.channel_count(), 2);
        assert_eq!(samples.samples_per_channel(), 100);
        assert!(TaskKind::DigitalOut.is_output());
        assert!(!TaskKind::CounterIn.is_output());
    }
}
