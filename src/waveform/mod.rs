//! Waveform synthesis
//!
//! Pure, side-effect-free generation of per-target sample sequences from scan
//! parameters: stage-drive ramps for a three-axis raster and boolean pulse
//! cycles for illumination TTL lines.
//!
//! # Architecture
//!
//! ```text
//! ScanParameters ──► RasterScanDesigner ──► (analog WaveformSet, ScanInfo)
//!                                                      │
//! ScanParameters ──► PulseCycleDesigner ◄──────────────┘
//!                          │
//!                          ▼
//!                 digital WaveformSet ──► ScanPlanner::make_full_scan
//! ```
//!
//! Designers check the caller's parameter keys against their declared set
//! before any numeric work. Non-integer sample counts are rounded up.
//!
//! # Example
//!
//! ```
//! use scan_daq::waveform::{ScanPlanner, ScanParameters};
//! use serde_json::json;
//!
//! # fn main() -> scan_daq::Result<()> {
//! let scan: ScanParameters = serde_json::from_value(json!({
//!     "target_device": ["Stage_X", "Stage_Y", "Stage_Z"],
//!     "axis_length": [5.0, 5.0, 5.0],
//!     "axis_step_size": [1.0, 1.0, 1.0],
//!     "axis_startpos": [0.0, 0.0, 0.0],
//!     "sequence_time": 0.005,
//!     "return_time": 0.001,
//! })).unwrap();
//! let pulses: ScanParameters = serde_json::from_value(json!({
//!     "target_device": ["Laser488"],
//!     "ttl_start": [[0.0001]],
//!     "ttl_end": [[0.0015]],
//!     "sequence_time": 0.005,
//! })).unwrap();
//!
//! let planner = ScanPlanner::new(100_000.0);
//! let plan = planner.make_full_scan(&scan, &pulses, false)?;
//! assert_eq!(plan.waveforms.analog["Stage_X"].len(), plan.waveforms.digital["Laser488"].len());
//! # Ok(())
//! # }
//! ```

mod designer;
mod pulse;
mod ramp;
mod raster;

pub use designer::{
    check_parameters, DesignerKind, PulseCycleDesigner, RasterScanDesigner, ScanPlan, ScanPlanner,
};
pub use pulse::{synthesize_pulse_cycle, PulseCycleRequest};
pub use ramp::{
    axis_positions, compute_ramp, compute_smooth_ramp, sample_count, DEFAULT_CURVE_FRACTION,
};
pub use raster::{synthesize_raster, AxisRole, AxisSpec, ScanRequest};

use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller-supplied designer parameters, keyed by name.
pub type ScanParameters = BTreeMap<String, serde_json::Value>;

/// Sample sequences per logical target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformSet {
    /// Analog sequences (volts)
    pub analog: BTreeMap<String, Vec<f64>>,
    /// Digital sequences
    pub digital: BTreeMap<String, Vec<bool>>,
}

impl WaveformSet {
    /// True when neither analog nor digital sequences are present.
    pub fn is_empty(&self) -> bool {
        self.analog.is_empty() && self.digital.is_empty()
    }

    /// Length shared by every sequence, or `None` for an empty set.
    ///
    /// Fails with [`ScanError::SampleCountMismatch`] when two sequences that
    /// would share one sample clock differ in length.
    pub fn validate_shared_clock(&self) -> Result<Option<usize>> {
        let lengths = self
            .analog
            .iter()
            .map(|(t, s)| (t, s.len()))
            .chain(self.digital.iter().map(|(t, s)| (t, s.len())));

        let mut expected: Option<usize> = None;
        for (target, len) in lengths {
            match expected {
                None => expected = Some(len),
                Some(n) if n != len => {
                    return Err(ScanError::SampleCountMismatch {
                        target: target.clone(),
                        expected: n,
                        found: len,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(expected)
    }

    /// Merge another set into this one; entries of `other` win on conflicts.
    pub fn merge(&mut self, other: WaveformSet) {
        self.analog.extend(other.analog);
        self.digital.extend(other.digital);
    }
}

/// Raster geometry relayed to pulse synthesis and acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Positions per axis, fast axis first
    pub positions: [usize; 3],
    /// Samples spent at each fast-axis position
    pub sequence_samples: usize,
    /// Samples of each retrace
    pub return_samples: usize,
    /// Samples of one fast-axis sweep
    pub ramp_samples: usize,
    /// Sweep plus retrace
    pub line_samples: usize,
    /// Samples of the whole scan
    pub total_samples: usize,
    /// Requested retrace time in seconds
    pub return_time: f64,
}

impl ScanInfo {
    /// Number of fast-axis lines in the scan.
    pub fn line_count(&self) -> usize {
        self.positions[1] * self.positions[2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_clock_validation() {
        let mut set = WaveformSet::default();
        assert_eq!(set.validate_shared_clock().unwrap(), None);

        set.analog.insert("Stage_X".into(), vec![0.0; 10]);
        set.digital.insert("Laser488".into(), vec![false; 10]);
        assert_eq!(set.validate_shared_clock().unwrap(), Some(10));

        set.digital.insert("Laser561".into(), vec![false; 9]);
        match set.validate_shared_clock() {
            Err(ScanError::SampleCountMismatch { target, expected, found }) => {
                assert_eq!(target, "Laser561");
                assert_eq!(expected, 10);
                assert_eq!(found, 9);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }
}
