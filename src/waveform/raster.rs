//! Three-axis raster synthesis.

use super::ramp::{
    axis_positions, compute_ramp, compute_smooth_ramp, sample_count, tile, DEFAULT_CURVE_FRACTION,
};
use super::{ScanInfo, WaveformSet};
use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::iter;
use tracing::debug;

/// Nesting level of a scan axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisRole {
    /// Innermost axis, swept continuously within a line
    Fast,
    /// Stepped once per line
    Middle,
    /// Stepped once per full middle-axis sweep
    Slow,
}

/// One scanned axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Logical target driving this axis
    pub target: String,
    /// Nesting level
    pub role: AxisRole,
    /// Travel in physical units
    pub size: f64,
    /// Step between positions in physical units
    pub step_size: f64,
    /// First position in physical units
    pub start_position: f64,
    /// Physical units per volt
    pub conversion_factor: f64,
}

impl AxisSpec {
    /// Number of positions visited along this axis.
    pub fn positions(&self) -> usize {
        axis_positions(self.size, self.step_size)
    }

    fn start_volts(&self) -> f64 {
        self.start_position / self.conversion_factor
    }

    fn end_volts(&self) -> f64 {
        (self.start_position + self.size) / self.conversion_factor
    }
}

/// Validated raster request: fast, middle and slow axis in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Axes ordered fast, middle, slow
    pub axes: [AxisSpec; 3],
    /// Dwell per fast-axis position in seconds
    pub sequence_time: f64,
    /// Retrace time in seconds
    pub return_time: f64,
    /// Output sample rate in Hz
    pub sample_rate: f64,
}

impl ScanRequest {
    /// Check value ranges; key sets are checked earlier by the designer.
    pub fn validate(&self) -> Result<()> {
        let roles = [AxisRole::Fast, AxisRole::Middle, AxisRole::Slow];
        for (axis, role) in self.axes.iter().zip(roles) {
            if axis.role != role {
                return Err(ScanError::invalid_parameter(
                    "target_device",
                    format!("axis '{}' is {:?}, expected {:?}", axis.target, axis.role, role),
                ));
            }
            if !(axis.step_size > 0.0) {
                return Err(ScanError::invalid_parameter(
                    "axis_step_size",
                    format!("step for '{}' must be > 0, got {}", axis.target, axis.step_size),
                ));
            }
            if !(axis.size >= 0.0) {
                return Err(ScanError::invalid_parameter(
                    "axis_length",
                    format!("length for '{}' must be >= 0, got {}", axis.target, axis.size),
                ));
            }
            if axis.conversion_factor == 0.0 || !axis.conversion_factor.is_finite() {
                return Err(ScanError::invalid_parameter(
                    "conversion_factor",
                    format!("'{}' has conversion factor {}", axis.target, axis.conversion_factor),
                ));
            }
        }
        if !(self.sequence_time > 0.0) {
            return Err(ScanError::invalid_parameter(
                "sequence_time",
                format!("must be > 0, got {}", self.sequence_time),
            ));
        }
        if !(self.return_time >= 0.0) {
            return Err(ScanError::invalid_parameter(
                "return_time",
                format!("must be >= 0, got {}", self.return_time),
            ));
        }
        if !(self.sample_rate > 0.0) {
            return Err(ScanError::invalid_parameter(
                "sample_rate",
                format!("must be > 0, got {}", self.sample_rate),
            ));
        }
        Ok(())
    }
}

/// Build the stage-drive signals of a three-axis raster.
///
/// Each fast-axis line is a linear sweep followed by a smooth retrace; the
/// middle axis steps once per line and the slow axis once per middle sweep.
/// The last position of the middle and slow axes returns to the axis start.
pub fn synthesize_raster(request: &ScanRequest) -> Result<(WaveformSet, ScanInfo)> {
    request.validate()?;
    let [fast, middle, slow] = &request.axes;

    let sequence_samples = sample_count(request.sequence_time, request.sample_rate, "sequence");
    let return_samples = sample_count(request.return_time, request.sample_rate, "return");

    let positions = [fast.positions(), middle.positions(), slow.positions()];
    let ramp_samples = positions[0] * sequence_samples;
    let line_samples = ramp_samples + return_samples;
    let column_samples = positions[1] * line_samples;

    // Fast axis: sweep then retrace, once per line
    let mut line = compute_ramp(fast.start_volts(), fast.end_volts(), ramp_samples);
    line.extend(compute_smooth_ramp(
        fast.end_volts(),
        fast.start_volts(),
        return_samples,
        DEFAULT_CURVE_FRACTION,
    ));
    let fast_signal = tile(&line, positions[1] * positions[2]);

    // Middle axis: hold during the sweep, move during the retrace
    let column_values = compute_ramp(middle.start_volts(), middle.end_volts(), positions[1]);
    let mut column = Vec::with_capacity(column_samples);
    for (index, &value) in column_values.iter().enumerate() {
        let next = next_or_first(&column_values, index);
        column.extend(iter::repeat(value).take(ramp_samples));
        column.extend(compute_smooth_ramp(value, next, return_samples, DEFAULT_CURVE_FRACTION));
    }
    let middle_signal = tile(&column, positions[2]);

    // Slow axis: hold for a whole column, move during its last retrace
    let slice_values = compute_ramp(slow.start_volts(), slow.end_volts(), positions[2]);
    let mut slow_signal = Vec::with_capacity(positions[2] * column_samples);
    for (index, &value) in slice_values.iter().enumerate() {
        let next = next_or_first(&slice_values, index);
        slow_signal.extend(iter::repeat(value).take(column_samples - return_samples));
        slow_signal.extend(compute_smooth_ramp(value, next, return_samples, DEFAULT_CURVE_FRACTION));
    }

    let info = ScanInfo {
        positions,
        sequence_samples,
        return_samples,
        ramp_samples,
        line_samples,
        total_samples: fast_signal.len(),
        return_time: request.return_time,
    };
    debug!(
        positions = ?info.positions,
        ramp_samples,
        line_samples,
        total_samples = info.total_samples,
        "Synthesized raster"
    );

    let mut waveforms = WaveformSet::default();
    waveforms.analog.insert(fast.target.clone(), fast_signal);
    waveforms.analog.insert(middle.target.clone(), middle_signal);
    waveforms.analog.insert(slow.target.clone(), slow_signal);
    Ok((waveforms, info))
}

/// Value at `index + 1`, or the first value once the last index is reached.
fn next_or_first(values: &[f64], index: usize) -> f64 {
    values
        .get(index + 1)
        .or_else(|| values.first())
        .copied()
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn axis(target: &str, role: AxisRole) -> AxisSpec {
        AxisSpec {
            target: target.to_string(),
            role,
            size: 5.0,
            step_size: 1.0,
            start_position: 0.0,
            conversion_factor: 1.0,
        }
    }

    pub(crate) fn request() -> ScanRequest {
        ScanRequest {
            axes: [
                axis("Stage_X", AxisRole::Fast),
                axis("Stage_Y", AxisRole::Middle),
                axis("Stage_Z", AxisRole::Slow),
            ],
            sequence_time: 0.005,
            return_time: 0.001,
            sample_rate: 100_000.0,
        }
    }

    #[test]
    fn test_sample_counts() {
        let (waveforms, info) = synthesize_raster(&request()).unwrap();
        assert_eq!(info.positions, [6, 6, 6]);
        assert_eq!(info.sequence_samples, 500);
        assert_eq!(info.return_samples, 100);
        assert_eq!(info.ramp_samples, 3000);
        assert_eq!(info.line_samples, 3100);

        let expected = 6 * 6 * 3100;
        for target in ["Stage_X", "Stage_Y", "Stage_Z"] {
            assert_eq!(waveforms.analog[target].len(), expected, "{}", target);
        }
        assert_eq!(waveforms.validate_shared_clock().unwrap(), Some(expected));
    }

    #[test]
    fn test_idempotent() {
        let first = synthesize_raster(&request()).unwrap();
        let second = synthesize_raster(&request()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fast_line_shape() {
        let (waveforms, info) = synthesize_raster(&request()).unwrap();
        let fast = &waveforms.analog["Stage_X"];
        assert_eq!(fast[0], 0.0);
        assert_eq!(fast[info.ramp_samples - 1], 5.0);
        // Retrace lands back at the start and the next line begins there
        assert_eq!(fast[info.line_samples - 1], 0.0);
        assert_eq!(fast[info.line_samples], 0.0);
    }

    #[test]
    fn test_middle_axis_steps_and_wraps() {
        let (waveforms, info) = synthesize_raster(&request()).unwrap();
        let middle = &waveforms.analog["Stage_Y"];
        assert!(middle[..info.ramp_samples].iter().all(|&v| v == 0.0));
        assert_eq!(middle[info.line_samples], 1.0);
        // Last line returns to the first position
        let last_line = 5 * info.line_samples;
        assert_eq!(middle[last_line], 5.0);
        assert_eq!(middle[last_line + info.line_samples - 1], 0.0);
    }

    #[test]
    fn test_slow_axis_holds_per_column() {
        let (waveforms, info) = synthesize_raster(&request()).unwrap();
        let slow = &waveforms.analog["Stage_Z"];
        let column = 6 * info.line_samples;
        assert!(slow[..column - info.return_samples].iter().all(|&v| v == 0.0));
        assert_eq!(slow[column], 1.0);
        assert_eq!(*slow.last().unwrap(), 0.0);
    }

    #[test]
    fn test_conversion_factor_scales_volts() {
        let mut req = request();
        req.axes[0].conversion_factor = 2.0;
        let (waveforms, info) = synthesize_raster(&req).unwrap();
        assert_eq!(waveforms.analog["Stage_X"][info.ramp_samples - 1], 2.5);
    }

    #[test]
    fn test_rejects_zero_step() {
        let mut req = request();
        req.axes[1].step_size = 0.0;
        assert!(matches!(
            synthesize_raster(&req),
            Err(ScanError::InvalidParameter { .. })
        ));
    }
}
