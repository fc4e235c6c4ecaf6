//! Digital pulse-cycle synthesis.

use super::ramp::{sample_count, tile};
use super::{ScanInfo, WaveformSet};
use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};

/// Pulse windows per target within one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseCycleRequest {
    /// Targets in parameter order
    pub targets: Vec<String>,
    /// Pulse start times in seconds, one list per target
    pub starts: Vec<Vec<f64>>,
    /// Pulse end times in seconds, one list per target
    pub ends: Vec<Vec<f64>>,
    /// Cycle length in seconds
    pub sequence_time: f64,
    /// Output sample rate in Hz
    pub sample_rate: f64,
}

impl PulseCycleRequest {
    /// Check that windows line up with targets and fit the cycle.
    pub fn validate(&self) -> Result<()> {
        if self.starts.len() != self.targets.len() || self.ends.len() != self.targets.len() {
            return Err(ScanError::invalid_parameter(
                "ttl_start",
                format!(
                    "{} targets but {} start lists and {} end lists",
                    self.targets.len(),
                    self.starts.len(),
                    self.ends.len()
                ),
            ));
        }
        for (target, (starts, ends)) in self.targets.iter().zip(self.starts.iter().zip(&self.ends)) {
            if starts.len() != ends.len() {
                return Err(ScanError::invalid_parameter(
                    "ttl_end",
                    format!("'{}' has {} starts and {} ends", target, starts.len(), ends.len()),
                ));
            }
            if let Some((s, e)) = starts.iter().zip(ends).find(|(s, e)| **s < 0.0 || e < s) {
                return Err(ScanError::invalid_parameter(
                    "ttl_start",
                    format!("'{}' has an invalid window [{}, {}]", target, s, e),
                ));
            }
        }
        if !(self.sequence_time > 0.0) || !(self.sample_rate > 0.0) {
            return Err(ScanError::invalid_parameter(
                "sequence_time",
                format!(
                    "sequence_time {} and sample_rate {} must be > 0",
                    self.sequence_time, self.sample_rate
                ),
            ));
        }
        Ok(())
    }
}

/// Build one boolean cycle per target, tiled to a raster when `scan` is given.
///
/// Window `[start, end)` is set high at sample indices
/// `round(start * rate)..round(end * rate)`, clipped to the cycle. With a
/// raster, each line repeats the cycle once per fast-axis position and then
/// stays low for the retrace, so the result is as long as the stage signals.
pub fn synthesize_pulse_cycle(
    request: &PulseCycleRequest,
    scan: Option<&ScanInfo>,
) -> Result<WaveformSet> {
    request.validate()?;
    let rate = request.sample_rate;
    let cycle_samples = sample_count(request.sequence_time, rate, "cycle");

    let mut waveforms = WaveformSet::default();
    for (i, target) in request.targets.iter().enumerate() {
        let mut cycle = vec![false; cycle_samples];
        for (start, end) in request.starts[i].iter().zip(&request.ends[i]) {
            let first = ((start * rate).round() as usize).min(cycle_samples);
            let last = ((end * rate).round() as usize).min(cycle_samples);
            cycle[first..last].iter_mut().for_each(|s| *s = true);
        }

        let signal = match scan {
            Some(info) => {
                let pad = sample_count(info.return_time, rate, "pulse padding");
                let mut line = tile(&cycle, info.positions[0]);
                line.resize(line.len() + pad, false);
                tile(&line, info.line_count())
            }
            None => cycle,
        };
        waveforms.digital.insert(target.clone(), signal);
    }
    Ok(waveforms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::raster::{synthesize_raster, tests::request as raster_request};

    fn request() -> PulseCycleRequest {
        PulseCycleRequest {
            targets: vec!["Laser405".into(), "Laser488".into()],
            starts: vec![vec![0.0001, 0.004], vec![0.0]],
            ends: vec![vec![0.0015, 0.005], vec![0.0]],
            sequence_time: 0.005,
            sample_rate: 100_000.0,
        }
    }

    #[test]
    fn test_single_cycle() {
        let waveforms = synthesize_pulse_cycle(&request(), None).unwrap();
        let l405 = &waveforms.digital["Laser405"];
        assert_eq!(l405.len(), 500);
        assert!(!l405[9]);
        assert!(l405[10]);
        assert!(l405[149]);
        assert!(!l405[150]);
        assert!(l405[400..500].iter().all(|&v| v));
        // Empty window stays low
        assert!(waveforms.digital["Laser488"].iter().all(|&v| !v));
    }

    #[test]
    fn test_tiled_to_raster_length() {
        let (stage, info) = synthesize_raster(&raster_request()).unwrap();
        let pulses = synthesize_pulse_cycle(&request(), Some(&info)).unwrap();
        let l405 = &pulses.digital["Laser405"];
        assert_eq!(l405.len(), stage.analog["Stage_X"].len());
        // Retrace is low
        assert!(l405[info.ramp_samples..info.line_samples].iter().all(|&v| !v));
        // Second line starts with the same cycle
        assert_eq!(&l405[info.line_samples..info.line_samples + 500], &l405[..500]);
    }

    #[test]
    fn test_mismatched_windows() {
        let mut req = request();
        req.ends[0].pop();
        assert!(matches!(
            synthesize_pulse_cycle(&req, None),
            Err(ScanError::InvalidParameter { .. })
        ));
    }
}
