//! Signal designers: parameter validation and typed request extraction.

use super::pulse::{synthesize_pulse_cycle, PulseCycleRequest};
use super::raster::{synthesize_raster, AxisRole, AxisSpec, ScanRequest};
use super::{ScanInfo, ScanParameters, WaveformSet};
use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

const RASTER_PARAMETERS: &[&str] = &[
    "target_device",
    "axis_length",
    "axis_step_size",
    "axis_startpos",
    "sequence_time",
    "return_time",
];

const PULSE_PARAMETERS: &[&str] = &["target_device", "ttl_start", "ttl_end", "sequence_time"];

/// Available signal designers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignerKind {
    /// Three-axis stage raster
    RasterScan,
    /// TTL pulse cycle
    PulseCycle,
}

impl DesignerKind {
    /// Every designer kind.
    pub const ALL: [DesignerKind; 2] = [DesignerKind::RasterScan, DesignerKind::PulseCycle];

    /// Display name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RasterScan => "RasterScan",
            Self::PulseCycle => "PulseCycle",
        }
    }

    /// Exact parameter key set this designer accepts.
    pub fn expected_parameters(&self) -> &'static [&'static str] {
        match self {
            Self::RasterScan => RASTER_PARAMETERS,
            Self::PulseCycle => PULSE_PARAMETERS,
        }
    }
}

impl fmt::Display for DesignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DesignerKind {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "rasterscan" | "raster" => Ok(Self::RasterScan),
            "pulsecycle" | "pulse" | "ttlcycle" => Ok(Self::PulseCycle),
            _ => Err(ScanError::Config(format!("Unknown signal designer '{}'", s))),
        }
    }
}

/// Reject `params` unless its keys equal the designer's declared set.
pub fn check_parameters(kind: DesignerKind, params: &ScanParameters) -> Result<()> {
    let expected: BTreeSet<&str> = kind.expected_parameters().iter().copied().collect();
    let supplied: BTreeSet<&str> = params.keys().map(String::as_str).collect();
    if expected == supplied {
        return Ok(());
    }
    Err(ScanError::ParameterMismatch {
        designer: kind.name().to_string(),
        missing: expected.difference(&supplied).map(|k| k.to_string()).collect(),
        extra: supplied.difference(&expected).map(|k| k.to_string()).collect(),
    })
}

fn field<'a>(params: &'a ScanParameters, key: &str) -> Result<&'a Value> {
    params
        .get(key)
        .ok_or_else(|| ScanError::invalid_parameter(key, "missing"))
}

fn number(value: &Value, key: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| ScanError::invalid_parameter(key, format!("expected a number, got {}", value)))
}

fn list<'a>(value: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| ScanError::invalid_parameter(key, format!("expected a list, got {}", value)))
}

fn get_number(params: &ScanParameters, key: &str) -> Result<f64> {
    number(field(params, key)?, key)
}

fn get_numbers(params: &ScanParameters, key: &str) -> Result<Vec<f64>> {
    list(field(params, key)?, key)?
        .iter()
        .map(|v| number(v, key))
        .collect()
}

fn get_nested_numbers(params: &ScanParameters, key: &str) -> Result<Vec<Vec<f64>>> {
    list(field(params, key)?, key)?
        .iter()
        .map(|inner| list(inner, key)?.iter().map(|v| number(v, key)).collect())
        .collect()
}

fn get_strings(params: &ScanParameters, key: &str) -> Result<Vec<String>> {
    list(field(params, key)?, key)?
        .iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                ScanError::invalid_parameter(key, format!("expected a string, got {}", v))
            })
        })
        .collect()
}

/// Start positions are plain numbers or single-element lists.
fn get_start_positions(params: &ScanParameters) -> Result<Vec<f64>> {
    let key = "axis_startpos";
    list(field(params, key)?, key)?
        .iter()
        .map(|v| match v {
            Value::Array(inner) if inner.len() == 1 => number(&inner[0], key),
            Value::Array(inner) => Err(ScanError::invalid_parameter(
                key,
                format!("multi-axis positioners are not supported ({} axes)", inner.len()),
            )),
            other => number(other, key),
        })
        .collect()
}

/// Designer for the three-axis stage raster.
#[derive(Debug, Clone, Default)]
pub struct RasterScanDesigner {
    conversion_factors: BTreeMap<String, f64>,
}

impl RasterScanDesigner {
    /// Create a designer with unit conversion for every target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use per-target conversion factors (physical units per volt).
    pub fn with_conversion_factors(mut self, factors: BTreeMap<String, f64>) -> Self {
        self.conversion_factors = factors;
        self
    }

    /// Validate `params` and extract a typed request.
    pub fn request(&self, params: &ScanParameters, sample_rate: f64) -> Result<ScanRequest> {
        check_parameters(DesignerKind::RasterScan, params)?;

        let targets = get_strings(params, "target_device")?;
        if targets.len() != 3 {
            return Err(ScanError::invalid_parameter(
                "target_device",
                format!("{} requires 3 target axes, got {}", DesignerKind::RasterScan, targets.len()),
            ));
        }
        let lengths = get_numbers(params, "axis_length")?;
        let steps = get_numbers(params, "axis_step_size")?;
        let starts = get_start_positions(params)?;
        for (key, len) in [
            ("axis_length", lengths.len()),
            ("axis_step_size", steps.len()),
            ("axis_startpos", starts.len()),
        ] {
            if len != 3 {
                return Err(ScanError::invalid_parameter(key, format!("expected 3 values, got {}", len)));
            }
        }

        let roles = [AxisRole::Fast, AxisRole::Middle, AxisRole::Slow];
        let axes: [AxisSpec; 3] = std::array::from_fn(|i| AxisSpec {
            target: targets[i].clone(),
            role: roles[i],
            size: lengths[i],
            step_size: steps[i],
            start_position: starts[i],
            conversion_factor: self
                .conversion_factors
                .get(&targets[i])
                .copied()
                .unwrap_or(1.0),
        });

        Ok(ScanRequest {
            axes,
            sequence_time: get_number(params, "sequence_time")?,
            return_time: get_number(params, "return_time")?,
            sample_rate,
        })
    }

    /// Build stage signals and the raster geometry.
    pub fn make_signal(
        &self,
        params: &ScanParameters,
        sample_rate: f64,
    ) -> Result<(WaveformSet, ScanInfo)> {
        synthesize_raster(&self.request(params, sample_rate)?)
    }
}

/// Designer for TTL pulse cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseCycleDesigner;

impl PulseCycleDesigner {
    /// Validate `params` and extract a typed request.
    pub fn request(&self, params: &ScanParameters, sample_rate: f64) -> Result<PulseCycleRequest> {
        check_parameters(DesignerKind::PulseCycle, params)?;
        Ok(PulseCycleRequest {
            targets: get_strings(params, "target_device")?,
            starts: get_nested_numbers(params, "ttl_start")?,
            ends: get_nested_numbers(params, "ttl_end")?,
            sequence_time: get_number(params, "sequence_time")?,
            sample_rate,
        })
    }

    /// Build pulse signals, tiled to `scan` when given.
    pub fn make_signal(
        &self,
        params: &ScanParameters,
        sample_rate: f64,
        scan: Option<&ScanInfo>,
    ) -> Result<WaveformSet> {
        synthesize_pulse_cycle(&self.request(params, sample_rate)?, scan)
    }
}

/// Stage and pulse signals ready for the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// Combined analog and digital sequences
    pub waveforms: WaveformSet,
    /// Raster geometry, absent for a static positioner
    pub scan_info: Option<ScanInfo>,
}

/// Combines the raster and pulse designers into one full scan.
#[derive(Debug, Clone)]
pub struct ScanPlanner {
    sample_rate: f64,
    raster: RasterScanDesigner,
    pulse: PulseCycleDesigner,
}

impl ScanPlanner {
    /// Create a planner for the given output sample rate.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            raster: RasterScanDesigner::new(),
            pulse: PulseCycleDesigner,
        }
    }

    /// Use per-target conversion factors for the stage axes.
    pub fn with_conversion_factors(mut self, factors: BTreeMap<String, f64>) -> Self {
        self.raster = self.raster.with_conversion_factors(factors);
        self
    }

    /// Output sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Pulse cycle alone, one cycle long.
    pub fn pulse_cycle(&self, pulse_params: &ScanParameters) -> Result<WaveformSet> {
        self.pulse.make_signal(pulse_params, self.sample_rate, None)
    }

    /// Build the stage raster and the pulse train that rides on it.
    ///
    /// With `static_positioner` only a single pulse cycle is produced and the
    /// scan parameters are ignored.
    pub fn make_full_scan(
        &self,
        scan_params: &ScanParameters,
        pulse_params: &ScanParameters,
        static_positioner: bool,
    ) -> Result<ScanPlan> {
        if static_positioner {
            debug!("Static positioner, synthesizing pulse cycle only");
            return Ok(ScanPlan {
                waveforms: self.pulse_cycle(pulse_params)?,
                scan_info: None,
            });
        }

        // Check both key sets before any numeric work
        check_parameters(DesignerKind::RasterScan, scan_params)?;
        check_parameters(DesignerKind::PulseCycle, pulse_params)?;

        let (mut waveforms, info) = self.raster.make_signal(scan_params, self.sample_rate)?;
        let pulses = self.pulse.make_signal(pulse_params, self.sample_rate, Some(&info))?;
        waveforms.merge(pulses);
        waveforms.validate_shared_clock()?;

        info!(
            positions = ?info.positions,
            total_samples = info.total_samples,
            analog_targets = waveforms.analog.len(),
            digital_targets = waveforms.digital.len(),
            "Full scan planned"
        );
        Ok(ScanPlan {
            waveforms,
            scan_info: Some(info),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> ScanParameters {
        serde_json::from_value(value).unwrap()
    }

    fn scan_params() -> ScanParameters {
        params(json!({
            "target_device": ["Stage_X", "Stage_Y", "Stage_Z"],
            "axis_length": [5, 5, 5],
            "axis_step_size": [1, 1, 1],
            "axis_startpos": [[0], [0], [0]],
            "sequence_time": 0.005,
            "return_time": 0.001,
        }))
    }

    fn pulse_params() -> ScanParameters {
        params(json!({
            "target_device": ["Laser405", "Laser488"],
            "ttl_start": [[0.0001, 0.004], [0, 0]],
            "ttl_end": [[0.0015, 0.005], [0, 0]],
            "sequence_time": 0.005,
        }))
    }

    #[test]
    fn test_exact_key_set_required() {
        let mut scan = scan_params();
        scan.remove("return_time");
        scan.insert("sample_rate".into(), json!(100000));
        match check_parameters(DesignerKind::RasterScan, &scan) {
            Err(ScanError::ParameterMismatch { designer, missing, extra }) => {
                assert_eq!(designer, "RasterScan");
                assert_eq!(missing, vec!["return_time".to_string()]);
                assert_eq!(extra, vec!["sample_rate".to_string()]);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatch_rejected_before_synthesis() {
        let planner = ScanPlanner::new(100_000.0);
        let mut pulses = pulse_params();
        pulses.remove("ttl_end");
        // Scan parameters are valid; the pulse mismatch still fails first
        let err = planner.make_full_scan(&scan_params(), &pulses, false).unwrap_err();
        assert!(matches!(err, ScanError::ParameterMismatch { .. }));
    }

    #[test]
    fn test_full_scan_shares_length() {
        let planner = ScanPlanner::new(100_000.0);
        let plan = planner.make_full_scan(&scan_params(), &pulse_params(), false).unwrap();
        let info = plan.scan_info.unwrap();
        assert_eq!(info.total_samples, 6 * 6 * 3100);
        assert_eq!(plan.waveforms.validate_shared_clock().unwrap(), Some(info.total_samples));
        assert_eq!(plan.waveforms.digital.len(), 2);
    }

    #[test]
    fn test_static_positioner_skips_raster() {
        let planner = ScanPlanner::new(100_000.0);
        let plan = planner
            .make_full_scan(&ScanParameters::new(), &pulse_params(), true)
            .unwrap();
        assert!(plan.scan_info.is_none());
        assert!(plan.waveforms.analog.is_empty());
        assert_eq!(plan.waveforms.digital["Laser405"].len(), 500);
    }

    #[test]
    fn test_raster_requires_three_targets() {
        let mut scan = scan_params();
        scan.insert("target_device".into(), json!(["Stage_X", "Stage_Y"]));
        let err = RasterScanDesigner::new().request(&scan, 100_000.0).unwrap_err();
        assert!(err.to_string().contains("3 target axes"));
    }

    #[test]
    fn test_multi_axis_start_rejected() {
        let mut scan = scan_params();
        scan.insert("axis_startpos".into(), json!([[0, 1], [0], [0]]));
        assert!(RasterScanDesigner::new().request(&scan, 100_000.0).is_err());
    }

    #[test]
    fn test_conversion_factors_applied() {
        let factors = BTreeMap::from([("Stage_X".to_string(), 2.0)]);
        let designer = RasterScanDesigner::new().with_conversion_factors(factors);
        let request = designer.request(&scan_params(), 100_000.0).unwrap();
        assert_eq!(request.axes[0].conversion_factor, 2.0);
        assert_eq!(request.axes[1].conversion_factor, 1.0);
    }

    #[test]
    fn test_designer_kind_parsing() {
        assert_eq!("raster_scan".parse::<DesignerKind>().unwrap(), DesignerKind::RasterScan);
        assert_eq!("PulseCycle".parse::<DesignerKind>().unwrap(), DesignerKind::PulseCycle);
        assert!("galvo".parse::<DesignerKind>().is_err());
        for kind in DesignerKind::ALL {
            assert!(kind.expected_parameters().contains(&"target_device"));
        }
    }
}
