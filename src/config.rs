//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SCAN_DAQ_`, nested with `__`
//!    (e.g. `SCAN_DAQ_HARDWARE__SAMPLE_RATE=50000`)
//!
//! # Example
//! ```no_run
//! use scan_daq::config::AppConfig;
//!
//! # fn main() -> scan_daq::Result<()> {
//! let config = AppConfig::load_from("config/scan_daq.toml")?;
//! config.validate()?;
//! println!("Scan clock: {}", config.hardware.scan_clock);
//! # Ok(())
//! # }
//! ```

use crate::acquisition::DetectorKind;
use crate::error::{Result, ScanError};
use crate::recorder::SaveFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Timed I/O device settings
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Live acquisition settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Recording defaults
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Logical targets keyed by name
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    /// Attached detectors
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Timed I/O device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Device name used to build physical channel names (e.g. `Dev1/ao0`)
    #[serde(default = "default_device")]
    pub device: String,
    /// Clock terminal for scan output tasks
    #[serde(default = "default_scan_clock")]
    pub scan_clock: String,
    /// Scan sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Lower voltage limit of scan analog outputs
    #[serde(default = "default_scan_min_voltage")]
    pub scan_min_voltage: f64,
    /// Upper voltage limit of scan analog outputs
    #[serde(default = "default_scan_max_voltage")]
    pub scan_max_voltage: f64,
    /// Sample rate of one-shot level writes in Hz
    #[serde(default = "default_sample_rate")]
    pub one_shot_rate: f64,
    /// Trigger input tasks on the analog start trigger
    #[serde(default)]
    pub use_start_trigger: bool,
    /// Optional counter-output timer that runs alongside a scan
    #[serde(default)]
    pub timer: Option<TimerConfig>,
}

/// Counter-output timer armed with each scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Counter index (`ctr<n>`)
    pub counter: u32,
    /// Pulse frequency in Hz
    #[serde(default = "default_timer_frequency")]
    pub frequency_hz: f64,
    /// Timer pulses per scan sample
    #[serde(default = "default_timer_oversampling")]
    pub pulses_per_sample: usize,
}

/// Live acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Poll period of the live loop in milliseconds
    #[serde(default = "default_update_period_ms")]
    pub update_period_ms: u64,
    /// Capacity (in batches) of recorder transfer queues
    #[serde(default = "default_transfer_queue_capacity")]
    pub transfer_queue_capacity: usize,
}

/// Recording defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory new recordings are written to
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Dataset container format
    #[serde(default)]
    pub format: SaveFormat,
}

/// Physical resources bound to one logical target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Analog output channel (`ao<n>`)
    #[serde(default)]
    pub analog_channel: Option<u32>,
    /// Digital output line (`port0/line<n>`)
    #[serde(default)]
    pub digital_line: Option<u32>,
    /// Analog input channel (`ai<n>`)
    #[serde(default)]
    pub analog_input: Option<u32>,
    /// Counter input (`ctr<n>`)
    #[serde(default)]
    pub counter_input: Option<u32>,
    /// Physical units per volt for scanning positioners
    #[serde(default = "default_conversion_factor")]
    pub conversion_factor: f64,
    /// Positioner takes part in raster scans
    #[serde(default)]
    pub for_scanning: bool,
}

/// One attached detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Unique detector name
    pub name: String,
    /// Driver kind
    #[serde(default)]
    pub kind: DetectorKind,
    /// Detector takes part in acquisition polling
    #[serde(default = "default_true")]
    pub for_acquisition: bool,
    /// Frame width in pixels
    #[serde(default = "default_frame_edge")]
    pub width: u32,
    /// Frame height in pixels
    #[serde(default = "default_frame_edge")]
    pub height: u32,
    /// Physical pixel size in micrometres
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f64,
    /// Frame period of the simulated sensor in milliseconds
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_device() -> String {
    "Dev1".to_string()
}

fn default_scan_clock() -> String {
    "100kHzTimebase".to_string()
}

fn default_sample_rate() -> f64 {
    100_000.0
}

fn default_scan_min_voltage() -> f64 {
    -10.0
}

fn default_scan_max_voltage() -> f64 {
    10.0
}

fn default_timer_frequency() -> f64 {
    1_000_000.0
}

fn default_timer_oversampling() -> usize {
    10
}

fn default_update_period_ms() -> u64 {
    100
}

fn default_transfer_queue_capacity() -> usize {
    32
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_conversion_factor() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_frame_edge() -> u32 {
    64
}

fn default_pixel_size() -> f64 {
    1.0
}

fn default_frame_interval_ms() -> u64 {
    33
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            scan_clock: default_scan_clock(),
            sample_rate: default_sample_rate(),
            scan_min_voltage: default_scan_min_voltage(),
            scan_max_voltage: default_scan_max_voltage(),
            one_shot_rate: default_sample_rate(),
            use_start_trigger: false,
            timer: None,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            update_period_ms: default_update_period_ms(),
            transfer_queue_capacity: default_transfer_queue_capacity(),
        }
    }
}

impl AcquisitionConfig {
    /// Poll period as a [`Duration`].
    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            format: SaveFormat::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            analog_channel: None,
            digital_line: None,
            analog_input: None,
            counter_input: None,
            conversion_factor: default_conversion_factor(),
            for_scanning: false,
        }
    }
}

impl DetectorConfig {
    /// Mock detector configuration with default geometry.
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DetectorKind::Mock,
            for_acquisition: true,
            width: default_frame_edge(),
            height: default_frame_edge(),
            pixel_size_um: default_pixel_size(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and `SCAN_DAQ_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load configuration from an in-memory TOML document and the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config = figment
            .merge(Env::prefixed("SCAN_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ScanError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ScanError::Config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        let hw = &self.hardware;
        if hw.sample_rate <= 0.0 || hw.one_shot_rate <= 0.0 {
            return Err(ScanError::Config(format!(
                "Sample rates must be positive (scan {}, one-shot {})",
                hw.sample_rate, hw.one_shot_rate
            )));
        }
        if hw.scan_min_voltage >= hw.scan_max_voltage {
            return Err(ScanError::Config(format!(
                "Scan voltage range [{}, {}] is empty",
                hw.scan_min_voltage, hw.scan_max_voltage
            )));
        }
        if let Some(timer) = &hw.timer {
            if timer.frequency_hz <= 0.0 || timer.pulses_per_sample == 0 {
                return Err(ScanError::Config(
                    "Timer frequency and pulses_per_sample must be positive".to_string(),
                ));
            }
        }

        if self.acquisition.update_period_ms == 0 {
            return Err(ScanError::Config("update_period_ms must be > 0".to_string()));
        }
        if self.acquisition.transfer_queue_capacity == 0 {
            return Err(ScanError::Config(
                "transfer_queue_capacity must be > 0".to_string(),
            ));
        }

        // Physical indices must be unique per resource kind
        let kinds: [(&str, fn(&TargetConfig) -> Option<u32>); 4] = [
            ("analog_channel", |t| t.analog_channel),
            ("digital_line", |t| t.digital_line),
            ("analog_input", |t| t.analog_input),
            ("counter_input", |t| t.counter_input),
        ];
        for (label, get) in kinds {
            let mut seen = HashSet::new();
            for (name, target) in &self.targets {
                if let Some(index) = get(target) {
                    if !seen.insert(index) {
                        return Err(ScanError::Config(format!(
                            "Duplicate {} {} (target '{}')",
                            label, index, name
                        )));
                    }
                }
            }
        }
        for (name, target) in &self.targets {
            if target.conversion_factor == 0.0 {
                return Err(ScanError::Config(format!(
                    "Target '{}' has a zero conversion_factor",
                    name
                )));
            }
        }

        let mut names = HashSet::new();
        for detector in &self.detectors {
            if !names.insert(&detector.name) {
                return Err(ScanError::Config(format!(
                    "Duplicate detector name: {}",
                    detector.name
                )));
            }
            if detector.width == 0 || detector.height == 0 {
                return Err(ScanError::Config(format!(
                    "Detector '{}' has an empty frame shape",
                    detector.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
        [logging]
        level = "debug"

        [hardware]
        device = "Dev2"
        sample_rate = 50000.0

        [hardware.timer]
        counter = 1

        [targets.Stage_X]
        analog_channel = 0
        for_scanning = true

        [targets.Laser488]
        digital_line = 3

        [[detectors]]
        name = "Camera"
        width = 128
        height = 96
    "#;

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.hardware.device, "Dev2");
        assert_eq!(config.hardware.scan_clock, "100kHzTimebase");
        assert_eq!(config.hardware.sample_rate, 50000.0);
        let timer = config.hardware.timer.as_ref().unwrap();
        assert_eq!(timer.frequency_hz, 1_000_000.0);
        assert_eq!(timer.pulses_per_sample, 10);
        assert_eq!(config.targets["Stage_X"].analog_channel, Some(0));
        assert_eq!(config.targets["Stage_X"].conversion_factor, 1.0);
        assert_eq!(config.detectors[0].width, 128);
        assert!(config.detectors[0].for_acquisition);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SCAN_DAQ_ACQUISITION__UPDATE_PERIOD_MS", "40");
        let config = AppConfig::from_toml_str(SAMPLE);
        std::env::remove_var("SCAN_DAQ_ACQUISITION__UPDATE_PERIOD_MS");

        let config = config.unwrap();
        assert_eq!(config.acquisition.update_period(), Duration::from_millis(40));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_voltage_range() {
        let mut config = AppConfig::default();
        config.hardware.scan_min_voltage = 5.0;
        config.hardware.scan_max_voltage = -5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_channel() {
        let mut config = AppConfig::default();
        for name in ["Stage_X", "Stage_Y"] {
            config.targets.insert(
                name.to_string(),
                TargetConfig {
                    analog_channel: Some(1),
                    ..Default::default()
                },
            );
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("analog_channel"));
    }

    #[test]
    fn test_duplicate_detector_names() {
        let mut config = AppConfig::default();
        config.detectors.push(DetectorConfig::mock("Camera"));
        config.detectors.push(DetectorConfig::mock("Camera"));
        assert!(config.validate().is_err());
    }
}
