//! CLI entry point for scan_daq
//!
//! # Usage
//!
//! Validate a configuration file:
//! ```bash
//! scan_daq check-config config/scan_daq.toml
//! ```
//!
//! Run a scan on the simulated driver while recording the first detector:
//! ```bash
//! scan_daq simulate --config config/scan_daq.toml --frames 50 --output /tmp/scan
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scan_daq::acquisition::DetectorFactories;
use scan_daq::config::AppConfig;
use scan_daq::hardware::{InputKind, InputSpec, MockIoDriver, ScanState};
use scan_daq::recorder::{RecordingManager, RecordingMode, RecordingProgress, RecordingRequest};
use scan_daq::registry::DeviceRegistry;
use scan_daq::waveform::{ScanParameters, ScanPlanner};
use scan_daq::{LiveAcquisitionLoop, TaskCoordinator};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rig used by `simulate` when no configuration is given
const DEMO_CONFIG: &str = include_str!("../config/scan_daq.toml");

/// Time at each fast-axis position in seconds
const SEQUENCE_TIME: f64 = 0.005;

#[derive(Parser)]
#[command(name = "scan_daq")]
#[command(about = "Hardware-synchronized scan-and-acquire engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the TOML configuration
        path: PathBuf,
    },

    /// Run a raster scan against simulated hardware and record frames
    Simulate {
        /// Configuration file (defaults to the bundled demo rig)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Frames to record from the first detector
        #[arg(long, default_value = "20")]
        frames: u64,

        /// Output directory (defaults to `recording.save_dir`)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => check_config(&path),
        Commands::Simulate {
            config,
            frames,
            output,
        } => simulate(config, frames, output).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AppConfig::from_toml_str(DEMO_CONFIG)?,
    };
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    println!("Configuration OK: {}", path.display());
    println!(
        "  device {} @ {} Hz, {} targets, {} detectors",
        config.hardware.device,
        config.hardware.sample_rate,
        config.targets.len(),
        config.detectors.len()
    );
    for (name, target) in &config.targets {
        println!(
            "  {:<12} ao={:?} do={:?} ai={:?} ctr={:?}{}",
            name,
            target.analog_channel,
            target.digital_line,
            target.analog_input,
            target.counter_input,
            if target.for_scanning { " (scan)" } else { "" }
        );
    }
    Ok(())
}

/// Raster over the three scanning axes plus one pulse window per digital target.
fn demo_parameters(registry: &DeviceRegistry) -> (Option<ScanParameters>, ScanParameters) {
    let axes: Vec<&String> = registry
        .all_devices()
        .iter()
        .filter(|(_, info)| info.for_scanning && info.analog_channel.is_some())
        .map(|(name, _)| name)
        .collect();
    let lasers: Vec<&String> = registry
        .all_devices()
        .iter()
        .filter(|(_, info)| info.digital_line.is_some())
        .map(|(name, _)| name)
        .collect();

    // Stagger the pulses so each target fires in its own slice of the cycle
    let slice = SEQUENCE_TIME / lasers.len().max(1) as f64;
    let starts: Vec<Vec<f64>> = (0..lasers.len()).map(|i| vec![i as f64 * slice]).collect();
    let ends: Vec<Vec<f64>> = (0..lasers.len())
        .map(|i| vec![i as f64 * slice + slice * 0.8])
        .collect();
    let pulses = into_parameters(json!({
        "target_device": lasers,
        "ttl_start": starts,
        "ttl_end": ends,
        "sequence_time": SEQUENCE_TIME,
    }));

    let scan = (axes.len() == 3).then(|| {
        into_parameters(json!({
            "target_device": axes,
            "axis_length": [5, 5, 2],
            "axis_step_size": [1, 1, 1],
            "axis_startpos": [[0], [0], [0]],
            "sequence_time": SEQUENCE_TIME,
            "return_time": 0.001,
        }))
    });
    (scan, pulses)
}

fn into_parameters(value: serde_json::Value) -> ScanParameters {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => ScanParameters::new(),
    }
}

async fn simulate(config_path: Option<PathBuf>, frames: u64, output: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    scan_daq::logging::init_from_settings(&config.logging)?;

    let registry = Arc::new(DeviceRegistry::from_config(&config.targets));
    let driver = MockIoDriver::new();
    let coordinator = TaskCoordinator::new(Arc::new(driver.clone()), registry.clone(), config.hardware.clone());

    let detectors = DetectorFactories::with_builtin().build_all(&config.detectors)?;
    let Some(first) = detectors.first().map(|d| d.name().to_string()) else {
        bail!("Configuration lists no detectors");
    };
    let acquisition = Arc::new(LiveAcquisitionLoop::new(detectors, &config.acquisition)?);
    let manager = RecordingManager::new(acquisition.clone());

    let planner = ScanPlanner::new(config.hardware.sample_rate)
        .with_conversion_factors(registry.conversion_factors());
    let (scan_params, pulse_params) = demo_parameters(&registry);
    let plan = match &scan_params {
        Some(scan) => planner.make_full_scan(scan, &pulse_params, false)?,
        None => {
            warn!("Fewer than three scanning axes configured, pulsing only");
            planner.make_full_scan(&ScanParameters::new(), &pulse_params, true)?
        }
    };

    let save_dir = output.unwrap_or_else(|| config.recording.save_dir.clone());
    let mut request = RecordingRequest::new([first.as_str()], save_dir, "simulated_scan", config.recording.format)
        .with_attribute("sample_rate", config.hardware.sample_rate);
    if let Some(info) = &plan.scan_info {
        request = request.with_attribute("scan_info", serde_json::to_value(info)?);
    }

    let mut group = manager
        .start_recording(&request, RecordingMode::FrameCount(frames))
        .await?;
    if let Some(mut progress) = group.recording(&first).and_then(|r| r.progress()) {
        tokio::spawn(async move {
            while let Some(update) = progress.recv().await {
                if let RecordingProgress::Frames { frame_number } = update {
                    if frame_number % 10 == 0 {
                        info!(frame_number, "Recording progress");
                    }
                }
            }
        });
    }

    let Some(session) = coordinator.run_scan(&plan.waveforms).await? else {
        group.stop();
        group.wait().await?;
        bail!("No configured target is bound to the planned signals");
    };

    let sensor = registry
        .all_devices()
        .iter()
        .find(|(_, info)| info.analog_input.is_some())
        .map(|(name, _)| name.clone());
    if let Some(target) = sensor {
        let spec = InputSpec {
            name: "ScanAITask".to_string(),
            target,
            kind: InputKind::Analog { min: -10.0, max: 10.0 },
            samples: session.samples(),
        };
        match coordinator.acquire_synchronized_input(&session, spec).await {
            Ok(()) => {
                let values = coordinator
                    .read_input(&session, "ScanAITask", 16, Some(Duration::from_secs(1)))
                    .await?;
                info!(samples = values.len(), "Synchronized input read");
            }
            Err(e) => warn!(error = %e, "Synchronized input unavailable"),
        }
    }

    let state = session.wait().await;
    let summaries = group.wait().await?;

    println!("Scan session {} finished: {:?}", session.id(), state);
    println!("  {} samples per channel", session.samples());
    for summary in &summaries {
        println!(
            "  recorded {} frames to {} in {:.2?}",
            summary.frames_written,
            summary.path.display(),
            summary.elapsed
        );
    }
    if state != ScanState::Completed {
        bail!("Scan ended in state {:?}", state);
    }
    Ok(())
}
