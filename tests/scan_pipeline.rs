//! End-to-end scan tests: designer parameters through the coordinator to the
//! simulated I/O driver.

use scan_daq::config::AppConfig;
use scan_daq::hardware::{CompletionMode, DriverEvent, MockIoDriver, ScanEvent, ScanState, TaskSamples};
use scan_daq::registry::DeviceRegistry;
use scan_daq::waveform::{ScanParameters, ScanPlanner};
use scan_daq::{ScanError, TaskCoordinator};
use serde_json::json;
use std::sync::Arc;

const RIG: &str = r#"
    [hardware]
    device = "Dev1"
    sample_rate = 100000.0

    [hardware.timer]
    counter = 0
    pulses_per_sample = 4

    [targets.Stage_X]
    analog_channel = 1
    for_scanning = true

    [targets.Stage_Y]
    analog_channel = 0
    for_scanning = true

    [targets.Stage_Z]
    analog_channel = 2
    for_scanning = true

    [targets.Laser405]
    digital_line = 0

    [targets.Laser488]
    digital_line = 1
"#;

fn params(value: serde_json::Value) -> ScanParameters {
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
        "ttl_start": [[0.0001], [0.0025]],
        "ttl_end": [[0.0015], [0.004]],
        "sequence_time": 0.005,
    }))
}

fn rig(mode: CompletionMode) -> (AppConfig, TaskCoordinator, MockIoDriver) {
    let config = AppConfig::from_toml_str(RIG).unwrap();
    config.validate().unwrap();
    let registry = Arc::new(DeviceRegistry::from_config(&config.targets));
    let driver = MockIoDriver::with_mode(mode);
    let coordinator = TaskCoordinator::new(Arc::new(driver.clone()), registry, config.hardware.clone());
    (config, coordinator, driver)
}

#[tokio::test(start_paused = true)]
async fn test_full_scan_runs_to_completion() {
    let (config, coordinator, driver) = rig(CompletionMode::Auto);
    let plan = ScanPlanner::new(config.hardware.sample_rate)
        .make_full_scan(&scan_params(), &pulse_params(), false)
        .unwrap();
    let info = plan.scan_info.unwrap();
    assert_eq!(info.ramp_samples, 3000);
    assert_eq!(info.line_samples, 3100);

    let mut events = coordinator.subscribe();
    let session = coordinator.run_scan(&plan.waveforms).await.unwrap().unwrap();
    assert_eq!(session.samples(), info.total_samples);
    assert_eq!(session.wait().await, ScanState::Completed);

    let mut done = 0;
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ScanEvent::Initiated { samples, .. } => {
                assert_eq!(samples, info.total_samples);
                order.push("initiated");
            }
            ScanEvent::Started { .. } => order.push("started"),
            ScanEvent::Done { .. } => {
                done += 1;
                order.push("done");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(done, 1);
    assert_eq!(order, vec!["initiated", "started", "done"]);
    assert_eq!(coordinator.lock().release_count(), 1);
    assert_eq!(driver.open_task_count(), 0);
    assert!(!coordinator.is_busy());
}

#[tokio::test]
async fn test_timer_starts_first_and_analog_last() {
    let (config, coordinator, driver) = rig(CompletionMode::Manual);
    let plan = ScanPlanner::new(config.hardware.sample_rate)
        .make_full_scan(&scan_params(), &pulse_params(), false)
        .unwrap();
    let session = coordinator.run_scan(&plan.waveforms).await.unwrap().unwrap();

    let events = driver.events();
    let starts: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            DriverEvent::Started { task } => Some(task.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec!["ScanTimerTask", "ScanDOTask", "ScanAOTask"]);

    let ao_channels = events.iter().find_map(|e| match e {
        DriverEvent::Created { task, channels, .. } if task == "ScanAOTask" => Some(channels.clone()),
        _ => None,
    });
    assert_eq!(ao_channels.unwrap(), vec!["Dev1/ao0", "Dev1/ao1", "Dev1/ao2"]);

    match driver.written_samples("ScanDOTask").unwrap() {
        TaskSamples::Digital(lines) => {
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[0].len(), session.samples());
            // Laser405 on line 0 fires early in each position, Laser488 later
            assert!(lines[0][50]);
            assert!(!lines[1][50]);
            assert!(lines[1][300]);
        }
        other => panic!("unexpected samples {:?}", other),
    }

    driver.complete_all();
    assert_eq!(session.wait().await, ScanState::Completed);
}

#[tokio::test]
async fn test_second_scan_is_rejected_while_first_runs() {
    let (config, coordinator, driver) = rig(CompletionMode::Manual);
    let plan = ScanPlanner::new(config.hardware.sample_rate)
        .make_full_scan(&scan_params(), &pulse_params(), false)
        .unwrap();
    let first = coordinator.run_scan(&plan.waveforms).await.unwrap().unwrap();
    let open = driver.open_task_count();

    let err = coordinator.run_scan(&plan.waveforms).await.unwrap_err();
    assert!(matches!(err, ScanError::DeviceBusy));
    assert!(err.is_retryable());
    assert_eq!(driver.open_task_count(), open);
    assert_eq!(first.state(), ScanState::Running);

    driver.complete_all();
    assert_eq!(first.wait().await, ScanState::Completed);
    let second = coordinator.run_scan(&plan.waveforms).await.unwrap().unwrap();
    assert!(second.abort());
    assert_eq!(second.wait().await, ScanState::Aborted);
    assert_eq!(coordinator.lock().release_count(), 2);
}

#[tokio::test]
async fn test_synthesis_error_never_touches_hardware() {
    let (config, coordinator, driver) = rig(CompletionMode::Auto);
    let mut pulses = pulse_params();
    pulses.remove("ttl_end");
    let err = ScanPlanner::new(config.hardware.sample_rate)
        .make_full_scan(&scan_params(), &pulses, false)
        .unwrap_err();
    assert!(matches!(err, ScanError::ParameterMismatch { .. }));
    assert!(driver.events().is_empty());
    assert!(!coordinator.is_busy());
}

#[tokio::test]
async fn test_one_shot_between_scans() {
    let (_config, coordinator, driver) = rig(CompletionMode::Auto);
    coordinator.set_digital_level("Laser488", true).await.unwrap();
    coordinator.set_analog_level("Stage_Z", 1.5, -10.0, 10.0).await.unwrap();
    assert_eq!(coordinator.lock().release_count(), 2);
    assert_eq!(driver.open_task_count(), 0);
    assert!(driver.reserved_channels().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_is_free_once_wait_returns() {
    let (config, coordinator, driver) = rig(CompletionMode::Manual);
    let plan = ScanPlanner::new(config.hardware.sample_rate)
        .make_full_scan(&scan_params(), &pulse_params(), false)
        .unwrap();

    for _ in 0..500 {
        let session = coordinator.run_scan(&plan.waveforms).await.unwrap().unwrap();
        let completer = driver.clone();
        let finisher = tokio::spawn(async move { completer.complete_all() });
        assert_eq!(session.wait().await, ScanState::Completed);
        assert!(!coordinator.is_busy());
        finisher.await.unwrap();
    }
    assert_eq!(coordinator.lock().release_count(), 500);
}
