//! Global subscriber installation. Kept in its own test binary because the
//! subscriber outlives the test that installs it.

use scan_daq::config::LoggingSettings;
use scan_daq::logging::{init, init_from_settings, LoggingConfig, OutputFormat};
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn test_init_is_idempotent() {
    let config = LoggingConfig::new(Level::DEBUG)
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    assert!(init(config.clone()).is_ok());
    assert!(init(config).is_ok());
}

#[test]
#[serial]
fn test_init_from_settings_rejects_bad_level() {
    let settings = LoggingSettings {
        level: "loud".to_string(),
        format: "json".to_string(),
    };
    assert!(init_from_settings(&settings).is_err());

    let settings = LoggingSettings {
        level: "info".to_string(),
        format: "json".to_string(),
    };
    assert!(init_from_settings(&settings).is_ok());
}
