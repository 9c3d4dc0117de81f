//! Integration tests for subscriber initialisation (process-global state).

use cnc_pipeline::config::PipelineConfig;
use cnc_pipeline::logging::{self, LogSettings, OutputFormat};
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn test_init_twice_is_tolerated() {
    let settings = LogSettings::at_level(Level::DEBUG).with_format(OutputFormat::Compact);
    assert!(logging::init(settings.clone()).is_ok());
    assert!(logging::init(settings).is_ok());
    tracing::info!(machine_id = 7, "subscriber installed");
}

#[test]
#[serial]
fn test_init_from_configuration() {
    let mut config = PipelineConfig::default();
    config.application.log_format = "json".to_string();
    assert!(logging::init_from_config(&config).is_ok());

    config.application.log_level = "loud".to_string();
    assert!(logging::init_from_config(&config).is_err());
}
