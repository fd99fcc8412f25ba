//! Integration tests for configuration loading
//!
//! - Minimal and full TOML documents
//! - Save/load round trip through a temporary directory
//! - Invalid configuration handling

use driver::DriverConfig;
use std::time::Duration;
use tempfile::tempdir;

const MINIMAL_CONFIG: &str = r#"
[driver]
log_level = "info"

[usb]
filters = ["0x0547:0x1002"]
"#;

const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"
read_timeout_ms = 15
minor_base = 200

[usb]
filters = ["0x0547:0x1002", "0x04b4:*"]
interface = 0
write_timeout_ms = 250
interrupt_poll_ms = 5
"#;

#[test]
fn test_minimal_config_uses_defaults() {
    let config = DriverConfig::parse(MINIMAL_CONFIG).unwrap();

    assert_eq!(config.driver.read_timeout_ms, 20);
    assert_eq!(config.driver.minor_base, 192);
    assert_eq!(config.usb.interface, 0);
    assert_eq!(config.usb.write_timeout(), Duration::from_secs(1));
    assert_eq!(config.usb.interrupt_poll(), Duration::from_millis(10));
}

#[test]
fn test_full_config() {
    let config = DriverConfig::parse(FULL_CONFIG).unwrap();

    assert_eq!(config.driver.log_level, "debug");
    assert_eq!(config.usb.filters.len(), 2);
    assert_eq!(config.usb.write_timeout(), Duration::from_millis(250));

    let options = config.manager_options();
    assert_eq!(options.read_timeout, Duration::from_millis(15));
    assert_eq!(options.minor_base, 200);
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("driver.toml");

    let mut config = DriverConfig::default();
    config.driver.log_level = "trace".to_string();
    config.usb.filters.push("0x04b4:0x8613".to_string());
    config.save(&path).unwrap();
    assert!(path.exists());

    let loaded = DriverConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.driver.log_level, "trace");
    assert_eq!(loaded.usb.filters, config.usb.filters);
    assert_eq!(loaded.driver.minor_base, config.driver.minor_base);
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempdir().unwrap();
    let result = DriverConfig::load(Some(dir.path().join("absent.toml")));
    assert!(result.is_err());
}

#[test]
fn test_invalid_documents_are_rejected() {
    // Missing [usb]
    assert!(DriverConfig::parse("[driver]\nlog_level = \"info\"\n").is_err());

    // Bad filter
    let bad_filter = MINIMAL_CONFIG.replace("0x0547:0x1002", "0547-1002");
    assert!(DriverConfig::parse(&bad_filter).is_err());

    // Bad level
    let bad_level = MINIMAL_CONFIG.replace("\"info\"", "\"loud\"");
    assert!(DriverConfig::parse(&bad_level).is_err());

    // No filters at all
    let no_filters = MINIMAL_CONFIG.replace("[\"0x0547:0x1002\"]", "[]");
    assert!(DriverConfig::parse(&no_filters).is_err());
}

#[test]
fn test_load_reports_invalid_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("driver.toml");
    std::fs::write(&path, "this is not toml [").unwrap();

    let err = DriverConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid config file"));
}
