//! Integration tests for configuration files
//!
//! - Full and partial TOML files
//! - Save/load through the filesystem
//! - Invalid values rejected by validation

use common::{Error, TransportConfig, load_config};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"

[usb]
timeout_ms = 5000
cancel_timeout_ms = 250
interface = 1

[hid]
read_timeout_ms = 1500
out_endpoint = 0x02
report_size = 1025
pad_reports = false

[bulk]
max_transfer_size = 65536
send_zero_packet = true
timeout_ms = 3000

[pipeline]
request_size = 8192
request_count = 8

[dispatcher]
poll_interval_ms = 50
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("transport.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);
    let config = TransportConfig::load(Some(path)).unwrap();

    assert_eq!(config.general.log_level, "debug");
    assert_eq!(config.usb.timeout(), Duration::from_millis(5000));
    assert_eq!(config.usb.cancel_timeout(), Duration::from_millis(250));
    assert_eq!(config.usb.interface, 1);
    assert_eq!(config.hid.read_timeout(), Duration::from_millis(1500));
    assert_eq!(config.hid.out_endpoint, Some(0x02));
    assert_eq!(config.hid.report_size, Some(1025));
    assert!(!config.hid.pad_reports);
    assert_eq!(config.bulk.max_transfer_size, 65536);
    assert!(config.bulk.send_zero_packet);
    assert_eq!(config.bulk.timeout(), Duration::from_millis(3000));
    assert_eq!(config.pipeline.request_size, 8192);
    assert_eq!(config.pipeline.request_count, 8);
    assert_eq!(config.dispatcher.poll_interval(), Duration::from_millis(50));
}

#[test]
fn test_partial_config_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[bulk]\nsend_zero_packet = true\n");
    let config = TransportConfig::load(Some(path)).unwrap();

    assert!(config.bulk.send_zero_packet);
    assert_eq!(config.bulk.max_transfer_size, 0x10_0000);
    assert_eq!(config.usb.timeout_ms, 2000);
    assert_eq!(config.hid.out_endpoint, None);
    assert_eq!(config.pipeline.request_count, 4);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("transport.toml");

    let mut config = TransportConfig::default();
    config.hid.report_size = Some(512);
    config.bulk.send_zero_packet = true;
    config.save(&path).unwrap();

    let loaded = TransportConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.hid.report_size, Some(512));
    assert!(loaded.bulk.send_zero_packet);
}

#[test]
fn test_load_config_by_str() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);
    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.bulk.max_transfer_size, 65536);
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        "[general]\nlog_level = \"loud\"\n",
        "[bulk]\nmax_transfer_size = 0\n",
        "[hid]\nreport_size = 0\n",
        "[hid]\nout_endpoint = 0x81\n",
        "[pipeline]\nrequest_count = 0\n",
        "[dispatcher]\npoll_interval_ms = 0\n",
    ];
    for content in cases {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, content);
        assert!(
            matches!(TransportConfig::load(Some(path)), Err(Error::Config(_))),
            "accepted: {}",
            content
        );
    }
}

#[test]
fn test_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[usb\ntimeout_ms = 1");
    assert!(matches!(
        TransportConfig::load(Some(path)),
        Err(Error::Parse(_))
    ));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        TransportConfig::load(Some(missing.clone())),
        Err(Error::Io(_))
    ));
    let config = TransportConfig::load_or_default(Some(missing));
    assert_eq!(config.usb.timeout_ms, 2000);
}
