use std::io::Write;

use serial_test::serial;
use tempfile::tempdir;

use super::settings::Settings;
use super::{load_config, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 4222);
    assert_eq!(settings.publisher.ack_wait_ms, 5_000);
    assert_eq!(settings.publisher.max_pending, 10_000);
    assert_eq!(settings.connection.heartbeat_miss_factor, 3);
    assert_eq!(settings.dispatcher.process_interval_ms, 100);
    assert_eq!(settings.server.url(), "ws://127.0.0.1:4222");
}

#[test]
#[serial]
fn test_load_config_without_sources_uses_defaults() {
    temp_env::with_vars_unset(
        [
            "FLEETLINK_SERVER__PORT",
            "FLEETLINK_CONNECTION__HEARTBEAT_INTERVAL_MS",
        ],
        || {
            let settings = load_config().expect("config should load");
            assert_eq!(settings, Settings::default());
        },
    );
}

#[test]
#[serial]
fn test_env_overrides_partial_values() {
    temp_env::with_vars(
        [
            ("FLEETLINK_SERVER__PORT", Some("9999")),
            ("FLEETLINK_CONNECTION__HEARTBEAT_INTERVAL_MS", Some("250")),
        ],
        || {
            let settings = load_config().expect("config should load");
            assert_eq!(settings.server.port, 9999);
            assert_eq!(settings.server.host, "127.0.0.1");
            assert_eq!(settings.connection.heartbeat_interval_ms, 250);
            assert_eq!(settings.connection.request_timeout_ms, 10_000);
        },
    );
}

#[test]
#[serial]
fn test_file_values_merge_over_defaults() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("fleetlink.toml");
    let mut file = std::fs::File::create(&path).expect("create config");
    writeln!(file, "[publisher]\nmax_pending = 42\n\n[storage]\npath = \"/tmp/x\"").unwrap();

    let settings = load_config_from(path.to_str().unwrap()).expect("config should load");
    assert_eq!(settings.publisher.max_pending, 42);
    assert_eq!(settings.publisher.ack_wait_ms, 5_000);
    assert_eq!(settings.storage.path, "/tmp/x");
}
