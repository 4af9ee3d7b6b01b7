use fluidcnc_core::TransportKind;
use fluidcnc_settings::{Config, ConfigError, SettingsError};
use tempfile::tempdir;

#[test]
fn test_toml_save_and_load() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.connection.transport = TransportKind::Serial;
    config.connection.serial_port = "/dev/ttyACM0".to_string();
    config.streaming.rx_buffer_size = 1024;
    config.save_to_file(&path).expect("save");

    let loaded = Config::load_from_file(&path).expect("load");
    assert_eq!(loaded, config);
}

#[test]
fn test_json_save_and_load() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.json");

    let mut config = Config::default();
    config.offline_queue.capacity = 5;
    config.save_to_file(&path).expect("save");

    let loaded = Config::load_from_file(&path).expect("load");
    assert_eq!(loaded.offline_queue.capacity, 5);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[connection]\ntransport = \"simulated\"\n\n[supervisor]\nheartbeat_interval_ms = 500\n",
    )
    .expect("write");

    let loaded = Config::load_from_file(&path).expect("load");
    assert_eq!(loaded.connection.transport, TransportKind::Simulated);
    assert_eq!(loaded.supervisor.heartbeat_interval_ms, 500);
    assert_eq!(loaded.supervisor.heartbeat_timeout_ms, 5000);
    assert_eq!(loaded.streaming.rx_buffer_size, 128);
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[streaming]\nrx_buffer_size = 0\n").expect("write");

    match Config::load_from_file(&path) {
        Err(SettingsError::Config(ConfigError::ValueOutOfRange { key, .. })) => {
            assert_eq!(key, "streaming.rx_buffer_size");
        }
        other => panic!("expected range error, got {:?}", other),
    }
}

#[test]
fn test_unsupported_extension() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.yaml");
    let result = Config::default().save_to_file(&path);
    assert!(matches!(
        result,
        Err(SettingsError::Config(ConfigError::UnsupportedFormat(_)))
    ));
}

#[test]
fn test_load_or_default_without_file() {
    let dir = tempdir().expect("tempdir");
    let config = Config::load_or_default(&dir.path().join("missing.toml")).expect("defaults");
    assert_eq!(config, Config::default());
}
