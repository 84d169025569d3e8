//! Relay config loading and validation.

use relay::config::{ConfigError, load_config_from_path, load_config_from_str};
use std::io::Write;

const MINIMAL: &str = r#"
schema_version = 1

[listen]
bind = "127.0.0.1:7700"
"#;

#[test]
fn minimal_config_applies_defaults() {
    let config = load_config_from_str(MINIMAL).unwrap();
    assert_eq!(config.schema_version, 1);
    assert_eq!(config.listen.bind, "127.0.0.1:7700");
    assert_eq!(config.limits.rate_bytes_per_sec, None);
    assert_eq!(config.limits.compress_min_bytes, 4096);
    assert_eq!(config.limits.max_frame_bytes, 16 * 1024 * 1024);
    assert_eq!(config.timeouts.rpc_secs, 30);
    assert_eq!(config.timeouts.oneway_secs, 30);
    assert_eq!(config.timeouts.heartbeat_secs, 30);
    assert_eq!(config.replay.window_secs, 1800);
    assert_eq!(config.replay.sweep_secs, 300);
}

#[test]
fn idle_cutoff_is_three_heartbeat_intervals() {
    let config = load_config_from_str(MINIMAL).unwrap();
    assert_eq!(config.timeouts.idle(), std::time::Duration::from_secs(90));
}

#[test]
fn full_config_round_trips() {
    let config = load_config_from_str(
        r#"
schema_version = 1

[listen]
bind = "0.0.0.0:9000"

[limits]
rate_bytes_per_sec = 65536
compress_min_bytes = 1024
max_frame_bytes = 1048576

[timeouts]
rpc_secs = 5
oneway_secs = 8
heartbeat_secs = 10

[replay]
window_secs = 60
sweep_secs = 15
"#,
    )
    .unwrap();

    assert_eq!(config.limits.rate_bytes_per_sec, Some(65536));
    assert_eq!(config.limits.compress_min_bytes, 1024);
    assert_eq!(config.timeouts.rpc(), std::time::Duration::from_secs(5));
    assert_eq!(config.timeouts.oneway(), std::time::Duration::from_secs(8));
    assert_eq!(
        config.replay.window(),
        std::time::Duration::from_secs(60)
    );
}

#[test]
fn missing_schema_version_is_reported_by_name() {
    let result = load_config_from_str("[listen]\nbind = \"127.0.0.1:7700\"\n");
    match result {
        Err(ConfigError::Missing(field)) => assert_eq!(field, "schema_version"),
        other => panic!("expected Missing, got {other:?}"),
    }
}

#[test]
fn wrong_schema_version_is_rejected() {
    let result = load_config_from_str("schema_version = 2\n[listen]\nbind = \"x\"\n");
    assert!(matches!(result, Err(ConfigError::Bad(_))));
}

#[test]
fn missing_bind_is_reported_by_name() {
    let result = load_config_from_str("schema_version = 1\n[listen]\n");
    match result {
        Err(ConfigError::Missing(field)) => assert_eq!(field, "listen.bind"),
        other => panic!("expected Missing, got {other:?}"),
    }
}

#[test]
fn zero_rate_limit_is_rejected() {
    let result = load_config_from_str(
        "schema_version = 1\n[listen]\nbind = \"x\"\n[limits]\nrate_bytes_per_sec = 0\n",
    );
    assert!(matches!(result, Err(ConfigError::Bad(_))));
}

#[test]
fn zero_oneway_timeout_is_rejected() {
    let result = load_config_from_str(
        "schema_version = 1\n[listen]\nbind = \"x\"\n[timeouts]\noneway_secs = 0\n",
    );
    assert!(matches!(result, Err(ConfigError::Bad(_))));
}

#[test]
fn malformed_toml_is_rejected() {
    let result = load_config_from_str("schema_version = [not toml");
    assert!(matches!(result, Err(ConfigError::Toml(_))));
}

#[test]
fn loads_from_a_file_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    let config = load_config_from_path(file.path()).unwrap();
    assert_eq!(config.listen.bind, "127.0.0.1:7700");
}

#[test]
fn missing_file_reports_the_path() {
    let result = load_config_from_path(std::path::Path::new("/nonexistent/relay.toml"));
    match result {
        Err(ConfigError::Read { path, .. }) => assert_eq!(path, "/nonexistent/relay.toml"),
        other => panic!("expected Read, got {other:?}"),
    }
}
