//! Relay configuration.
//!
//! Everything comes from one TOML file (default `/etc/tun-relay/relay.toml`);
//! nothing is read from the environment.  Only `schema_version = 1` and
//! `listen.bind` are required; every other key falls back to a default.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub schema_version: u32,
    pub listen: ListenConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutsConfig,
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Per-connection write budget; None disables rate limiting.
    pub rate_bytes_per_sec: Option<u64>,
    /// Bodies at or above this size are gzip-compressed on the wire.
    pub compress_min_bytes: usize,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct TimeoutsConfig {
    pub rpc_secs: u64,
    pub oneway_secs: u64,
    pub heartbeat_secs: u64,
}

impl TimeoutsConfig {
    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }

    /// Deadline for detached oneway executions.
    pub fn oneway(&self) -> Duration {
        Duration::from_secs(self.oneway_secs)
    }

    /// Idle cutoff: three missed heartbeat intervals.
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs * 3)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub window_secs: u64,
    pub sweep_secs: u64,
}

impl ReplayConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListenConfig>,
    limits: Option<RawLimitsConfig>,
    timeouts: Option<RawTimeoutsConfig>,
    replay: Option<RawReplayConfig>,
}

#[derive(Debug, Deserialize)]
struct RawListenConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLimitsConfig {
    rate_bytes_per_sec: Option<u64>,
    compress_min_bytes: Option<usize>,
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawTimeoutsConfig {
    rpc_secs: Option<u64>,
    oneway_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawReplayConfig {
    window_secs: Option<u64>,
    sweep_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&toml_str)
}

/// Load relay config from the default path `/etc/tun-relay/relay.toml`.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/tun-relay/relay.toml"))
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str)?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Missing("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::Bad(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    // Validate listen
    let raw_listen = raw
        .listen
        .ok_or_else(|| ConfigError::Missing("listen".to_owned()))?;
    let bind = raw_listen
        .bind
        .ok_or_else(|| ConfigError::Missing("listen.bind".to_owned()))?;

    // Limits defaults
    let limits = match raw.limits {
        Some(l) => LimitsConfig {
            rate_bytes_per_sec: l.rate_bytes_per_sec,
            compress_min_bytes: l.compress_min_bytes.unwrap_or(4096),
            max_frame_bytes: l.max_frame_bytes.unwrap_or(16 * 1024 * 1024),
        },
        None => LimitsConfig {
            rate_bytes_per_sec: None,
            compress_min_bytes: 4096,
            max_frame_bytes: 16 * 1024 * 1024,
        },
    };
    if limits.rate_bytes_per_sec == Some(0) {
        return Err(ConfigError::Bad(
            "limits.rate_bytes_per_sec must be positive when set".to_owned(),
        ));
    }

    // Timeout defaults
    let timeouts = match raw.timeouts {
        Some(t) => TimeoutsConfig {
            rpc_secs: t.rpc_secs.unwrap_or(30),
            oneway_secs: t.oneway_secs.unwrap_or(30),
            heartbeat_secs: t.heartbeat_secs.unwrap_or(30),
        },
        None => TimeoutsConfig {
            rpc_secs: 30,
            oneway_secs: 30,
            heartbeat_secs: 30,
        },
    };
    if timeouts.rpc_secs == 0 || timeouts.oneway_secs == 0 || timeouts.heartbeat_secs == 0 {
        return Err(ConfigError::Bad("timeouts must be positive".to_owned()));
    }

    // Replay defaults
    let replay = match raw.replay {
        Some(r) => ReplayConfig {
            window_secs: r.window_secs.unwrap_or(1800),
            sweep_secs: r.sweep_secs.unwrap_or(300),
        },
        None => ReplayConfig {
            window_secs: 1800,
            sweep_secs: 300,
        },
    };

    Ok(RelayConfig {
        schema_version,
        listen: ListenConfig { bind },
        limits,
        timeouts,
        replay,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("config is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config lacks required field {0}")]
    Missing(String),
    #[error("bad config value: {0}")]
    Bad(String),
}
