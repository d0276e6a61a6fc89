//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Peer configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_NAME, NEARBY_SERVICE, NEARBY_DISCOVERY_PORT,
/// NEARBY_TRANSPORT_PORT, NEARBY_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other peers (default $HOSTNAME, else "nearby").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Service type to advertise and browse for (default "nearby-chat").
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Discovery UDP multicast port (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP listen port (default 45691; 0 picks a free port).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,
    /// Silence after which a link is closed and a discovered peer may be redialed.
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
    /// Per-link queue depth for best-effort sends; further sends are dropped.
    #[serde(default = "default_best_effort_queue")]
    pub best_effort_queue: usize,
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "nearby".to_string())
}
fn default_service_type() -> String {
    "nearby-chat".to_string()
}
fn default_discovery_port() -> u16 {
    45690
}
fn default_transport_port() -> u16 {
    45691
}
fn default_beacon_interval_secs() -> u64 {
    2
}
fn default_peer_timeout_secs() -> u64 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    3
}
fn default_max_payload_len() -> usize {
    nearby_core::transport::DEFAULT_MAX_PAYLOAD_LEN
}
fn default_best_effort_queue() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            service_type: default_service_type(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            beacon_interval_secs: default_beacon_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_payload_len: default_max_payload_len(),
            best_effort_queue: default_best_effort_queue(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Parse a config file body; missing fields take their defaults.
pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Apply NEARBY_* overrides. Unparseable port values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NEARBY_NAME") {
        c.display_name = s;
    }
    if let Some(s) = var("NEARBY_SERVICE") {
        c.service_type = s;
    }
    if let Some(p) = var("NEARBY_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("NEARBY_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(s) = var("NEARBY_LOG") {
        c.log_level = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

/// First existing config file wins; a file that exists but does not parse is an error.
fn load_file() -> Result<Option<Config>, ConfigError> {
    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    parse(&s)
        .map(Some)
        .map_err(|source| ConfigError::Parse { path, source })
}
