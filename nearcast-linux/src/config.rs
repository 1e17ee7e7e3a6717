//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nearcast_core::DEFAULT_SERVICE_TAG;
use serde::Deserialize;
use tracing::{debug, warn};

/// Node configuration. File: ~/.config/nearcast/config.toml or /etc/nearcast/config.toml.
/// Env overrides: NEARCAST_NAME, NEARCAST_SERVICE_TAG, NEARCAST_DISCOVERY_PORT,
/// NEARCAST_TRANSPORT_PORT, NEARCAST_INVITE_TIMEOUT_SECS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other peers (default: hostname).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Only peers advertising the same tag are visible.
    #[serde(default = "default_service_tag")]
    pub service_tag: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 45681, 0 = any free port).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    /// A peer is lost after this long without an announcement.
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// Accept inbound sessions only from these display names. Empty = accept everyone.
    #[serde(default)]
    pub allow: Vec<String>,
}

fn default_display_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "nearcast".to_string())
}
fn default_service_tag() -> String {
    DEFAULT_SERVICE_TAG.to_string()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_invite_timeout_secs() -> u64 {
    30
}
fn default_announce_interval_secs() -> u64 {
    2
}
fn default_peer_timeout_secs() -> u64 {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            service_tag: default_service_tag(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            invite_timeout_secs: default_invite_timeout_secs(),
            announce_interval_secs: default_announce_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            allow: Vec::new(),
        }
    }
}

impl Config {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
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

/// Load config: explicit file if given, otherwise the first default path that exists,
/// otherwise defaults; then env vars on top.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/nearcast/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearcast/config.toml"));
    out
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NEARCAST_NAME").filter(|s| !s.is_empty()) {
        c.display_name = s;
    }
    if let Some(s) = var("NEARCAST_SERVICE_TAG").filter(|s| !s.is_empty()) {
        c.service_tag = s;
    }
    parse_env(&var, "NEARCAST_DISCOVERY_PORT", &mut c.discovery_port);
    parse_env(&var, "NEARCAST_TRANSPORT_PORT", &mut c.transport_port);
    parse_env(&var, "NEARCAST_INVITE_TIMEOUT_SECS", &mut c.invite_timeout_secs);
}

fn parse_env<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(s) = var(key) {
        match s.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %s, "ignoring unparsable env override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("display_name = \"Rick-MacBook\"\ntransport_port = 0\n").unwrap();
        assert_eq!(c.display_name, "Rick-MacBook");
        assert_eq!(c.transport_port, 0);
        assert_eq!(c.service_tag, DEFAULT_SERVICE_TAG);
        assert_eq!(c.invite_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("NEARCAST_NAME", "Morty-iPhone"),
            ("NEARCAST_DISCOVERY_PORT", "50000"),
            ("NEARCAST_TRANSPORT_PORT", "not-a-port"),
            ("NEARCAST_INVITE_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.display_name, "Morty-iPhone");
        assert_eq!(c.discovery_port, 50000);
        assert_eq!(c.transport_port, default_transport_port());
        assert_eq!(c.invite_timeout(), Duration::from_secs(5));
    }
}
