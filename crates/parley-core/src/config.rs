//! Configuration resolution for Parley.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`~/.config/parley/settings.json`, or an explicit path)
//! 3. Environment variables
//! 4. CLI arguments (applied by each binary, highest priority)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Parley configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Identity peers address the server itself by.
    pub identity: String,
    pub group_path: PathBuf,
    /// Credential database. `None` resolves to `~/.parley/users.db`.
    pub database_path: Option<PathBuf>,
    pub max_datagram_bytes: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            identity: "root".to_string(),
            group_path: PathBuf::from("data/group.json"),
            database_path: None,
            max_datagram_bytes: 65_507,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Configured database path, falling back to the per-user default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(database_path)
    }
}

/// Client-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// Local bind address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Identity of the server, used as the recipient of control traffic.
    pub server_identity: String,
    pub group_path: PathBuf,
    pub handshake: HandshakeRetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            server_identity: "root".to_string(),
            group_path: PathBuf::from("data/group.json"),
            handshake: HandshakeRetryPolicy::default(),
        }
    }
}

/// Exponential backoff for client handshakes.
///
/// Each attempt waits `delay_for_attempt(n)` for the peer's response before
/// resending the init. After `max_attempts` the handshake is abandoned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandshakeRetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for HandshakeRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 8000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl HandshakeRetryPolicy {
    /// Calculate the wait for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay_ms as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the default settings file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Default settings file location.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("settings.json"))
}

/// Default credential database location.
pub fn database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".parley").join("users.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `PARLEY_*` overrides. Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = var("PARLEY_BIND_ADDR").and_then(|v| v.parse().ok()) {
        config.server.bind_addr = addr;
    }
    if let Some(addr) = var("PARLEY_SERVER_ADDR").and_then(|v| v.parse().ok()) {
        config.client.server_addr = addr;
    }
    if let Some(path) = var("PARLEY_GROUP_PATH") {
        config.server.group_path = PathBuf::from(&path);
        config.client.group_path = PathBuf::from(path);
    }
    if let Some(path) = var("PARLEY_DB_PATH") {
        config.server.database_path = Some(PathBuf::from(path));
    }
    if let Some(level) = var("PARLEY_LOG_LEVEL") {
        config.server.log_level = level;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_matches_protocol_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:9999");
        assert_eq!(config.server.identity, "root");
        assert_eq!(config.server.max_datagram_bytes, 65_507);
        assert_eq!(config.client.bind_addr.port(), 0);
        assert_eq!(config.client.server_addr, config.server.bind_addr);
    }

    #[test]
    fn default_handshake_policy() {
        let policy = HandshakeRetryPolicy::default();
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 8000);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = HandshakeRetryPolicy::default();

        // 1s, 2s, 4s, 8s, 8s (capped)
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn retry_stops_at_max_attempts() {
        let policy = HandshakeRetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"bind_addr": "0.0.0.0:7000"}, "client": {"handshake": {"max_attempts": 2}}}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:7000");
        assert_eq!(config.server.identity, "root");
        assert_eq!(config.client.handshake.max_attempts, 2);
        assert_eq!(config.client.handshake.initial_delay_ms, 1000);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PARLEY_BIND_ADDR", "0.0.0.0:5555"),
            ("PARLEY_SERVER_ADDR", "10.0.0.1:5555"),
            ("PARLEY_GROUP_PATH", "/etc/parley/group.json"),
            ("PARLEY_DB_PATH", "/var/lib/parley/users.db"),
            ("PARLEY_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:5555");
        assert_eq!(config.client.server_addr.to_string(), "10.0.0.1:5555");
        assert_eq!(
            config.client.group_path,
            PathBuf::from("/etc/parley/group.json")
        );
        assert_eq!(config.server.group_path, config.client.group_path);
        assert_eq!(
            config.server.resolved_database_path(),
            Some(PathBuf::from("/var/lib/parley/users.db"))
        );
        assert_eq!(config.server.log_level, "debug");
    }

    #[test]
    fn unparseable_env_address_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| {
            (k == "PARLEY_BIND_ADDR").then(|| "not-an-addr".to_string())
        });
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:9999");
    }
}
