//! Configuration handling for the bridge service.
//!
//! Settings come from the `services.bridge` section of the shared config
//! file, then from `BRIDGE_*` environment variables, then from the command
//! line.

use anyhow::Result;
use bridge_proxy::ConnectOptions;
use bridge_session::{PipeAddress, SessionConfig};
use bridge_wire::{DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Bridge service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Machine hosting the pipe, `.` for the local machine
    pub pipe_server: String,
    /// Pipe name
    pub pipe_name: String,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Delay between reconnect attempts; zero disables reconnection
    pub reconnect_period: Duration,
    /// Interval between server heartbeats
    pub heartbeat_interval: Duration,
    /// Interval between client echo requests
    pub echo_interval: Duration,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let options = ConnectOptions::default();
        Self {
            pipe_server: ".".to_string(),
            pipe_name: "redb-bridge".to_string(),
            connect_timeout: options.connect_timeout,
            reconnect_period: options.reconnect_period,
            heartbeat_interval: Duration::from_secs(5),
            echo_interval: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    bridge: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl BridgeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(service) = root.services.and_then(|services| services.bridge) {
                        config.apply_service_config(service);
                    }
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final bridge configuration: pipe={}, connect_timeout={}, reconnect_period={}",
            config.address(),
            humantime::format_duration(config.connect_timeout),
            humantime::format_duration(config.reconnect_period)
        );

        Ok(config)
    }

    /// Pipe the server listens on and the client dials
    pub fn address(&self) -> PipeAddress {
        PipeAddress::new(self.pipe_server.clone(), self.pipe_name.clone())
    }

    /// Options for the proxy's connect call
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default()
            .with_connect_timeout(self.connect_timeout)
            .with_reconnect_period(self.reconnect_period)
    }

    /// Settings for every session
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_frame_size: self.max_frame_size,
            ..SessionConfig::default()
        }
    }

    fn apply_service_config(&mut self, service: ServiceConfig) {
        for arg in service.args.unwrap_or_default() {
            if let Some((key, value)) = arg.strip_prefix("--").and_then(|arg| arg.split_once('=')) {
                self.apply_value(key, value);
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            if let Some(key) = key.strip_prefix("services.bridge.") {
                self.apply_value(key, &value);
            }
        }
    }

    /// Apply one setting; unknown keys and unparseable values are ignored
    fn apply_value(&mut self, key: &str, value: &str) -> bool {
        let key = key.replace('-', "_");
        match key.as_str() {
            "pipe_server" => self.pipe_server = value.to_string(),
            "pipe_name" => self.pipe_name = value.to_string(),
            "connect_timeout" => return set_duration(&mut self.connect_timeout, &key, value),
            "reconnect_period" => return set_duration(&mut self.reconnect_period, &key, value),
            "heartbeat_interval" => return set_duration(&mut self.heartbeat_interval, &key, value),
            "echo_interval" => return set_duration(&mut self.echo_interval, &key, value),
            "max_frame_size" => match value.parse::<usize>() {
                Ok(size) if size <= HARD_MAX_FRAME_SIZE => self.max_frame_size = size,
                _ => {
                    warn!("Ignoring invalid max_frame_size '{}'", value);
                    return false;
                }
            },
            _ => return false,
        }
        true
    }

    /// Apply `BRIDGE_<KEY>` overrides from `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        const KEYS: [&str; 7] = [
            "pipe_server",
            "pipe_name",
            "connect_timeout",
            "reconnect_period",
            "heartbeat_interval",
            "echo_interval",
            "max_frame_size",
        ];

        for key in KEYS {
            let variable = format!("BRIDGE_{}", key.to_uppercase());
            if let Some(value) = lookup(&variable) {
                if self.apply_value(key, &value) {
                    info!("{} overridden by environment: {}", key, value);
                }
            }
        }
    }
}

fn set_duration(target: &mut Duration, key: &str, value: &str) -> bool {
    match humantime::parse_duration(value) {
        Ok(duration) => {
            *target = duration;
            true
        }
        Err(e) => {
            warn!("Ignoring invalid {} '{}': {}", key, value, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.pipe_name, "redb-bridge");
        assert_eq!(config.address(), PipeAddress::local("redb-bridge"));
        assert_eq!(config.connect_options(), ConnectOptions::default());
        assert_eq!(config.session_config().max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
supervisor:
  port: 50000

services:
  mesh:
    config:
      services.mesh.node_id: "2001"
  bridge:
    enabled: true
    executable: ./redb-bridge
    args:
      - --pipe-name=test-bridge
      - --verbose
    config:
      services.bridge.reconnect_period: "250ms"
      services.bridge.heartbeat_interval: "2s"
      services.bridge.max_frame_size: "1048576"
      services.bridge.connect_timeout: "soon"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.pipe_name, "test-bridge");
        assert_eq!(config.reconnect_period, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.max_frame_size, 1024 * 1024);
        // Invalid values keep the default
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_from_file(dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config.heartbeat_interval, BridgeConfig::default().heartbeat_interval);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("BRIDGE_PIPE_NAME", "from-env"),
            ("BRIDGE_RECONNECT_PERIOD", "0s"),
            ("BRIDGE_MAX_FRAME_SIZE", "999999999999"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.pipe_name, "from-env");
        assert_eq!(config.reconnect_period, Duration::ZERO);
        assert!(config.connect_options().reconnect_period.is_zero());
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }
}
