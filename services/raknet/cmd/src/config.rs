//! Configuration handling for the RakNet node.
//!
//! Settings are read from the `raknet` section of a YAML file, then
//! overridden by environment variables. Command line flags are applied on top
//! by `main`.

use anyhow::{Context, Result};
use raknet_session::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration as written in the YAML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UDP bind address
    pub bind: String,
    /// Status string returned in unconnected pongs
    pub motd: String,
    /// Fixed server id; random when absent
    pub server_id: Option<u64>,
    /// Lowest negotiable MTU
    pub min_mtu: u16,
    /// Highest negotiable MTU
    pub max_mtu: u16,
    /// Session tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Session inactivity timeout in seconds
    pub timeout_secs: u64,
    /// Ticks between connected pings
    pub ping_interval_ticks: u64,
    /// Incomplete split sets kept per session
    pub max_split_sets: usize,
    /// Largest accepted split count
    pub max_split_parts: u32,
    /// Age in seconds after which an incomplete split set is evicted
    pub split_timeout_secs: u64,
    /// Receive window size in datagrams
    pub window_limit: u32,
    /// Whether receive window gaps are NAKed
    pub nak_gaps: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: defaults.bind_addr.to_string(),
            motd: defaults.motd,
            server_id: None,
            min_mtu: defaults.min_mtu,
            max_mtu: defaults.max_mtu,
            tick_interval_ms: defaults.tick_interval.as_millis() as u64,
            timeout_secs: defaults.timeout.as_secs(),
            ping_interval_ticks: defaults.ping_interval_ticks,
            max_split_sets: defaults.max_split_sets,
            max_split_parts: defaults.max_split_parts,
            split_timeout_secs: defaults.split_timeout.as_secs(),
            window_limit: defaults.window_limit,
            nak_gaps: defaults.nak_gaps,
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    raknet: Option<NodeConfig>,
}

impl NodeConfig {
    /// Load from file, falling back to defaults, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.raknet.unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `RAKNET_*` overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("RAKNET_BIND") {
            info!("Bind address overridden by environment: {}", bind);
            self.bind = bind;
        }
        if let Some(motd) = lookup("RAKNET_MOTD") {
            info!("MOTD overridden by environment: {}", motd);
            self.motd = motd;
        }
        if let Some(value) = lookup("RAKNET_MAX_MTU") {
            match value.parse::<u16>() {
                Ok(mtu) => {
                    info!("Max MTU overridden by environment: {}", mtu);
                    self.max_mtu = mtu;
                }
                Err(_) => warn!("Ignoring invalid RAKNET_MAX_MTU: {}", value),
            }
        }
        if let Some(value) = lookup("RAKNET_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => {
                    info!("Session timeout overridden by environment: {}s", secs);
                    self.timeout_secs = secs;
                }
                Err(_) => warn!("Ignoring invalid RAKNET_TIMEOUT_SECS: {}", value),
            }
        }
    }

    /// Build the server configuration
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let bind_addr: SocketAddr = self
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind))?;
        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            bind_addr,
            server_id: self.server_id.unwrap_or(defaults.server_id),
            motd: self.motd.clone(),
            min_mtu: self.min_mtu,
            max_mtu: self.max_mtu,
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            timeout: Duration::from_secs(self.timeout_secs),
            ping_interval_ticks: self.ping_interval_ticks,
            max_split_sets: self.max_split_sets,
            max_split_parts: self.max_split_parts,
            split_timeout: Duration::from_secs(self.split_timeout_secs),
            window_limit: self.window_limit,
            nak_gaps: self.nak_gaps,
            ..defaults
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.bind, "0.0.0.0:19132");
        assert_eq!(config.max_mtu, 1492);
        assert_eq!(config.timeout_secs, 6);

        let server = config.to_server_config().unwrap();
        assert_eq!(server.tick_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_parse_file_section() {
        let yaml_content = r#"
raknet:
  bind: "127.0.0.1:19133"
  motd: "MCPE;Test server"
  server_id: 99
  max_mtu: 1200
  nak_gaps: false
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();
        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        let root: RootConfig = serde_yaml::from_str(&content).unwrap();
        let config = root.raknet.unwrap();

        assert_eq!(config.bind, "127.0.0.1:19133");
        assert_eq!(config.motd, "MCPE;Test server");
        assert_eq!(config.max_mtu, 1200);
        assert!(!config.nak_gaps);
        // Unset keys keep their defaults
        assert_eq!(config.min_mtu, 400);

        let server = config.to_server_config().unwrap();
        assert_eq!(server.server_id, 99);
        assert_eq!(server.clamp_mtu(1492), 1200);
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"raknet: [not, a, map").unwrap();
        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert!(serde_yaml::from_str::<RootConfig>(&content).is_err());

        let config = NodeConfig::load_from_file("/nonexistent/raknet.yaml");
        assert_eq!(config.max_split_parts, NodeConfig::default().max_split_parts);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("RAKNET_BIND", "127.0.0.1:4000"),
            ("RAKNET_MOTD", "from env"),
            ("RAKNET_MAX_MTU", "576"),
            ("RAKNET_TIMEOUT_SECS", "bogus"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.bind, "127.0.0.1:4000");
        assert_eq!(config.motd, "from env");
        assert_eq!(config.max_mtu, 576);
        assert_eq!(config.timeout_secs, 6);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let config = NodeConfig {
            bind: "not-an-address".into(),
            ..NodeConfig::default()
        };
        assert!(config.to_server_config().is_err());
    }
}
