//! Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./ovn.yaml` (current directory - highest priority)
//! 2. `~/.config/ovn/ovn.yaml` (user config directory)
//! 3. `/etc/ovn/ovn.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files.

mod node;
mod transport;

pub use node::NodeConfig;
pub use transport::UdpConfig;

use crate::identity::{Identity, IdentityError};
use crate::inet::InetAddress;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default config filename.
const CONFIG_FILENAME: &str = "ovn.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Identity configuration (`identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded secret key (`identity.secret`). If not specified, a
    /// new keypair is generated at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity configuration (`identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Node configuration (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// UDP transport configuration (`udp.*`).
    #[serde(default)]
    pub udp: UdpConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns the
    /// merged config and the paths that were actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths, later paths overriding
    /// earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/ovn").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("ovn").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.identity.secret.is_some() {
            self.identity.secret = other.identity.secret;
        }
        self.node.merge(other.node);
        self.udp.merge(other.udp);
    }

    /// Create an identity from this configuration.
    ///
    /// Uses the configured secret when present, otherwise generates a new
    /// random identity.
    pub fn create_identity(&self) -> Result<Identity, ConfigError> {
        match &self.identity.secret {
            Some(secret) => Ok(Identity::from_secret_hex(secret)?),
            None => Ok(Identity::generate()),
        }
    }

    /// Whether an identity is configured (vs. will be generated).
    pub fn has_identity(&self) -> bool {
        self.identity.secret.is_some()
    }

    /// Parse the configured announce endpoints, skipping (and logging)
    /// malformed entries.
    pub fn announce_addresses(&self) -> Vec<InetAddress> {
        self.node
            .announce
            .iter()
            .filter_map(|s| match s.parse::<InetAddress>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(entry = %s, "ignoring malformed announce endpoint: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
identity:
  secret: "0000000000000000000000000000000000000000000000000000000000000001"
node:
  world_id: 11
  announce:
    - "198.51.100.1:7717"
udp:
  port: 9000
  bind_v6: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.has_identity());
        assert_eq!(config.node.world_id(), 11);
        assert_eq!(config.udp.port(), 9000);
        assert!(!config.udp.bind_v6());

        let identity = config.create_identity().unwrap();
        assert!(!identity.address().is_reserved());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(!config.has_identity());
        assert_eq!(config.udp.port(), 7717);
        assert_eq!(config.node.housekeeping_interval_ms(), 1_000);
    }

    #[test]
    fn test_merge_priority() {
        let mut low: Config = serde_yaml::from_str("udp:\n  port: 8000\n").unwrap();
        let high: Config = serde_yaml::from_str("udp:\n  bind_v6: false\n").unwrap();
        low.merge(high);

        // Port from the low-priority file survives; bind_v6 was overridden.
        assert_eq!(low.udp.port(), 8000);
        assert!(!low.udp.bind_v6());
    }

    #[test]
    fn test_announce_addresses_skips_malformed() {
        let config: Config =
            serde_yaml::from_str("node:\n  announce:\n    - \"198.51.100.1:7717\"\n    - \"nonsense\"\n")
                .unwrap();
        let parsed = config.announce_addresses();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_load_missing_paths_yields_defaults() {
        let (config, loaded) =
            Config::load_from_paths(&[PathBuf::from("/nonexistent/ovn.yaml")]).unwrap();
        assert!(loaded.is_empty());
        assert!(!config.has_identity());
    }
}
