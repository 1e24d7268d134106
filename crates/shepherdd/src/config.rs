//! Server configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) yields
//! a working server.
//!
//! ```toml
//! port = 5683
//! connection_type = "udp4"
//! req_timeout = 60
//! hb_timeout = 60
//!
//! [storage]
//! kind = "file"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Socket family used by the UDP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Udp4,
    Udp6,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process map, lost on restart
    Memory,
    /// JSON document at `default_db_path`
    #[default]
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub kind: StorageKind,
}

/// Process-wide server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShepherdConfig {
    /// Address to bind; unspecified address of the connection type when absent
    #[serde(default)]
    pub bind_ip: Option<IpAddr>,
    #[serde(default = "ShepherdConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Seconds before an outbound request resolves as a timeout
    #[serde(default = "ShepherdConfig::default_req_timeout")]
    pub req_timeout: u64,
    /// Heartbeat sweep period and staleness threshold, in seconds
    #[serde(default = "ShepherdConfig::default_hb_timeout")]
    pub hb_timeout: u64,
    #[serde(default = "default_true")]
    pub auto_read_resources: bool,
    #[serde(default)]
    pub disable_filtering: bool,
    #[serde(default)]
    pub always_fire_dev_incoming: bool,
    #[serde(default)]
    pub dont_reinitiate_observe: bool,
    #[serde(default = "ShepherdConfig::default_db_path")]
    pub default_db_path: PathBuf,
    #[serde(default)]
    pub default_min_period: u64,
    #[serde(default = "ShepherdConfig::default_max_period")]
    pub default_max_period: u64,
    #[serde(default = "ShepherdConfig::default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_true")]
    pub always_permit_join: bool,
    /// Prefix removed from endpoint names before they become client names
    #[serde(default)]
    pub client_name_prefix_strip: Option<String>,
    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_true() -> bool {
    true
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            port: Self::default_port(),
            connection_type: ConnectionType::default(),
            req_timeout: Self::default_req_timeout(),
            hb_timeout: Self::default_hb_timeout(),
            auto_read_resources: true,
            disable_filtering: false,
            always_fire_dev_incoming: false,
            dont_reinitiate_observe: false,
            default_db_path: Self::default_db_path(),
            default_min_period: 0,
            default_max_period: Self::default_max_period(),
            max_devices: Self::default_max_devices(),
            always_permit_join: true,
            client_name_prefix_strip: None,
            storage: StorageSettings::default(),
        }
    }
}

impl ShepherdConfig {
    fn default_port() -> u16 {
        5683
    }

    fn default_req_timeout() -> u64 {
        60
    }

    fn default_hb_timeout() -> u64 {
        60
    }

    fn default_max_period() -> u64 {
        60
    }

    fn default_max_devices() -> usize {
        4096
    }

    fn default_db_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("coap-shepherd").join("devices.json")
        } else {
            PathBuf::from("/var/lib/coap-shepherd/devices.json")
        }
    }

    /// Standard location of the config file.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("coap-shepherd").join("shepherd.toml")
        } else {
            PathBuf::from(".config/coap-shepherd/shepherd.toml")
        }
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Loads `path` when given, else the default location when it exists,
    /// else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let candidate = Self::default_path();
                if candidate.exists() {
                    Self::load(&candidate)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.req_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "req_timeout",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.hb_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "hb_timeout",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.max_devices == 0 {
            return Err(ConfigError::Invalid {
                field: "max_devices",
                reason: "must allow at least one device".to_string(),
            });
        }
        if let Some(ip) = self.bind_ip {
            let matches = match self.connection_type {
                ConnectionType::Udp4 => ip.is_ipv4(),
                ConnectionType::Udp6 => ip.is_ipv6(),
            };
            if !matches {
                return Err(ConfigError::Invalid {
                    field: "bind_ip",
                    reason: format!("{ip} does not match {:?}", self.connection_type),
                });
            }
        }
        Ok(())
    }

    /// Socket address the server binds.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self.bind_ip.unwrap_or(match self.connection_type {
            ConnectionType::Udp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ConnectionType::Udp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        SocketAddr::new(ip, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.req_timeout)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.hb_timeout)
    }

    /// Applies `client_name_prefix_strip` to an endpoint name.
    pub fn client_name_for(&self, endpoint: &str) -> String {
        match &self.client_name_prefix_strip {
            Some(prefix) if !prefix.is_empty() => endpoint
                .strip_prefix(prefix.as_str())
                .unwrap_or(endpoint)
                .to_string(),
            _ => endpoint.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ShepherdConfig::from_toml("").unwrap();
        assert_eq!(config.port, 5683);
        assert_eq!(config.req_timeout, 60);
        assert!(config.auto_read_resources);
        assert!(config.always_permit_join);
        assert_eq!(config.default_max_period, 60);
        assert_eq!(config.storage.kind, StorageKind::File);
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:5683");
    }

    #[test]
    fn test_overrides_and_udp6() {
        let config = ShepherdConfig::from_toml(
            "port = 5700\nconnection_type = \"udp6\"\ndisable_filtering = true\n[storage]\nkind = \"memory\"\n",
        )
        .unwrap();
        assert_eq!(config.bind_addr().to_string(), "[::]:5700");
        assert!(config.disable_filtering);
        assert_eq!(config.storage.kind, StorageKind::Memory);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            ShepherdConfig::from_toml("req_timeout = 0"),
            Err(ConfigError::Invalid { field: "req_timeout", .. })
        ));
        assert!(matches!(
            ShepherdConfig::from_toml("bind_ip = \"::1\""),
            Err(ConfigError::Invalid { field: "bind_ip", .. })
        ));
        assert!(matches!(
            ShepherdConfig::from_toml("port = \"x\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_client_name_prefix_strip() {
        let config = ShepherdConfig {
            client_name_prefix_strip: Some("urn:dev:".to_string()),
            ..ShepherdConfig::default()
        };
        assert_eq!(config.client_name_for("urn:dev:abc"), "abc");
        assert_eq!(config.client_name_for("other"), "other");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shepherd.toml");
        std::fs::write(&path, "hb_timeout = 30\n").unwrap();
        let config = ShepherdConfig::load(&path).unwrap();
        assert_eq!(config.hb_timeout, 30);
        assert!(matches!(
            ShepherdConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
