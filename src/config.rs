//! Configuration for the relay node.
//!
//! TOML file with `[node]`, `[network]`, `[tls]` and `[logging]` sections.
//! Every field has a default, so a partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

/// Port appended to discovered peers that do not name one
pub const DEFAULT_PORT: u16 = 7400;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub tls: TlsSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "dcn-relay".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept inbound peers on; no listener when unset
    pub listen_address: Option<String>,
    /// Peers dialed at startup, with reconnect enabled
    pub peers: Vec<String>,
    /// URL returning a JSON array of peer addresses
    pub host_list_url: Option<String>,
    pub default_port: u16,
    pub host_list_interval_secs: u64,
    pub maintenance_interval_ms: u64,
    pub dedup_retention_secs: u64,
    pub inbound_queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            peers: Vec::new(),
            host_list_url: None,
            default_port: DEFAULT_PORT,
            host_list_interval_secs: 5,
            maintenance_interval_ms: 100,
            dedup_retention_secs: 24 * 60 * 60,
            inbound_queue_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn host_list_interval(&self) -> Duration {
        Duration::from_secs(self.host_list_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Skip peer certificate verification. Encrypts but does not authenticate.
    pub insecure_skip_verify: bool,
    /// Extra trust anchors (PEM) for verifying peers
    pub ca_file: Option<PathBuf>,
    /// Listener certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Listener private key (PEM)
    pub key_file: Option<PathBuf>,
    /// Subject names for the generated certificate when no cert/key is given
    pub self_signed_names: Vec<String>,
    /// Name checked against peer certificates instead of the dialed host
    pub server_name: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            self_signed_names: vec!["localhost".to_string()],
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/dcnd.log".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.network.inbound_queue_capacity == 0 {
            return Err(AppError::Config(
                "network.inbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.network.host_list_url.is_some() && self.network.host_list_interval_secs == 0 {
            return Err(AppError::Config(
                "network.host_list_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(AppError::Config(
                "tls.cert_file and tls.key_file must be set together".to_string(),
            ));
        }
        Ok(())
    }
}
