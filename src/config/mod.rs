//! Configuration module
//!
//! Handles loading and saving PeerWire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::NetworkConfig as NetConfig;
use crate::protocol::{DEFAULT_ACCEPT_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Player name announced during the handshake
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "player".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to when hosting
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Connect timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Accept timeout in ms
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_ms: u64,
    /// Per-message handshake timeout in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Largest payload accepted from a peer
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Outbound frames allowed to wait for the socket
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize,
    /// Time given to queued writes on shutdown, in ms
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS * 1000
}

fn default_accept_timeout() -> u64 {
    DEFAULT_ACCEPT_TIMEOUT_SECS * 1000
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_max_payload_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_max_pending_frames() -> usize {
    1024
}

fn default_drain_timeout() -> u64 {
    1000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
            accept_timeout_ms: default_accept_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_payload_size: default_max_payload_size(),
            max_pending_frames: default_max_pending_frames(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections created per pool
    #[serde(default = "default_connections")]
    pub connections: usize,
}

fn default_connections() -> usize {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("peerwire/config.toml")),
            Some(PathBuf::from("./peerwire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Runtime settings for connections and pools
    pub fn network_settings(&self) -> NetConfig {
        NetConfig {
            port: self.network.port,
            connect_timeout_ms: self.network.connect_timeout_ms,
            accept_timeout_ms: self.network.accept_timeout_ms,
            handshake_timeout_ms: self.network.handshake_timeout_ms,
            max_payload_size: self.network.max_payload_size,
            max_pending_frames: self.network.max_pending_frames,
            drain_timeout_ms: self.network.drain_timeout_ms,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Alice".to_string(),
            verbose: false,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
