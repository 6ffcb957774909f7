//! Configuration management for the demo server application
//!
//! Loads configuration from a TOML file at startup. All values are
//! configurable to avoid hardcoded constants.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::server::ServerConfig;

/// Application configuration
///
/// Loaded from `sockpool.toml` at startup (override the path with the
/// `CONFIG_PATH` environment variable).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// TCP server settings
    #[serde(default)]
    pub tcp: ServerSection,

    /// UDP server settings
    #[serde(default)]
    pub udp: ServerSection,
}

/// Settings for one server endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    /// Bind address
    #[serde(default = "default_addr")]
    pub addr: IpAddr,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Capacity of each pooled message buffer, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum concurrently checked-out buffers
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Listen backlog (TCP only)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            pool_capacity: default_pool_capacity(),
            backlog: default_backlog(),
        }
    }
}

fn default_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    50000
}

fn default_buffer_size() -> usize {
    1024
}

fn default_pool_capacity() -> usize {
    10
}

fn default_backlog() -> u32 {
    100
}

impl ServerSection {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.addr,
            port: self.port,
            buffer_size: self.buffer_size,
            pool_capacity: self.pool_capacity,
            backlog: self.backlog,
        }
    }
}

impl AppConfig {
    /// Load configuration from the TOML file.
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "sockpool.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => {
                let config: AppConfig = toml::from_str(&contents)
                    .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Ok(AppConfig::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) => None,
        }
    }
}
