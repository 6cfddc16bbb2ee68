//! Configuration handling for server connections.
//!
//! This module reads connection settings from a YAML file and environment
//! variables, providing one configuration struct the connection layer works
//! from.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

/// Default socket send/receive buffer size in bytes
pub const DEFAULT_SOCKET_BUFFER_SIZE: u32 = 32_768;

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Whether connections use TLS
    pub ssl_enabled: bool,
    /// Path to the PEM trust store used to verify servers
    pub ssl_trust_store: String,
    /// Path to the client certificate chain (PEM), for mutual TLS
    pub ssl_client_cert: String,
    /// Path to the client private key (PEM), for mutual TLS
    pub ssl_client_key: String,
    /// Durable client id; empty for non-durable clients
    pub durable_client_id: String,
    /// How long the server keeps a durable client's queue after disconnect (seconds)
    pub durable_client_timeout: u64,
    /// Base timeout for reply waits (milliseconds)
    pub read_timeout: u64,
    /// Server-side event conflation override: "", "true" or "false"
    pub conflate_events: String,
    /// Socket send/receive buffer size in bytes
    pub socket_buffer_size: u32,
    /// Properties handed to the auth provider when building credentials
    pub security_properties: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ssl_enabled: false,
            ssl_trust_store: String::new(),
            ssl_client_cert: String::new(),
            ssl_client_key: String::new(),
            durable_client_id: String::new(),
            durable_client_timeout: 300,
            read_timeout: DEFAULT_READ_TIMEOUT_MS,
            conflate_events: String::new(),
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            security_properties: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<Self>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(value) = std::env::var("CACHE_CLIENT_SSL_ENABLED") {
            self.ssl_enabled = value.to_lowercase() == "true";
            info!("TLS overridden by environment: {}", self.ssl_enabled);
        }

        if let Ok(value) = std::env::var("CACHE_CLIENT_DURABLE_ID") {
            self.durable_client_id = value;
            info!(
                "Durable client id overridden by environment: {}",
                self.durable_client_id
            );
        }

        if let Ok(value) = std::env::var("CACHE_CLIENT_READ_TIMEOUT") {
            match humantime::parse_duration(&value) {
                Ok(duration) => {
                    self.read_timeout = duration.as_millis() as u64;
                    info!("Read timeout overridden by environment: {}ms", self.read_timeout);
                }
                Err(e) => warn!("Ignoring invalid CACHE_CLIENT_READ_TIMEOUT ({})", e),
            }
        }

        if let Ok(value) = std::env::var("CACHE_CLIENT_DURABLE_TIMEOUT") {
            match humantime::parse_duration(&value) {
                Ok(duration) => {
                    self.durable_client_timeout = duration.as_secs();
                    info!(
                        "Durable timeout overridden by environment: {}s",
                        self.durable_client_timeout
                    );
                }
                Err(e) => warn!("Ignoring invalid CACHE_CLIENT_DURABLE_TIMEOUT ({})", e),
            }
        }

        if let Ok(value) = std::env::var("CACHE_CLIENT_SOCKET_BUFFER_SIZE") {
            if let Ok(size) = value.parse::<u32>() {
                self.socket_buffer_size = size;
                info!("Socket buffer size overridden by environment: {}", size);
            }
        }
    }

    /// Base reply-wait timeout as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    /// Durable queue retention as a [`Duration`]
    pub fn durable_timeout(&self) -> Duration {
        Duration::from_secs(self.durable_client_timeout)
    }

    /// Whether this client registers as durable
    pub fn is_durable(&self) -> bool {
        !self.durable_client_id.is_empty()
    }

    /// Conflation byte sent in the handshake: 0 no preference, 1 conflate,
    /// 2 do not conflate.
    pub fn conflation_override(&self) -> u8 {
        match self.conflate_events.to_lowercase().as_str() {
            "true" => 1,
            "false" => 2,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert!(!config.ssl_enabled);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT_MS);
        assert_eq!(config.socket_buffer_size, DEFAULT_SOCKET_BUFFER_SIZE);
        assert!(!config.is_durable());
        assert_eq!(config.conflation_override(), 0);
    }

    #[test]
    fn test_conflation_override_mapping() {
        let mut config = ConnectionConfig::default();
        config.conflate_events = "true".to_string();
        assert_eq!(config.conflation_override(), 1);
        config.conflate_events = "False".to_string();
        assert_eq!(config.conflation_override(), 2);
        config.conflate_events = "server".to_string();
        assert_eq!(config.conflation_override(), 0);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
ssl_enabled: false
durable_client_id: client-42
durable_client_timeout: 600
read_timeout: 5000
conflate_events: "true"
security_properties:
  security-username: reader
"#;
        let config: ConnectionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.is_durable());
        assert_eq!(config.durable_timeout(), Duration::from_secs(600));
        assert_eq!(config.read_timeout(), Duration::from_millis(5000));
        assert_eq!(config.conflation_override(), 1);
        assert_eq!(
            config.security_properties.get("security-username").map(String::as_str),
            Some("reader")
        );
        // unset fields fall back to defaults
        assert_eq!(config.socket_buffer_size, DEFAULT_SOCKET_BUFFER_SIZE);
    }
}
