//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::rsa::{RsaKeyPair, PROTOCOL_EXPONENT, PROTOCOL_MODULUS};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name shown in logs
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Address the game listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Game port (TCP)
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Path to data files (player saves live under `players/`)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Maximum number of players in the world
    #[serde(default = "default_max_players")]
    pub max_players: u32,

    /// Game tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Frames decoded per session per tick before the rest wait for the next one
    #[serde(default = "default_packets_per_cycle")]
    pub packets_per_cycle: u32,

    /// Seconds without a decoded frame before a session is dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Concurrent blocking persistence jobs
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Log output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Admission policy
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// RSA private key configuration
    #[serde(default)]
    pub rsa: RsaConfig,
}

/// Per-host admission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Hosts refused at the gate and at login
    #[serde(default)]
    pub banned_hosts: Vec<String>,

    /// Simultaneous sessions allowed from one host
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: u32,

    /// Window in which a reconnect from an active host is refused
    #[serde(default = "default_throttle_window")]
    pub throttle_window_ms: u64,
}

/// RSA key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaConfig {
    /// RSA modulus (N) as a decimal string
    #[serde(default = "default_rsa_modulus")]
    pub modulus: String,

    /// RSA private exponent (D) as a decimal string
    #[serde(default = "default_rsa_private_exponent")]
    pub private_exponent: String,
}

// Default value functions
fn default_server_name() -> String {
    "Ferroscape".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_game_port() -> u16 {
    43594
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_players() -> u32 {
    2000
}

fn default_tick_rate() -> u64 {
    600
}

fn default_packets_per_cycle() -> u32 {
    25
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_connections_per_host() -> u32 {
    1
}

fn default_throttle_window() -> u64 {
    1000
}

fn default_rsa_modulus() -> String {
    PROTOCOL_MODULUS.to_string()
}

fn default_rsa_private_exponent() -> String {
    PROTOCOL_EXPONENT.to_string()
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            banned_hosts: Vec::new(),
            max_connections_per_host: default_max_connections_per_host(),
            throttle_window_ms: default_throttle_window(),
        }
    }
}

impl Default for RsaConfig {
    fn default() -> Self {
        Self {
            modulus: default_rsa_modulus(),
            private_exponent: default_rsa_private_exponent(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            bind_address: default_bind_address(),
            game_port: default_game_port(),
            data_path: default_data_path(),
            max_players: default_max_players(),
            tick_rate_ms: default_tick_rate(),
            packets_per_cycle: default_packets_per_cycle(),
            idle_timeout_secs: default_idle_timeout(),
            worker_pool_size: default_worker_pool_size(),
            log_format: default_log_format(),
            admission: AdmissionConfig::default(),
            rsa: RsaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("FERROSCAPE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;
            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document; missing keys take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FERROSCAPE_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("FERROSCAPE_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("FERROSCAPE_GAME_PORT") {
            if let Ok(port) = val.parse() {
                self.game_port = port;
            }
        }
        if let Ok(val) = env::var("FERROSCAPE_DATA_PATH") {
            self.data_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("FERROSCAPE_MAX_PLAYERS") {
            if let Ok(max) = val.parse() {
                self.max_players = max;
            }
        }
        if let Ok(val) = env::var("FERROSCAPE_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
        if let Ok(val) = env::var("FERROSCAPE_LOG_FORMAT") {
            self.log_format = val.to_lowercase();
        }
        if let Ok(val) = env::var("FERROSCAPE_BANNED_HOSTS") {
            self.admission.banned_hosts = val
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(String::from)
                .collect();
        }

        // RSA overrides (from secure environment)
        if let Ok(val) = env::var("FERROSCAPE_RSA_MODULUS") {
            self.rsa.modulus = val;
        }
        if let Ok(val) = env::var("FERROSCAPE_RSA_PRIVATE_EXPONENT") {
            self.rsa.private_exponent = val;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_players == 0 || self.max_players > 2047 {
            anyhow::bail!("Max players must be between 1 and 2047");
        }

        if self.tick_rate_ms < 100 || self.tick_rate_ms > 5000 {
            anyhow::bail!("Tick rate must be between 100ms and 5000ms");
        }

        if self.packets_per_cycle == 0 {
            anyhow::bail!("Packets per cycle must be at least 1");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("Worker pool size must be at least 1");
        }

        if self.admission.max_connections_per_host == 0 {
            anyhow::bail!("Max connections per host must be at least 1");
        }

        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Log format must be \"pretty\" or \"json\"");
        }

        self.rsa_key_pair()?;

        Ok(())
    }

    /// Socket address the game listener binds to
    pub fn game_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.game_port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.admission.throttle_window_ms)
    }

    /// Directory holding one JSON file per player
    pub fn players_path(&self) -> PathBuf {
        self.data_path.join("players")
    }

    pub fn rsa_key_pair(&self) -> Result<RsaKeyPair> {
        RsaKeyPair::from_decimal(&self.rsa.modulus, &self.rsa.private_exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server_name, "Ferroscape");
        assert_eq!(config.game_port, 43594);
        assert_eq!(config.tick_rate_ms, 600);
        assert_eq!(config.packets_per_cycle, 25);
        assert_eq!(config.admission.max_connections_per_host, 1);
        assert_eq!(config.throttle_window(), Duration::from_millis(1000));
        assert_eq!(config.game_address(), "0.0.0.0:43594");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            server_name = "Test"
            max_players = 50

            [admission]
            banned_hosts = ["198.51.100.7"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "Test");
        assert_eq!(config.max_players, 50);
        assert_eq!(config.admission.banned_hosts, vec!["198.51.100.7"]);
        assert_eq!(config.admission.throttle_window_ms, 1000);
        assert_eq!(config.rsa.modulus, PROTOCOL_MODULUS);
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.max_players = 0;
        assert!(config.validate().is_err());
        config.max_players = 2000;

        config.log_format = "xml".to_string();
        assert!(config.validate().is_err());
        config.log_format = "json".to_string();

        config.rsa.modulus = "not-a-number".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_players_path() {
        let config = ServerConfig::default();
        assert_eq!(config.players_path(), PathBuf::from("./data/players"));
    }
}
