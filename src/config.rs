//! Agent configuration
//!
//! Every parameter the agent needs is read from a single TOML file. A missing file is
//! created with defaults on first start, missing keys fall back to their defaults.

use crate::mqtt::config::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/dht-mqtt-agent";
const CONFIG_FILE: &str = "agent.toml";
const CONFIG_ENV: &str = "DHT_AGENT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Wireless link settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Skip the join step when networking is managed elsewhere
    pub enabled: bool,
    pub ssid: String,
    /// Empty for open networks
    pub credential: String,
    pub join_poll_secs: u64,
    /// `None` waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_timeout_secs: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ssid: "Wokwi-GUEST".to_string(),
            credential: String::new(),
            join_poll_secs: 1,
            join_timeout_secs: None,
        }
    }
}

impl NetworkConfig {
    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_secs(self.join_poll_secs.max(1))
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_secs.map(Duration::from_secs)
    }
}

/// GPIO assignment (BCM numbering)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    pub dht_pin: u8,
    pub led_pin: u8,
    pub led_active_low: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            dht_pin: 26,
            led_pin: 12,
            led_active_low: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub publish_interval_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 5,
        }
    }
}

impl LoopConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    pub hardware: HardwareConfig,
    #[serde(rename = "agent")]
    pub control_loop: LoopConfig,
}

impl AgentConfig {
    /// Parses a TOML document and validates the result.
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&content, path)
    }

    /// Writes a default config file if none exists yet, then loads it.
    pub async fn ensure_and_load(path: &Path) -> Result<Self, ConfigError> {
        ensure_default_config(path).await?;
        let config = Self::load(path).await?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.client_id must not be empty".into()));
        }
        if self.broker.telemetry_topic.is_empty() || self.broker.control_topic.is_empty() {
            return Err(ConfigError::Invalid("broker topics must not be empty".into()));
        }
        if self.control_loop.publish_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.publish_interval_secs must be at least 1".into(),
            ));
        }
        // Keep-alive pings only go out while a cycle drives the broker session
        let keep_alive = self.broker.effective_keep_alive_secs();
        if self.control_loop.publish_interval_secs >= keep_alive {
            return Err(ConfigError::Invalid(format!(
                "agent.publish_interval_secs ({}) must be shorter than the broker keep-alive ({}s)",
                self.control_loop.publish_interval_secs, keep_alive
            )));
        }
        if self.hardware.dht_pin == self.hardware.led_pin {
            return Err(ConfigError::Invalid(format!(
                "dht_pin and led_pin both use GPIO {}",
                self.hardware.dht_pin
            )));
        }
        if self.network.enabled && self.network.ssid.is_empty() {
            warn!("network.enabled is set but no SSID is configured");
        }
        Ok(())
    }
}

/// Resolves the config location: `$DHT_AGENT_CONFIG`, else `~/.config/dht-mqtt-agent/agent.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
    let io_err = |source: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if tokio::fs::try_exists(path).await.map_err(io_err)? {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let content = toml::to_string_pretty(&AgentConfig::default())?;
    tokio::fs::write(path, content).await.map_err(io_err)?;
    info!("Created default config at {}", path.display());
    Ok(())
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
