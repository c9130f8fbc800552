//! Configuration module
//!
//! Handles loading and saving CmdNode configuration.

mod settings;

pub use settings::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::identity::NodeIdentity;
use crate::network;
use crate::protocol::DEFAULT_PORT;

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
    /// Identity announced to peers
    #[serde(default)]
    pub node: NodeConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Persisted settings store
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (auto-generated if not set)
    pub id: Option<String>,
    /// Human-readable name, used as the relay address
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_kind() -> String {
    "node".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: default_name(),
            group: String::new(),
            kind: default_kind(),
            description: String::new(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host to connect to in client mode
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Negotiate a network session before dialing
    #[serde(default)]
    pub session_required: bool,
    /// Preferred local interface (default: all)
    pub bind_address: Option<String>,
    /// Command channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            session_required: false,
            bind_address: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Settings store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Settings file (default: next to the config in the user config dir)
    pub path: Option<PathBuf>,
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
            dirs::config_dir().map(|p| p.join("cmdnode/config.toml")),
            Some(PathBuf::from("./cmdnode.toml")),
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

    /// Identity block for outgoing envelopes, generating an id if not set
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            id: self
                .node
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            group: self.node.group.clone(),
            name: self.node.name.clone(),
            kind: self.node.kind.clone(),
            description: self.node.description.clone(),
        }
    }

    /// Runtime network configuration
    pub fn net_config(&self) -> network::NetworkConfig {
        network::NetworkConfig {
            host: self.network.host.clone(),
            port: self.network.port,
            bind_address: self.network.bind_address.clone(),
            session_required: self.network.session_required,
            connect_timeout_ms: self.network.connect_timeout_ms,
            channel_capacity: self.network.channel_capacity.max(1),
        }
    }

    /// Where the settings store lives
    pub fn settings_path(&self) -> PathBuf {
        self.settings.path.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cmdnode/settings.toml")
        })
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        node: NodeConfig {
            id: Some("office-desktop".to_string()),
            name: "desktop".to_string(),
            group: "office".to_string(),
            kind: default_kind(),
            description: "Desk by the window".to_string(),
        },
        network: NetworkConfig {
            host: "relay.local".to_string(),
            ..Default::default()
        },
        settings: SettingsConfig::default(),
    };

    Ok(toml::to_string_pretty(&config)?)
}
