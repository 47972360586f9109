//! Configuration system for the GhostLink CLI.

use ghostlink_core::DeviceClass;
use ghostlink_core::config::{IceSettings, LinkConfig, ManagedConfig, RelayConfig};
use ghostlink_signal::{IcePolicy, IceServer};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Direct strategy relay
    #[serde(default)]
    pub relay: RelaySection,

    /// Managed strategy broker
    #[serde(default)]
    pub managed: ManagedSection,

    /// NAT traversal helpers
    #[serde(default)]
    pub ice: IceSection,

    /// Device classification
    #[serde(default)]
    pub device: DeviceSection,

    /// Relay server (`ghostlink relay`)
    #[serde(default)]
    pub server: ServerSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Direct relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Relay endpoints in preference order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Auth token
    #[serde(default = "default_token")]
    pub token: String,
}

/// Managed broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedSection {
    /// Broker endpoints in preference order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Identity-issuing base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_endpoint: Option<String>,

    /// Auth token
    #[serde(default = "default_token")]
    pub token: String,
}

/// ICE settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IceSection {
    /// Transport policy
    #[serde(default)]
    pub policy: IcePolicy,

    /// User-supplied helper server, ranked after the built-in ones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_server: Option<IceServer>,
}

/// Device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Force a device class instead of detecting it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<DeviceClass>,

    /// Connection event log capacity
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default values
fn default_endpoints() -> Vec<String> {
    vec![ghostlink_core::config::DEFAULT_RELAY_ENDPOINT.to_string()]
}

fn default_token() -> String {
    ghostlink_signal::relay::DEFAULT_TOKEN.to_string()
}

fn default_event_log_capacity() -> usize {
    ghostlink_core::config::DEFAULT_EVENT_LOG_CAPACITY
}

fn default_bind_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            token: default_token(),
        }
    }
}

impl Default for ManagedSection {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            id_endpoint: None,
            token: default_token(),
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            class: None,
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ghostlink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the relay server listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.bind.parse()?)
    }

    /// Convert to the link configuration consumed by the core crate
    #[must_use]
    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig {
            relay: RelayConfig {
                endpoints: self.relay.endpoints.clone(),
                token: self.relay.token.clone(),
            },
            managed: ManagedConfig {
                endpoints: self.managed.endpoints.clone(),
                id_endpoint: self.managed.id_endpoint.clone(),
                token: self.managed.token.clone(),
            },
            ice: IceSettings {
                custom_server: self.ice.custom_server.clone(),
                policy: self.ice.policy,
            },
            device_override: self.device.class,
            event_log_capacity: self.device.event_log_capacity,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_bind_addr()?;

        if self.relay.endpoints.is_empty() {
            anyhow::bail!("No relay endpoints configured");
        }
        if self.managed.endpoints.is_empty() {
            anyhow::bail!("No managed endpoints configured");
        }
        for endpoint in self.relay.endpoints.iter().chain(&self.managed.endpoints) {
            validate_url(endpoint, "Relay endpoint", &["ws", "wss"])?;
        }
        if let Some(id_endpoint) = &self.managed.id_endpoint {
            validate_url(id_endpoint, "Identity endpoint", &["http", "https"])?;
        }

        if let Some(server) = &self.ice.custom_server {
            if server.urls.is_empty() {
                anyhow::bail!("Custom ICE server has no URLs");
            }
            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"];
                if !known.iter().any(|scheme| url.starts_with(scheme)) {
                    anyhow::bail!("Custom ICE server URL '{}' is not a STUN/TURN URL", url);
                }
            }
        }

        if self.device.event_log_capacity == 0 {
            anyhow::bail!("Event log capacity must be non-zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

fn validate_url(addr: &str, name: &str, schemes: &[&str]) -> anyhow::Result<()> {
    let url = Url::parse(addr).map_err(|e| anyhow::anyhow!("{} '{}' is invalid: {}", name, addr, e))?;
    if !schemes.contains(&url.scheme()) {
        anyhow::bail!(
            "{} '{}' must use one of: {}",
            name,
            addr,
            schemes.join(", ")
        );
    }
    if url.host_str().is_none_or(str::is_empty) {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }
    Ok(())
}
