use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{ensure, Context, Result};
use shared::protocol::{
    DEFAULT_SERVICE_INSTANCE, DEFAULT_SERVICE_TYPE, MAX_GROUP_OWNER_INTENT, TXT_AVAILABLE,
    TXT_BUDDY_NAME, TXT_LISTEN_PORT,
};
use shared::types::{PairingMode, ServiceRecord};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Service advertised at startup, if any
    pub service: Option<ServiceConfig>,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Defaults to the system hostname
    pub name: Option<String>,
    /// Defaults to an address derived from the device name
    pub address: Option<String>,
    pub primary_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioBackend {
    #[default]
    Mdns,
    Loopback,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RadioConfig {
    #[serde(default)]
    pub backend: RadioBackend,
    /// Restrict the mDNS backend to one interface
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NegotiationConfig {
    #[serde(default)]
    pub pairing: PairingMode,
    /// 0 prefers the client role, 15 demands the group owner role
    #[serde(default)]
    pub group_owner_intent: u8,
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_partial_timeout")]
    pub partial_timeout_secs: u64,
    #[serde(default = "default_max_partials")]
    pub max_partials: usize,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub buddy_name: Option<String>,
    #[serde(default = "default_available")]
    pub available: String,
    /// Extra TXT attributes
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_negotiation_timeout() -> u64 {
    45
}

fn default_partial_timeout() -> u64 {
    30
}

fn default_max_partials() -> usize {
    64
}

fn default_maintenance_interval() -> u64 {
    5
}

fn default_instance_name() -> String {
    DEFAULT_SERVICE_INSTANCE.to_string()
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_listen_port() -> u16 {
    9000
}

fn default_available() -> String {
    "visible".to_string()
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            pairing: PairingMode::default(),
            group_owner_intent: 0,
            timeout_secs: default_negotiation_timeout(),
        }
    }
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            partial_timeout_secs: default_partial_timeout(),
            max_partials: default_max_partials(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl DiscoveryConfig {
    pub fn partial_timeout(&self) -> Duration {
        Duration::from_secs(self.partial_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl ServiceConfig {
    /// Build the advertised record; `buddy_name` falls back to the device name
    pub fn to_record(&self, device_name: &str) -> ServiceRecord {
        let mut attributes = self.attributes.clone();
        attributes.insert(TXT_LISTEN_PORT.to_string(), self.listen_port.to_string());
        attributes.insert(
            TXT_BUDDY_NAME.to_string(),
            self.buddy_name.clone().unwrap_or_else(|| device_name.to_string()),
        );
        attributes.insert(TXT_AVAILABLE.to_string(), self.available.clone());

        ServiceRecord {
            instance_name: self.instance_name.clone(),
            service_type: self.service_type.clone(),
            attributes,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.negotiation.group_owner_intent <= MAX_GROUP_OWNER_INTENT,
            "group_owner_intent must be between 0 and {}",
            MAX_GROUP_OWNER_INTENT
        );
        ensure!(self.negotiation.timeout_secs > 0, "negotiation timeout must be non-zero");
        ensure!(self.discovery.partial_timeout_secs > 0, "partial_timeout_secs must be non-zero");
        ensure!(self.discovery.max_partials > 0, "max_partials must be non-zero");
        ensure!(
            self.discovery.maintenance_interval_secs > 0,
            "maintenance_interval_secs must be non-zero"
        );
        Ok(())
    }
}
