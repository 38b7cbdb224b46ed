use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ncp: NcpConfig,
    #[serde(default)]
    pub interfaces: InterfacesConfig,
    #[serde(default)]
    pub advertising: ProxyConfig,
    #[serde(default)]
    pub discovery: ProxyConfig,
    #[serde(default)]
    pub multicast: MulticastConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NcpConfig {
    /// Radio device, e.g. /dev/ttyACM0
    pub device: PathBuf,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub iid: u8,
    /// Hex encoded active dataset TLVs; the agent joins with it on startup
    #[serde(default)]
    pub active_dataset: Option<String>,
    /// Hex encoded pending dataset TLVs, sent to the leader once attached
    #[serde(default)]
    pub pending_dataset: Option<String>,
    /// Detach and erase the network state before exiting
    #[serde(default)]
    pub leave_on_shutdown: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfacesConfig {
    #[serde(default = "default_thread_interface")]
    pub thread: String,
    #[serde(default = "default_backbone_interface")]
    pub backbone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MulticastConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_expire_timeout")]
    pub expire_timeout_secs: u64,
    #[serde(default = "default_expire_interval")]
    pub expire_interval_secs: u64,
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

fn default_baudrate() -> u32 {
    115200
}

fn default_thread_interface() -> String {
    "wpan0".to_string()
}

fn default_backbone_interface() -> String {
    "eth0".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_expire_timeout() -> u64 {
    300
}

fn default_expire_interval() -> u64 {
    60
}

fn default_max_listeners() -> usize {
    75
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            thread: default_thread_interface(),
            backbone: default_backbone_interface(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            expire_timeout_secs: default_expire_timeout(),
            expire_interval_secs: default_expire_interval(),
            max_listeners: default_max_listeners(),
        }
    }
}

impl MulticastConfig {
    /// Forwarding cache entries kept per listener
    const ENTRIES_PER_LISTENER: usize = 10;

    pub fn table_size(&self) -> usize {
        self.max_listeners * Self::ENTRIES_PER_LISTENER
    }

    pub fn expire_timeout(&self) -> Duration {
        Duration::from_secs(self.expire_timeout_secs)
    }

    pub fn expire_interval(&self) -> Duration {
        Duration::from_secs(self.expire_interval_secs)
    }
}

impl NcpConfig {
    /// Decoded `active_dataset`, if configured.
    pub fn active_dataset_tlvs(&self) -> Result<Option<Vec<u8>>> {
        decode_dataset(self.active_dataset.as_deref()).context("active_dataset is not valid hex")
    }

    /// Decoded `pending_dataset`, if configured.
    pub fn pending_dataset_tlvs(&self) -> Result<Option<Vec<u8>>> {
        decode_dataset(self.pending_dataset.as_deref()).context("pending_dataset is not valid hex")
    }
}

fn decode_dataset(hex: Option<&str>) -> Result<Option<Vec<u8>>, hex::FromHexError> {
    hex.map(|s| hex::decode(s.trim())).transpose()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
