//! Configuration file support for ovsbridged
//!
//! Loads and validates the daemon configuration from TOML.
//! Default location: /etc/ovsbridged/ovsbridged.toml

use crate::error::{ProvisionError, Result};
use ovs_ovsdb::OvsdbConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ovsbridged/ovsbridged.toml";

/// Bridge name used by the default-bridge network.
pub const DEFAULT_BRIDGE_NAME: &str = "ovs0";

/// Largest MTU accepted for the bridge device.
const MAX_MTU: u32 = 65535;
/// Smallest non-zero MTU accepted (IPv4 minimum).
const MIN_MTU: u32 = 68;

/// Driver-wide switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Write `net.ipv4.ip_forward=1` at startup
    #[serde(default = "default_enable_ip_forwarding")]
    pub enable_ip_forwarding: bool,

    /// When set, loopback-address routing is left alone on the bridge
    #[serde(default)]
    pub enable_userland_proxy: bool,
}

/// One bridge network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network identifier; derives the bridge name when none is given
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,

    /// Bridge MTU; 0 leaves the kernel default
    #[serde(default)]
    pub mtu: u32,

    /// This network owns the default bridge; it cannot be deleted
    #[serde(default)]
    pub default_bridge: bool,

    /// Move the host uplink (address, default route) onto a newly created bridge
    #[serde(default = "default_attach_nic")]
    pub attach_nic: bool,
}

fn default_enable_ip_forwarding() -> bool {
    true
}

fn default_bridge_name() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}

fn default_attach_nic() -> bool {
    true
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enable_ip_forwarding: default_enable_ip_forwarding(),
            enable_userland_proxy: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            bridge_name: default_bridge_name(),
            mtu: 0,
            default_bridge: false,
            attach_nic: default_attach_nic(),
        }
    }
}

impl NetworkConfig {
    /// Fills in a bridge name for a non-default network configured
    /// without one: `br-` plus the first 12 characters of the id.
    pub fn resolve_bridge_name(&mut self) {
        if self.bridge_name.is_empty() && !self.default_bridge {
            let prefix: String = self.id.chars().take(12).collect();
            self.bridge_name = format!("br-{}", prefix);
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgedConfig {
    #[serde(default)]
    pub ovsdb: OvsdbConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

impl BridgedConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| ProvisionError::config(format!("Failed to parse config: {}", e)))?;
        config.network.resolve_bridge_name();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.ovsdb
            .endpoint()
            .map_err(|e| ProvisionError::config(format!("ovsdb.endpoint: {}", e)))?;

        if self.ovsdb.connect_attempts == 0 {
            return Err(ProvisionError::config(
                "ovsdb.connect_attempts must be > 0",
            ));
        }

        if self.ovsdb.root_wait_attempts == 0 {
            return Err(ProvisionError::config(
                "ovsdb.root_wait_attempts must be > 0",
            ));
        }

        if self.network.bridge_name.is_empty() {
            return Err(ProvisionError::config("network.bridge_name is empty"));
        }

        // IFNAMSIZ - 1
        if self.network.bridge_name.len() > 15 {
            return Err(ProvisionError::config(format!(
                "network.bridge_name {} is longer than 15 characters",
                self.network.bridge_name
            )));
        }

        let mtu = self.network.mtu;
        if mtu != 0 && !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(ProvisionError::config(format!(
                "network.mtu {} out of range {}-{}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }

        Ok(())
    }
}

/// Loads and validates the configuration at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<BridgedConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        ProvisionError::config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    BridgedConfig::from_toml(&content)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<BridgedConfig> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => BridgedConfig::from_toml(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            let config = BridgedConfig::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(ProvisionError::config(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}
