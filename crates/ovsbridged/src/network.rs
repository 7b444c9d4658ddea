//! Bridge network lifecycle
//!
//! [`BridgeDriver`] owns the OVSDB client and the host handle and turns a
//! [`NetworkConfig`] into a setup plan, or tears the bridge down again.

use std::sync::Arc;
use std::time::Duration;

use ovs_cfgmgr_common::HostNetwork;
use ovs_ovsdb::{OvsdbClient, OvsdbError, PortKind, TableCache, BRIDGE_TABLE, PORT_TABLE};
use ovs_types::VlanTag;
use tracing::{info, instrument, warn};

use crate::commands::STALE_ROUTE_RETRY_INTERVAL;
use crate::config::{BridgedConfig, DriverConfig, NetworkConfig};
use crate::error::{ProvisionError, Result};
use crate::setup::{BridgeSetup, SetupContext};
use crate::steps::{setup_ip_forwarding, AttachNic, DeviceUp, LoopbackAddressRouting, SetupDevice, VerifyInterface};

/// Builds the bring-up plan for `network`.
///
/// `pre_existing` is whether the bridge device was already on the host;
/// an existing bridge is neither created nor given the host uplink again.
pub fn plan_network(pre_existing: bool, driver: &DriverConfig, network: &NetworkConfig) -> BridgeSetup {
    let mut plan = BridgeSetup::new();
    if !pre_existing {
        plan.queue_step(SetupDevice);
    }
    plan.queue_step(VerifyInterface);
    if !driver.enable_userland_proxy {
        plan.queue_step(LoopbackAddressRouting);
    }
    plan.queue_step(DeviceUp);
    if !pre_existing && network.attach_nic {
        plan.queue_step(AttachNic);
    }
    plan
}

/// One bridge as seen in the table cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSummary {
    pub name: String,
    pub ports: Vec<String>,
}

/// Bridges and their port names from the cache, sorted by name.
pub fn bridge_summaries(cache: &TableCache) -> Vec<BridgeSummary> {
    let mut bridges: Vec<BridgeSummary> = cache
        .find_all(BRIDGE_TABLE, |_| true)
        .into_iter()
        .filter_map(|(_, row)| {
            let name = row.name()?.to_string();
            let mut ports: Vec<String> = row
                .get("ports")
                .map(|d| d.uuids())
                .unwrap_or_default()
                .iter()
                .filter_map(|uuid| cache.get(PORT_TABLE, uuid))
                .filter_map(|port| port.name().map(str::to_string))
                .collect();
            ports.sort();
            Some(BridgeSummary { name, ports })
        })
        .collect();
    bridges.sort_by(|a, b| a.name.cmp(&b.name));
    bridges
}

pub struct BridgeDriver {
    ovsdb: OvsdbClient,
    host: Arc<dyn HostNetwork>,
    config: DriverConfig,
    stale_route_retry_interval: Duration,
}

impl BridgeDriver {
    pub fn new(ovsdb: OvsdbClient, host: Arc<dyn HostNetwork>, config: DriverConfig) -> Self {
        Self {
            ovsdb,
            host,
            config,
            stale_route_retry_interval: STALE_ROUTE_RETRY_INTERVAL,
        }
    }

    /// Enables IP forwarding if configured, then connects to OVSDB.
    pub async fn init(config: &BridgedConfig, host: Arc<dyn HostNetwork>) -> Result<Self> {
        if config.driver.enable_ip_forwarding {
            setup_ip_forwarding(host.as_ref()).await?;
        }
        let ovsdb = OvsdbClient::connect(&config.ovsdb).await?;
        Ok(Self::new(ovsdb, host, config.driver.clone()))
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.stale_route_retry_interval = interval;
        self
    }

    pub fn ovsdb(&self) -> &OvsdbClient {
        &self.ovsdb
    }

    /// Brings up the bridge for `network`.
    #[instrument(skip_all, fields(bridge = %network.bridge_name))]
    pub async fn create_network(&self, network: &NetworkConfig) -> Result<()> {
        let pre_existing = self
            .host
            .link_by_name(&network.bridge_name)
            .await?
            .is_some();
        let plan = plan_network(pre_existing, &self.config, network);
        info!(pre_existing, steps = ?plan.step_names(), "Setting up bridge network");

        let ctx = SetupContext::new(&self.ovsdb, self.host.as_ref(), network)
            .with_retry_interval(self.stale_route_retry_interval);
        plan.apply(&ctx).await
    }

    /// Removes the bridge for `network`. A bridge that is already gone
    /// counts as removed.
    #[instrument(skip_all, fields(bridge = %network.bridge_name))]
    pub async fn delete_network(&self, network: &NetworkConfig) -> Result<()> {
        if network.default_bridge {
            return Err(ProvisionError::DefaultBridgeProtected(
                network.bridge_name.clone(),
            ));
        }
        match self.ovsdb.remove_bridge(&network.bridge_name).await {
            Err(OvsdbError::BridgeNotExists(name)) => {
                info!(bridge = %name, "Bridge already removed");
                Ok(())
            }
            other => other.map_err(ProvisionError::from),
        }
    }

    /// Adds `port` to `bridge`. When the native transaction fails for any
    /// reason but a lost connection, `ovs-vsctl add-port` is tried instead.
    #[instrument(skip(self))]
    pub async fn add_port(&self, bridge: &str, port: &str, kind: PortKind, tag: VlanTag) -> Result<()> {
        match self.ovsdb.add_port(bridge, port, kind, tag).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_error() => Err(e.into()),
            Err(e) => {
                warn!(bridge = %bridge, port = %port, error = %e,
                    "Native add-port failed, falling back to ovs-vsctl");
                self.ovsdb
                    .vsctl()
                    .add_typed_port(bridge, port, kind, tag)
                    .await
                    .map_err(|e| OvsdbError::Fallback(e).into())
            }
        }
    }

    /// Removes `port` from `bridge`, falling back to
    /// `ovs-vsctl --if-exists del-port` like [`add_port`](Self::add_port).
    #[instrument(skip(self))]
    pub async fn delete_port(&self, bridge: &str, port: &str) -> Result<()> {
        match self.ovsdb.delete_port(bridge, port).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_error() => Err(e.into()),
            Err(e) => {
                warn!(bridge = %bridge, port = %port, error = %e,
                    "Native del-port failed, falling back to ovs-vsctl");
                self.ovsdb
                    .vsctl()
                    .del_port(bridge, port)
                    .await
                    .map_err(|e| OvsdbError::Fallback(e).into())
            }
        }
    }

    pub fn bridges(&self) -> Vec<BridgeSummary> {
        bridge_summaries(self.ovsdb.cache())
    }

    pub async fn shutdown(&self) {
        self.ovsdb.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovs_cfgmgr_test::{uplink_host, FakeOvsdb};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plan_for_new_bridge() {
        let plan = plan_network(false, &DriverConfig::default(), &NetworkConfig::default());
        assert_eq!(
            plan.step_names(),
            vec!["setup-device", "verify-interface", "loopback-address-routing", "device-up", "attach-nic"]
        );
    }

    #[test]
    fn test_plan_for_existing_bridge_with_userland_proxy() {
        let driver = DriverConfig {
            enable_userland_proxy: true,
            ..DriverConfig::default()
        };
        let plan = plan_network(true, &driver, &NetworkConfig::default());
        assert_eq!(plan.step_names(), vec!["verify-interface", "device-up"]);
    }

    #[test]
    fn test_plan_without_nic_attach() {
        let network = NetworkConfig {
            attach_nic: false,
            ..NetworkConfig::default()
        };
        let plan = plan_network(false, &DriverConfig::default(), &network);
        assert!(!plan.step_names().contains(&"attach-nic"));
    }

    #[tokio::test]
    async fn test_delete_default_network_rejected() {
        let ovsdb = FakeOvsdb::new().client().await;
        let driver = BridgeDriver::new(ovsdb, Arc::new(uplink_host()), DriverConfig::default());
        let network = NetworkConfig {
            default_bridge: true,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            driver.delete_network(&network).await,
            Err(ProvisionError::DefaultBridgeProtected(ref n)) if n == "ovs0"
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_network_is_ok() {
        let ovsdb = FakeOvsdb::new().client().await;
        let driver = BridgeDriver::new(ovsdb, Arc::new(uplink_host()), DriverConfig::default());
        let network = NetworkConfig {
            bridge_name: "br-gone".to_string(),
            ..NetworkConfig::default()
        };
        driver.delete_network(&network).await.unwrap();
    }
}
