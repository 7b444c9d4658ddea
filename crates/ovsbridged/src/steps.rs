//! Concrete bridge setup steps

use async_trait::async_trait;
use ovs_cfgmgr_common::{choose_host_uplink, HostNetwork, Link};
use ovs_ovsdb::OvsdbError;
use ovs_types::MacAddress;
use tracing::{debug, info, warn};

use crate::commands::{CommandEnv, CommandManager, HostCommand};
use crate::config::DEFAULT_BRIDGE_NAME;
use crate::error::{ProvisionError, Result};
use crate::setup::{SetupContext, SetupStep};

const OSRELEASE_KEY: &str = "kernel/osrelease";
const IP_FORWARD_KEY: &str = "net/ipv4/ip_forward";

/// Whether the running kernel lets an OVS bridge take an explicit
/// hardware address (3.3 and later).
pub fn kernel_supports_bridge_mac(release: &str) -> bool {
    let mut parts = release.trim().split('.').map(|p| {
        p.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse::<u32>()
            .ok()
    });
    match (parts.next().flatten(), parts.next().flatten()) {
        (Some(major), Some(minor)) => major > 3 || (major == 3 && minor >= 3),
        (Some(major), None) => major > 3,
        _ => false,
    }
}

/// Enables IPv4 forwarding on the host.
pub async fn setup_ip_forwarding(host: &dyn HostNetwork) -> Result<()> {
    let current = host.read_sysctl(IP_FORWARD_KEY).await.unwrap_or_default();
    if current.trim() == "1" {
        debug!("IPv4 forwarding already enabled");
        return Ok(());
    }
    host.write_sysctl(IP_FORWARD_KEY, "1").await?;
    info!("Enabled IPv4 forwarding");
    Ok(())
}

async fn resolve_link(host: &dyn HostNetwork, name: &str) -> Result<Link> {
    host.link_by_name(name)
        .await?
        .ok_or_else(|| ProvisionError::InterfaceNotFound(name.to_string()))
}

/// Creates the OVS bridge, falling back to `ovs-vsctl add-br`.
pub struct SetupDevice;

#[async_trait]
impl SetupStep for SetupDevice {
    fn name(&self) -> &'static str {
        "setup-device"
    }

    async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()> {
        let bridge = ctx.bridge_name();
        if ctx.network.default_bridge && bridge != DEFAULT_BRIDGE_NAME {
            return Err(ProvisionError::NonDefaultBridge {
                name: bridge.to_string(),
                expected: DEFAULT_BRIDGE_NAME.to_string(),
            });
        }

        let set_mac = match ctx.host.read_sysctl(OSRELEASE_KEY).await {
            Ok(release) => kernel_supports_bridge_mac(&release),
            Err(e) => {
                warn!(error = %e, "Cannot read kernel release, leaving bridge MAC to the kernel");
                false
            }
        };

        match ctx.ovsdb.create_bridge(bridge, set_mac).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(bridge = %bridge, "Bridge already exists");
                Ok(())
            }
            Err(e) => {
                warn!(bridge = %bridge, error = %e, "Native bridge create failed, falling back to ovs-vsctl");
                ctx.ovsdb
                    .vsctl()
                    .add_br(bridge, set_mac.then(MacAddress::random))
                    .await
                    .map_err(OvsdbError::Fallback)?;
                Ok(())
            }
        }
    }
}

/// Fails unless the bridge device is present on the host.
pub struct VerifyInterface;

#[async_trait]
impl SetupStep for VerifyInterface {
    fn name(&self) -> &'static str {
        "verify-interface"
    }

    async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()> {
        resolve_link(ctx.host, ctx.bridge_name()).await?;
        Ok(())
    }
}

/// Lets 127/8 traffic be routed through the bridge (`route_localnet`).
pub struct LoopbackAddressRouting;

#[async_trait]
impl SetupStep for LoopbackAddressRouting {
    fn name(&self) -> &'static str {
        "loopback-address-routing"
    }

    async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()> {
        let key = format!("net/ipv4/conf/{}/route_localnet", ctx.bridge_name());
        let current = ctx.host.read_sysctl(&key).await?;
        if current.starts_with('1') {
            return Ok(());
        }
        ctx.host.write_sysctl(&key, "1").await?;
        Ok(())
    }
}

/// Brings the bridge up and applies the configured MTU.
pub struct DeviceUp;

#[async_trait]
impl SetupStep for DeviceUp {
    fn name(&self) -> &'static str {
        "device-up"
    }

    async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()> {
        let link = resolve_link(ctx.host, ctx.bridge_name()).await?;
        ctx.host.link_set_up(&link).await?;

        let mtu = ctx.network.mtu;
        if mtu != 0 && link.mtu != mtu {
            ctx.host.link_set_mtu(&link, mtu).await?;
        }
        Ok(())
    }
}

/// Moves the host uplink's address and default route onto the bridge and
/// enslaves the uplink to it.
///
/// Runs as one [`CommandManager`] pipeline so a failure part way leaves the
/// host as it was, as far as the undo actions can manage.
pub struct AttachNic;

#[async_trait]
impl SetupStep for AttachNic {
    fn name(&self) -> &'static str {
        "attach-nic"
    }

    async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()> {
        let bridge = ctx.bridge_name();
        let uplink = choose_host_uplink(ctx.host)
            .await?
            .ok_or(ProvisionError::NoHostInterface)?;
        let nic = uplink.link.name.as_str();
        if nic == bridge {
            debug!(bridge = %bridge, "Default route already on the bridge");
            return Ok(());
        }

        info!(bridge = %bridge, nic = %nic, address = %uplink.address,
            gateway = ?uplink.gateway, "Attaching host interface to bridge");

        let mut cm = CommandManager::new();
        cm.add_command(HostCommand::add_address(bridge, uplink.address))?;
        cm.add_command(HostCommand::remove_address(nic, uplink.address))?;
        cm.add_command(HostCommand::attach_interface(bridge, nic))?;
        // picked without a routing table: no default route to move
        if let Some(gateway) = uplink.gateway {
            cm.add_command(HostCommand::delete_route(nic, gateway))?;
            cm.add_command(HostCommand::add_route(bridge, nic, gateway))?;
        }

        let env = CommandEnv::new(ctx.host, ctx.ovsdb).with_retry_interval(ctx.stale_route_retry_interval);
        cm.execute(&env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use ovs_cfgmgr_test::{uplink_address, uplink_host, FakeHost, FakeOvsdb, UPLINK};
    use ovs_ovsdb::{Vsctl, BRIDGE_TABLE};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn network(name: &str) -> NetworkConfig {
        NetworkConfig {
            bridge_name: name.to_string(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn test_kernel_supports_bridge_mac() {
        assert!(kernel_supports_bridge_mac("5.15.0-91-generic"));
        assert!(kernel_supports_bridge_mac("3.3.0"));
        assert!(kernel_supports_bridge_mac("3.10.0-1160.el7.x86_64\n"));
        assert!(kernel_supports_bridge_mac("4"));
        assert!(!kernel_supports_bridge_mac("3.2.0-4-amd64"));
        assert!(!kernel_supports_bridge_mac("2.6.32"));
        assert!(!kernel_supports_bridge_mac("garbage"));
    }

    #[tokio::test]
    async fn test_ip_forwarding_written_once() {
        let host = uplink_host();
        setup_ip_forwarding(&host).await.unwrap();
        setup_ip_forwarding(&host).await.unwrap();
        assert_eq!(host.sysctl(IP_FORWARD_KEY).as_deref(), Some("1"));
        assert_eq!(host.calls(), vec!["write_sysctl net/ipv4/ip_forward=1"]);
    }

    #[tokio::test]
    async fn test_setup_device_rejects_renamed_default_bridge() {
        let ovsdb = FakeOvsdb::new().client().await;
        let host = FakeHost::new();
        let mut net = network("ovs9");
        net.default_bridge = true;

        let err = SetupDevice
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NonDefaultBridge { ref name, .. } if name == "ovs9"));
    }

    #[tokio::test]
    async fn test_setup_device_sets_mac_on_new_kernel_and_tolerates_existing() {
        let host = uplink_host();
        let server = FakeOvsdb::with_host(host.clone());
        let ovsdb = server.client().await;
        let net = network("br0");
        let ctx = SetupContext::new(&ovsdb, &host, &net);

        SetupDevice.apply(&ctx).await.unwrap();
        let (_, row) = server.row_by_name(BRIDGE_TABLE, "br0").unwrap();
        assert!(row.get("other_config").and_then(|d| d.map_get("hwaddr")).is_some());
        assert!(host.link("br0").is_some());

        // second run hits BridgeAlreadyExists, which is fine
        assert_ok!(SetupDevice.apply(&ctx).await);
    }

    #[tokio::test]
    async fn test_setup_device_old_kernel_leaves_mac_alone() {
        let host = uplink_host();
        host.set_sysctl(OSRELEASE_KEY, "3.2.0-4-amd64");
        let server = FakeOvsdb::with_host(host.clone());
        let ovsdb = server.client().await;
        let net = network("br0");

        SetupDevice
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap();
        let (_, row) = server.row_by_name(BRIDGE_TABLE, "br0").unwrap();
        assert!(row.get("other_config").and_then(|d| d.map_get("hwaddr")).is_none());
    }

    #[tokio::test]
    async fn test_setup_device_falls_back_to_vsctl() {
        let host = uplink_host();
        let server = FakeOvsdb::with_host(host.clone());
        server.fail_op("insert", BRIDGE_TABLE);
        let net = network("br0");

        // "false" as vsctl: both paths fail, the fallback error surfaces
        let ovsdb = server.client().await;
        let err = SetupDevice
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Ovsdb(OvsdbError::Fallback(_))));

        let ovsdb = server.client_with_vsctl(Vsctl::new("true")).await;
        SetupDevice
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_interface() {
        let ovsdb = FakeOvsdb::new().client().await;
        let host = uplink_host();
        let net = network("br0");
        let ctx = SetupContext::new(&ovsdb, &host, &net);

        assert!(matches!(
            VerifyInterface.apply(&ctx).await,
            Err(ProvisionError::InterfaceNotFound(ref n)) if n == "br0"
        ));
        host.add_down_link("br0");
        assert_ok!(VerifyInterface.apply(&ctx).await);
    }

    #[tokio::test]
    async fn test_loopback_routing_written_only_when_off() {
        let ovsdb = FakeOvsdb::new().client().await;
        let host = uplink_host();
        let net = network("br0");
        let ctx = SetupContext::new(&ovsdb, &host, &net);
        let key = "net/ipv4/conf/br0/route_localnet";

        host.set_sysctl(key, "0\n");
        LoopbackAddressRouting.apply(&ctx).await.unwrap();
        assert_eq!(host.sysctl(key).as_deref(), Some("1"));

        LoopbackAddressRouting.apply(&ctx).await.unwrap();
        assert_eq!(host.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_device_up_applies_mtu() {
        let ovsdb = FakeOvsdb::new().client().await;
        let host = uplink_host();
        host.add_down_link("br0");
        let mut net = network("br0");
        net.mtu = 9000;

        DeviceUp
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap();
        let link = host.link("br0").unwrap();
        assert!(link.up);
        assert_eq!(link.mtu, 9000);
        assert_eq!(host.calls(), vec!["link_set_up br0", "link_set_mtu br0 9000"]);
    }

    #[tokio::test]
    async fn test_device_up_skips_zero_mtu() {
        let ovsdb = FakeOvsdb::new().client().await;
        let host = uplink_host();
        host.add_down_link("br0");
        let net = network("br0");

        DeviceUp
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap();
        assert_eq!(host.calls(), vec!["link_set_up br0"]);
    }

    #[tokio::test]
    async fn test_attach_nic_without_uplink() {
        let ovsdb = FakeOvsdb::new().client().await;
        let host = FakeHost::new();
        let net = network("br0");

        let err = AttachNic
            .apply(&SetupContext::new(&ovsdb, &host, &net))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NoHostInterface));
    }

    #[tokio::test]
    async fn test_attach_nic_moves_uplink() {
        let host = uplink_host();
        let server = FakeOvsdb::with_host(host.clone());
        let ovsdb = server.client().await;
        ovsdb.create_bridge("br0", false).await.unwrap();
        let br0 = host.link("br0").unwrap();
        host.link_set_up(&br0).await.unwrap();

        let net = network("br0");
        let ctx = SetupContext::new(&ovsdb, &host, &net).with_retry_interval(Duration::ZERO);
        AttachNic.apply(&ctx).await.unwrap();

        assert_eq!(host.addresses("br0"), vec![uplink_address()]);
        assert!(host.addresses(UPLINK).is_empty());
        assert!(ovsdb.port_exists(UPLINK).await.unwrap());
        let routes = host.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].device, "br0");

        // the default route now sits on the bridge; nothing left to move
        let before = host.calls().len();
        AttachNic.apply(&ctx).await.unwrap();
        assert_eq!(host.calls().len(), before);
    }

    #[tokio::test]
    async fn test_attach_nic_without_route_table_leaves_routes() {
        let host = uplink_host();
        host.hide_route_table();
        let server = FakeOvsdb::with_host(host.clone());
        let ovsdb = server.client().await;
        ovsdb.create_bridge("br0", false).await.unwrap();
        let br0 = host.link("br0").unwrap();
        host.link_set_up(&br0).await.unwrap();

        let net = network("br0");
        let ctx = SetupContext::new(&ovsdb, &host, &net).with_retry_interval(Duration::ZERO);
        AttachNic.apply(&ctx).await.unwrap();

        assert_eq!(host.addresses("br0"), vec![uplink_address()]);
        assert!(ovsdb.port_exists(UPLINK).await.unwrap());
        assert_eq!(host.routes().len(), 1);
        assert_eq!(host.routes()[0].device, UPLINK);
        assert!(!host.calls().iter().any(|c| c.starts_with("route_")));
    }
}
