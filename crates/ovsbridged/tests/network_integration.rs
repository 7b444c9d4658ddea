//! End-to-end bridge network provisioning
//!
//! Runs [`BridgeDriver`] against the in-memory OVSDB server wired to a
//! recording host, so bridge rows and host links move together the way
//! they do under `ovs-vswitchd`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ovs_bridged::{BridgeDriver, BridgeSummary, BridgedConfig, DriverConfig, NetworkConfig, ProvisionError};
use ovs_cfgmgr_common::Route;
use ovs_cfgmgr_test::{uplink_address, uplink_gateway, uplink_host, FakeHost, FakeOvsdb, UPLINK};
use ovs_ovsdb::{OvsdbError, PortKind, Vsctl, BRIDGE_TABLE, PORT_TABLE};
use ovs_types::VlanTag;
use pretty_assertions::assert_eq;

const BRIDGE: &str = "ovs0";

async fn driver_with(host: &FakeHost, config: DriverConfig) -> (Arc<FakeOvsdb>, BridgeDriver) {
    let server = FakeOvsdb::with_host(host.clone());
    let client = server.client().await;
    let driver = BridgeDriver::new(client, Arc::new(host.clone()), config).with_retry_interval(Duration::ZERO);
    (server, driver)
}

/// Driver whose `ovs-vsctl` fallback is `vsctl`, with ovs0 already created.
async fn driver_with_vsctl(vsctl: &str) -> (Arc<FakeOvsdb>, BridgeDriver) {
    let host = uplink_host();
    let server = FakeOvsdb::with_host(host.clone());
    let client = server.client_with_vsctl(Vsctl::new(vsctl)).await;
    client.create_bridge(BRIDGE, false).await.unwrap();
    let driver = BridgeDriver::new(client, Arc::new(host), DriverConfig::default());
    (server, driver)
}

fn uplink_route(device: &str) -> Route {
    Route::default_via(IpAddr::V4(uplink_gateway()), device)
}

/// Scenario:
/// 1. Host has eth0 with the default route, no bridge
/// 2. Create the network
/// 3. ovs0 exists, is up, holds eth0's address and the default route,
///    and has eth0 as a port
#[tokio::test]
async fn test_create_network_moves_uplink_onto_bridge() {
    let host = uplink_host();
    let (server, driver) = driver_with(&host, DriverConfig::default()).await;
    let network = NetworkConfig::default();

    driver.create_network(&network).await.unwrap();

    assert!(server.row_by_name(BRIDGE_TABLE, BRIDGE).is_some());
    let link = host.link(BRIDGE).unwrap();
    assert!(link.up);
    assert_eq!(host.addresses(BRIDGE), vec![uplink_address()]);
    assert!(host.addresses(UPLINK).is_empty());
    assert_eq!(host.routes(), vec![uplink_route(BRIDGE)]);
    assert_eq!(
        host.sysctl("net/ipv4/conf/ovs0/route_localnet").as_deref(),
        Some("1")
    );
    assert!(driver.ovsdb().port_exists(UPLINK).await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        driver.bridges(),
        vec![BridgeSummary {
            name: BRIDGE.to_string(),
            ports: vec![UPLINK.to_string(), BRIDGE.to_string()],
        }]
    );
}

#[tokio::test]
async fn test_create_network_again_only_refreshes_device() {
    let host = uplink_host();
    let (server, driver) = driver_with(&host, DriverConfig::default()).await;
    let network = NetworkConfig::default();
    driver.create_network(&network).await.unwrap();
    let transactions = server.transactions().len();
    let calls = host.calls().len();

    driver.create_network(&network).await.unwrap();

    // no bridge create, no uplink move: only the link is set up again
    assert_eq!(server.transactions().len(), transactions);
    assert_eq!(host.calls()[calls..].to_vec(), vec!["link_set_up ovs0".to_string()]);
}

/// Scenario:
/// 1. Adding the bridge default route fails
/// 2. Address move and port attachment are undone, newest first
/// 3. The host is back on eth0; the bridge itself stays
#[tokio::test]
async fn test_attach_failure_restores_uplink() {
    let host = uplink_host();
    host.fail_on("route_add ovs0");
    let (server, driver) = driver_with(&host, DriverConfig::default()).await;

    let err = driver
        .create_network(&NetworkConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Rollback { .. }), "{:?}", err);
    assert!(matches!(err.root_cause(), ProvisionError::Host(_)));
    assert!(err.undo_errors().is_empty(), "{:?}", err.undo_errors());

    assert_eq!(host.addresses(UPLINK), vec![uplink_address()]);
    assert!(host.addresses(BRIDGE).is_empty());
    assert_eq!(host.routes(), vec![uplink_route(UPLINK)]);
    assert!(!driver.ovsdb().port_exists(UPLINK).await.unwrap());
    assert!(server.row_by_name(BRIDGE_TABLE, BRIDGE).is_some());
}

#[tokio::test]
async fn test_undo_failure_keeps_forward_cause() {
    let host = uplink_host();
    host.fail_on("route_add ovs0");
    host.fail_on("addr_del ovs0");
    let (_server, driver) = driver_with(&host, DriverConfig::default()).await;

    let err = driver
        .create_network(&NetworkConfig::default())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("route_add ovs0"), "{}", err);
    assert_eq!(err.undo_errors().len(), 1);
    assert!(err.undo_errors()[0].to_string().contains("addr_del ovs0"));
    // later undo steps still ran
    assert_eq!(host.addresses(UPLINK), vec![uplink_address()]);
}

#[tokio::test]
async fn test_missing_uplink_aborts_after_device_up() {
    let host = FakeHost::new();
    host.set_sysctl("kernel/osrelease", "5.15.0");
    let (server, driver) = driver_with(&host, DriverConfig::default()).await;

    let err = driver
        .create_network(&NetworkConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::NoHostInterface));
    assert!(server.row_by_name(BRIDGE_TABLE, BRIDGE).is_some());
    assert!(host.link(BRIDGE).unwrap().up);
}

#[tokio::test]
async fn test_userland_proxy_leaves_route_localnet() {
    let host = uplink_host();
    let config = DriverConfig {
        enable_userland_proxy: true,
        ..DriverConfig::default()
    };
    let (_server, driver) = driver_with(&host, config).await;
    let network = NetworkConfig {
        attach_nic: false,
        ..NetworkConfig::default()
    };

    driver.create_network(&network).await.unwrap();

    assert_eq!(
        host.sysctl("net/ipv4/conf/ovs0/route_localnet").as_deref(),
        Some("0")
    );
    assert_eq!(host.addresses(UPLINK), vec![uplink_address()]);
}

#[tokio::test]
async fn test_delete_network_removes_bridge_and_device() {
    let host = uplink_host();
    let (server, driver) = driver_with(&host, DriverConfig::default()).await;
    let network = NetworkConfig {
        id: "4c1f0b8e2d9a7f3e6b5c".to_string(),
        bridge_name: "br-4c1f0b8e2d9a".to_string(),
        attach_nic: false,
        ..NetworkConfig::default()
    };

    driver.create_network(&network).await.unwrap();
    assert!(host.link("br-4c1f0b8e2d9a").is_some());

    driver.delete_network(&network).await.unwrap();
    assert!(server.row_by_name(BRIDGE_TABLE, "br-4c1f0b8e2d9a").is_none());
    assert!(host.link("br-4c1f0b8e2d9a").is_none());

    // a second teardown finds nothing and succeeds
    driver.delete_network(&network).await.unwrap();
}

#[tokio::test]
async fn test_init_enables_forwarding_then_fails_to_connect() {
    let host = uplink_host();
    let mut config = BridgedConfig::default();
    config.ovsdb.endpoint = "unix:/nonexistent/ovsbridged-test/db.sock".to_string();
    config.ovsdb.connect_attempts = 1;
    config.ovsdb.connect_retry_ms = 0;

    let err = match BridgeDriver::init(&config, Arc::new(host.clone())).await {
        Ok(_) => panic!("connect to a missing socket succeeded"),
        Err(e) => e,
    };

    assert!(matches!(err, ProvisionError::Ovsdb(OvsdbError::Connection { .. })), "{:?}", err);
    assert!(err.is_retryable());
    assert_eq!(host.sysctl("net/ipv4/ip_forward").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_add_port_falls_back_to_vsctl() {
    let (server, driver) = driver_with_vsctl("true").await;
    server.fail_op("insert", PORT_TABLE);

    driver
        .add_port(BRIDGE, "veth1", PortKind::System, VlanTag::UNTAGGED)
        .await
        .unwrap();
    // the stand-in tool leaves the database alone
    assert!(server.row_by_name(PORT_TABLE, "veth1").is_none());
}

#[tokio::test]
async fn test_add_port_fallback_failure_surfaces() {
    let (server, driver) = driver_with_vsctl("false").await;
    server.fail_op("insert", PORT_TABLE);

    let err = driver
        .add_port(BRIDGE, "veth1", PortKind::System, VlanTag::new(10).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Ovsdb(OvsdbError::Fallback(_))), "{:?}", err);
}

#[tokio::test]
async fn test_delete_port_falls_back_to_vsctl() {
    let (server, driver) = driver_with_vsctl("true").await;
    driver
        .add_port(BRIDGE, "veth1", PortKind::System, VlanTag::UNTAGGED)
        .await
        .unwrap();
    assert!(server.row_by_name(PORT_TABLE, "veth1").is_some());
    server.fail_op("delete", PORT_TABLE);

    driver.delete_port(BRIDGE, "veth1").await.unwrap();
    assert!(server.row_by_name(PORT_TABLE, "veth1").is_some());

    // unknown port: del-port --if-exists has nothing to do
    driver.delete_port(BRIDGE, "ghost").await.unwrap();
}

#[tokio::test]
async fn test_port_ops_do_not_fall_back_when_disconnected() {
    let (server, driver) = driver_with_vsctl("true").await;
    driver.shutdown().await;

    let err = driver
        .add_port(BRIDGE, "veth1", PortKind::System, VlanTag::UNTAGGED)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Ovsdb(ref e) if e.is_connection_error()), "{:?}", err);
    let err = driver.delete_port(BRIDGE, "veth1").await.unwrap_err();
    assert!(matches!(err, ProvisionError::Ovsdb(ref e) if e.is_connection_error()), "{:?}", err);
    assert!(server.row_by_name(PORT_TABLE, "veth1").is_none());
}
