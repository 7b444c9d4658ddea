//! Bridge and port operations on top of [`OvsdbClient`].

use std::net::IpAddr;

use ovs_types::{MacAddress, VlanTag};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::OvsdbClient;
use crate::error::{OvsdbError, OvsdbResult};
use crate::operation::{
    Condition, Mutation, Operation, Transaction, BRIDGE_TABLE, INTERFACE_TABLE, PORT_TABLE,
    ROOT_TABLE,
};
use crate::types::{Atom, Datum, Row};

const NAMED_INTERFACE: &str = "new_intf";
const NAMED_PORT: &str = "new_port";
const NAMED_BRIDGE: &str = "new_bridge";

/// OpenFlow versions enabled on every bridge this daemon creates.
pub const BRIDGE_PROTOCOLS: [&str; 4] = ["OpenFlow10", "OpenFlow11", "OpenFlow12", "OpenFlow13"];

/// Interface flavour of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// OVS-owned internal device.
    Internal,
    /// Existing kernel device, e.g. a veth end or a physical NIC.
    System,
    Vxlan { remote_ip: IpAddr },
}

impl PortKind {
    /// Value of the Interface `type` column.
    pub fn interface_type(&self) -> &'static str {
        match self {
            PortKind::Internal => "internal",
            PortKind::System => "",
            PortKind::Vxlan { .. } => "vxlan",
        }
    }
}

/// Interface + Port + Bridge inserts and the root `bridges` mutation.
pub fn create_bridge_transaction(name: &str, hwaddr: Option<MacAddress>, root: Uuid) -> Transaction {
    let interface = Row::new()
        .with("name", name)
        .with("type", PortKind::Internal.interface_type());

    let port = Row::new()
        .with("name", name)
        .with("interfaces", Atom::named(NAMED_INTERFACE));

    let mut bridge = Row::new()
        .with("name", name)
        .with("stp_enable", false)
        .with("protocols", Datum::set(BRIDGE_PROTOCOLS))
        .with("ports", Atom::named(NAMED_PORT));
    if let Some(mac) = hwaddr {
        bridge.insert("other_config", Datum::map([("hwaddr", mac.to_string())]));
    }

    Transaction::new()
        .with(Operation::insert(INTERFACE_TABLE, interface, NAMED_INTERFACE))
        .with(Operation::insert(PORT_TABLE, port, NAMED_PORT))
        .with(Operation::insert(BRIDGE_TABLE, bridge, NAMED_BRIDGE))
        .with(Operation::mutate(
            ROOT_TABLE,
            vec![Condition::uuid_is(root)],
            vec![Mutation::insert(
                "bridges",
                Datum::set([Atom::named(NAMED_BRIDGE)]),
            )],
        ))
}

/// Delete of the Bridge row plus removal from the root `bridges` set.
pub fn remove_bridge_transaction(name: &str, bridges: &[Uuid], root: Uuid) -> Transaction {
    Transaction::new()
        .with(Operation::delete(BRIDGE_TABLE, vec![Condition::name_is(name)]))
        .with(Operation::mutate(
            ROOT_TABLE,
            vec![Condition::uuid_is(root)],
            vec![Mutation::delete("bridges", Datum::set(bridges.iter().copied()))],
        ))
}

pub fn add_port_transaction(bridge: &str, port: &str, kind: PortKind, tag: VlanTag) -> Transaction {
    let mut interface = Row::new()
        .with("name", port)
        .with("type", kind.interface_type());
    if let PortKind::Vxlan { remote_ip } = kind {
        interface.insert("options", Datum::map([("remote_ip", remote_ip.to_string())]));
    }

    let mut port_row = Row::new()
        .with("name", port)
        .with("interfaces", Atom::named(NAMED_INTERFACE));
    if !tag.is_untagged() {
        port_row.insert("vlan_mode", "access");
        port_row.insert("tag", i64::from(tag.as_u16()));
    }

    Transaction::new()
        .with(Operation::insert(INTERFACE_TABLE, interface, NAMED_INTERFACE))
        .with(Operation::insert(PORT_TABLE, port_row, NAMED_PORT))
        .with(Operation::mutate(
            BRIDGE_TABLE,
            vec![Condition::name_is(bridge)],
            vec![Mutation::insert("ports", Datum::set([Atom::named(NAMED_PORT)]))],
        ))
}

pub fn delete_port_transaction(bridge: &str, port: &str, port_uuids: &[Uuid]) -> Transaction {
    Transaction::new()
        .with(Operation::delete(INTERFACE_TABLE, vec![Condition::name_is(port)]))
        .with(Operation::delete(PORT_TABLE, vec![Condition::name_is(port)]))
        .with(Operation::mutate(
            BRIDGE_TABLE,
            vec![Condition::name_is(bridge)],
            vec![Mutation::delete("ports", Datum::set(port_uuids.iter().copied()))],
        ))
}

impl OvsdbClient {
    pub async fn bridge_exists(&self, name: &str) -> OvsdbResult<bool> {
        self.exists(BRIDGE_TABLE, name).await
    }

    pub async fn port_exists(&self, name: &str) -> OvsdbResult<bool> {
        self.exists(PORT_TABLE, name).await
    }

    /// Creates bridge `name` with its internal port and interface.
    ///
    /// Fails with [`OvsdbError::BridgeAlreadyExists`] if a Bridge row of that
    /// name is already present, and with [`OvsdbError::PostCondition`] if the
    /// committed bridge is not returned by a follow-up Select.
    #[instrument(skip(self))]
    pub async fn create_bridge(&self, name: &str, random_mac: bool) -> OvsdbResult<()> {
        if self.bridge_exists(name).await? {
            return Err(OvsdbError::BridgeAlreadyExists(name.to_string()));
        }

        let hwaddr = random_mac.then(MacAddress::random);
        let txn = create_bridge_transaction(name, hwaddr, self.root_uuid()?);
        self.transact(&txn).await?;

        if !self.bridge_exists(name).await? {
            return Err(OvsdbError::post_condition("create bridge", name));
        }
        info!(bridge = name, hwaddr = ?hwaddr, "Created OVS bridge");
        Ok(())
    }

    /// Removes bridge `name`.
    ///
    /// The native transaction is tried first; if it is rejected the bridge is
    /// removed with `ovs-vsctl del-br` instead.
    #[instrument(skip(self))]
    pub async fn remove_bridge(&self, name: &str) -> OvsdbResult<()> {
        let bridges = self.select_uuids(BRIDGE_TABLE, name).await?;
        if bridges.is_empty() {
            return Err(OvsdbError::BridgeNotExists(name.to_string()));
        }

        let txn = remove_bridge_transaction(name, &bridges, self.root_uuid()?);
        if let Err(e) = self.transact(&txn).await {
            if e.is_connection_error() {
                return Err(e);
            }
            warn!(bridge = name, error = %e, "Native bridge delete failed, falling back to ovs-vsctl");
            self.vsctl().del_br(name).await?;
        }

        if self.bridge_exists(name).await? {
            return Err(OvsdbError::post_condition("remove bridge", name));
        }
        info!(bridge = name, "Removed OVS bridge");
        Ok(())
    }

    /// Adds `port` to `bridge`. A non-zero `tag` makes it an access port.
    #[instrument(skip(self))]
    pub async fn add_port(
        &self,
        bridge: &str,
        port: &str,
        kind: PortKind,
        tag: VlanTag,
    ) -> OvsdbResult<()> {
        let results = self
            .transact(&add_port_transaction(bridge, port, kind, tag))
            .await?;

        // A mutate matching no bridge commits the inserts as orphans, which
        // the server garbage-collects; surface it as a missing bridge.
        if results.get(2).and_then(|r| r.count) == Some(0) {
            return Err(OvsdbError::BridgeNotExists(bridge.to_string()));
        }
        debug!(bridge, port, kind = kind.interface_type(), tag = tag.as_u16(), "Added port");
        Ok(())
    }

    /// Removes `port` from `bridge` and deletes its Port and Interface rows.
    #[instrument(skip(self))]
    pub async fn delete_port(&self, bridge: &str, port: &str) -> OvsdbResult<()> {
        let uuids = match self.cache().find_uuid_by_name(PORT_TABLE, port) {
            Some(uuid) => vec![uuid],
            None => self.select_uuids(PORT_TABLE, port).await?,
        };
        if uuids.is_empty() {
            return Err(OvsdbError::PortNotExists(port.to_string()));
        }

        self.transact(&delete_port_transaction(bridge, port, &uuids))
            .await?;
        debug!(bridge, port, "Deleted port");
        Ok(())
    }
}
