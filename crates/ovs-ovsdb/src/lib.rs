//! OVSDB client for the bridge provisioning daemon.
//!
//! Speaks RFC 7047 JSON-RPC to `ovsdb-server`, mirrors the `Open_vSwitch`,
//! `Bridge`, `Port` and `Interface` tables into a local [`TableCache`], and
//! exposes bridge/port operations as atomic transactions.
//!
//! # Architecture
//!
//! ```text
//! OvsdbClient ──transact──▶ Transport (JsonRpcTransport | test double)
//!      │                        │
//!      │                  update notifications
//!      ▼                        ▼
//!  bridge ops             listener task ──apply──▶ TableCache
//!      │
//!      └── on failure ──▶ Vsctl (ovs-vsctl)
//! ```
//!
//! The cache is advisory. Existence checks that decide an outcome are made
//! with a Select against the server.

pub mod bridge;
pub mod cache;
pub mod client;
pub mod error;
pub mod operation;
pub mod transport;
pub mod types;
pub mod vsctl;

pub use bridge::PortKind;
pub use cache::TableCache;
pub use client::{ClientOptions, OvsdbClient, OvsdbConfig};
pub use error::{OvsdbError, OvsdbResult};
pub use operation::{
    Condition, Mutation, Operation, OperationResult, Transaction, BRIDGE_TABLE, DATABASE,
    INTERFACE_TABLE, PORT_TABLE, ROOT_TABLE,
};
pub use transport::{Endpoint, JsonRpcTransport, Transport, UpdateReceiver};
pub use types::{Atom, Datum, Row, RowUpdate, TableUpdates};
pub use vsctl::Vsctl;
