//! Integration test infrastructure for the OVS bridge driver
//!
//! Provides:
//! - [`FakeOvsdb`]: in-memory `ovsdb-server` implementing the client transport
//! - [`FakeHost`]: recording host network with per-call failure injection
//! - Fixtures for a typical single-uplink host

pub mod fake_host;
pub mod fake_ovsdb;
pub mod fixtures;

pub use fake_host::FakeHost;
pub use fake_ovsdb::FakeOvsdb;
pub use fixtures::*;
