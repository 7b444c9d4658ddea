//! Host-side infrastructure for the OVS bridge driver.
//!
//! - [`shell`]: shell command execution with proper quoting
//! - [`host`]: the [`HostNetwork`] capability trait and its `ip(8)` implementation
//! - [`route`]: `/proc/net/route` parsing
//! - [`error`]: error types for host operations
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | links, addresses, routes | `/sbin/ip` via [`shell::exec_or_throw()`] |
//! | sysctl | direct reads/writes under `/proc/sys` |
//! | default gateway | [`route::parse_route_table()`] |
//! | OVS fallback | `ovs-vsctl` via [`shell::OVS_VSCTL_CMD`] |

pub mod error;
pub mod host;
pub mod route;
pub mod shell;

pub use error::{CfgMgrError, CfgMgrResult};
pub use host::{choose_host_uplink, HostNetwork, HostUplink, IpCommandHost, Link, Route};
pub use route::DefaultRoute;
