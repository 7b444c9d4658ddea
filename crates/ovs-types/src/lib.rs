//! Value types for OVS bridge provisioning.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses, including random
//!   locally administered addresses for bridge interfaces
//! - [`InterfaceAddress`]: an address assigned to an interface, in CIDR form
//! - [`VlanTag`]: an access VLAN tag for a bridge port (0 means untagged)

mod addr;
mod mac;
mod vlan;

pub use addr::InterfaceAddress;
pub use mac::MacAddress;
pub use vlan::VlanTag;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid interface address: {0}")]
    InvalidInterfaceAddress(String),

    #[error("invalid VLAN tag: {0} (must be 0-4094)")]
    InvalidVlanTag(u32),
}
