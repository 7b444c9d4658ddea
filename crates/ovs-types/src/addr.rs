//! Interface address in CIDR notation.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An address assigned to a network interface, e.g. `10.10.101.92/24`.
///
/// Unlike a route prefix, the host bits are kept: this is exactly what
/// `ip addr add` and `ip addr del` take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceAddress {
    ip: IpAddr,
    prefix_len: u8,
}

impl InterfaceAddress {
    /// Creates a new interface address.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is larger than the address
    /// family allows.
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = if ip.is_ipv4() { 32 } else { 128 };
        if prefix_len > max_len {
            return Err(ParseError::InvalidInterfaceAddress(format!(
                "{}/{}",
                ip, prefix_len
            )));
        }
        Ok(Self { ip, prefix_len })
    }

    /// Returns the IP address.
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// Returns true for a global-scope IPv4 address: not loopback, not
    /// link-local and not unspecified.
    pub fn is_usable_ipv4(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl FromStr for InterfaceAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidInterfaceAddress(s.to_string()))?;
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| ParseError::InvalidInterfaceAddress(s.to_string()))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| ParseError::InvalidInterfaceAddress(s.to_string()))?;
        Self::new(ip, prefix_len)
    }
}

impl TryFrom<String> for InterfaceAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<InterfaceAddress> for String {
    fn from(addr: InterfaceAddress) -> String {
        addr.to_string()
    }
}
