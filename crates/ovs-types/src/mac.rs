//! Ethernet hardware addresses as OVSDB stores them in `other_config:hwaddr`.

use crate::ParseError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Six-octet hardware address, written as colon separated lowercase hex.
///
/// ```
/// use ovs_types::MacAddress;
///
/// let mac: MacAddress = "02:42:AC:11:00:02".parse().unwrap();
/// assert_eq!(mac.to_string(), "02:42:ac:11:00:02");
/// assert!(mac.is_local());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

const MULTICAST_BIT: u8 = 0x01;
const LOCAL_BIT: u8 = 0x02;

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }

    /// Random locally administered unicast address for a new bridge, so the
    /// bridge does not take the address of whichever port joins first.
    pub fn random() -> Self {
        let mut octets: [u8; 6] = rand::thread_rng().gen();
        octets[0] = (octets[0] & !MULTICAST_BIT) | LOCAL_BIT;
        MacAddress(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub const fn is_multicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT == MULTICAST_BIT
    }

    pub const fn is_local(&self) -> bool {
        self.0[0] & LOCAL_BIT == LOCAL_BIT
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    /// Accepts exactly six colon separated pairs of hex digits, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidMacAddress(s.to_string());

        let mut octets = [0u8; 6];
        let mut groups = s.split(':');
        for slot in octets.iter_mut() {
            let group = groups
                .next()
                .filter(|g| g.len() == 2 && g.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or_else(invalid)?;
            *slot = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }
        if groups.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddress(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hwaddr_case_is_normalised() {
        let mac: MacAddress = "0A:1b:2C:3d:4E:5f".parse().unwrap();
        assert_eq!(mac.octets(), [0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]);
        assert_eq!(mac.to_string(), "0a:1b:2c:3d:4e:5f");
    }

    #[test]
    fn test_bridge_hwaddr_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddress::random();
            assert!(mac.is_local(), "{}", mac);
            assert!(!mac.is_multicast(), "{}", mac);
            assert_eq!(mac.to_string().parse::<MacAddress>().unwrap(), mac);
        }
    }

    #[test]
    fn test_group_bits() {
        let mac = MacAddress::new([0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb]);
        assert!(mac.is_multicast());
        assert!(!mac.is_local());
    }

    #[test]
    fn test_rejects_malformed_hwaddr() {
        for bad in [
            "",
            "02:42:ac:11:00",
            "02:42:ac:11:00:02:03",
            "02-42-ac-11-00-02",
            "2:42:ac:11:00:02",
            "zz:42:ac:11:00:02",
            "02:42:ac:11:00:+2",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_serde_uses_text_form() {
        let mac = MacAddress::new([0x02, 0, 0, 0, 0, 0x01]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"02:00:00:00:00:01\"");
        assert_eq!(serde_json::from_str::<MacAddress>(&json).unwrap(), mac);
    }
}
