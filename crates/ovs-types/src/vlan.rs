//! Access VLAN tag for bridge ports.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q tag applied to an access port.
///
/// Tag 0 means the port is untagged (trunk of the default VLAN), which is
/// how a port is created when no segmentation id has been assigned.
/// Valid tagged range is 1-4094.
///
/// # Examples
///
/// ```
/// use ovs_types::VlanTag;
///
/// assert!(VlanTag::UNTAGGED.is_untagged());
/// assert_eq!(VlanTag::new(100).unwrap().as_u16(), 100);
/// assert!(VlanTag::new(4095).is_err());
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanTag(u16);

impl VlanTag {
    /// Maximum valid tag.
    pub const MAX: u16 = 4094;

    /// No tag.
    pub const UNTAGGED: VlanTag = VlanTag(0);

    /// Creates a new VLAN tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is above 4094.
    pub const fn new(tag: u16) -> Result<Self, ParseError> {
        if tag <= Self::MAX {
            Ok(VlanTag(tag))
        } else {
            Err(ParseError::InvalidVlanTag(tag as u32))
        }
    }

    /// Returns the tag as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns true if no tag is applied.
    pub const fn is_untagged(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VlanTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanTag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag: u32 = s.parse().map_err(|_| ParseError::InvalidVlanTag(0))?;
        let tag = u16::try_from(tag).map_err(|_| ParseError::InvalidVlanTag(tag))?;
        VlanTag::new(tag)
    }
}

impl TryFrom<u16> for VlanTag {
    type Error = ParseError;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        VlanTag::new(tag)
    }
}

impl From<VlanTag> for u16 {
    fn from(tag: VlanTag) -> u16 {
        tag.0
    }
}
