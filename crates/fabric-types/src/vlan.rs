//! 802.1Q VLAN identifier carried by probe frames.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// VLAN identifier field of an 802.1Q header (0-4094).
///
/// VID 0 marks a priority-tagged frame, which is enough to carry the
/// priority bits a trace relies on. 4095 is reserved.
///
/// ```
/// use sonic_fabric_types::VlanId;
///
/// assert_eq!(VlanId::new(100).unwrap().as_u16(), 100);
/// assert!(VlanId::new(4095).is_err());
/// assert!(VlanId::from_wire(VlanId::UNTAGGED_WIRE).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    pub const MAX: u16 = 4094;

    /// Value management APIs use to say "no VLAN header".
    pub const UNTAGGED_WIRE: u16 = 0xffff;

    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}
