//! Switch, port and link identifiers for the fabric graph.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Datapath identifier of a switch.
///
/// Displayed as eight colon-separated octets. Parsing also accepts a plain
/// decimal or `0x` hex number.
///
/// ```
/// use sonic_fabric_types::SwitchId;
///
/// let sw = SwitchId::new(1);
/// assert_eq!(sw.to_string(), "00:00:00:00:00:00:00:01");
/// assert_eq!("0x1".parse::<SwitchId>().unwrap(), sw);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SwitchId(u64);

impl SwitchId {
    pub const fn new(dpid: u64) -> Self {
        SwitchId(dpid)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for SwitchId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidSwitchId(s.to_string());

        if s.contains(':') {
            let mut value = 0u64;
            let mut octets = 0;
            for part in s.split(':') {
                if part.is_empty() || part.len() > 2 {
                    return Err(invalid());
                }
                let octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
                value = (value << 8) | u64::from(octet);
                octets += 1;
            }
            if octets != 8 {
                return Err(invalid());
            }
            return Ok(SwitchId(value));
        }

        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed.map(SwitchId).map_err(|_| invalid())
    }
}

impl TryFrom<String> for SwitchId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SwitchId> for String {
    fn from(id: SwitchId) -> String {
        id.to_string()
    }
}

/// Port number local to one switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(u16);

impl PortId {
    pub const fn new(port: u16) -> Self {
        PortId(port)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PortId {
    fn from(port: u16) -> Self {
        PortId(port)
    }
}

/// A (switch, port) pair: where a probe entered a switch, or one end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hop {
    pub switch: SwitchId,
    pub port: PortId,
}

impl Hop {
    pub const fn new(switch: SwitchId, port: PortId) -> Self {
        Hop { switch, port }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.switch, self.port)
    }
}

/// A link between two switch ports. Links are treated as undirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub src: Hop,
    pub dst: Hop,
}

impl Link {
    pub const fn new(src: Hop, dst: Hop) -> Self {
        Link { src, dst }
    }

    /// True when both ends sit on the same switch.
    pub fn is_self_loop(&self) -> bool {
        self.src.switch == self.dst.switch
    }

    pub fn touches(&self, switch: SwitchId) -> bool {
        self.src.switch == switch || self.dst.switch == switch
    }

    /// Returns the far end of the link as seen from `switch`.
    ///
    /// `None` when the link does not touch `switch` or loops back to it.
    pub fn peer_of(&self, switch: SwitchId) -> Option<Hop> {
        if self.is_self_loop() {
            None
        } else if self.src.switch == switch {
            Some(self.dst)
        } else if self.dst.switch == switch {
            Some(self.src)
        } else {
            None
        }
    }

    /// Returns the far end when `hop` is one of the link's ends.
    pub fn opposite(&self, hop: Hop) -> Option<Hop> {
        if self.src == hop {
            Some(self.dst)
        } else if self.dst == hop {
            Some(self.src)
        } else {
            None
        }
    }

    /// Same link regardless of which end is called `src`.
    pub fn same_as(&self, other: &Link) -> bool {
        self == other || (self.src == other.dst && self.dst == other.src)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.src, self.dst)
    }
}
