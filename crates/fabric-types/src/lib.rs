//! Fabric primitives shared by the path discovery daemon.
//!
//! - [`MacAddress`]: 48-bit Ethernet addresses identifying probe endpoints
//! - [`SwitchId`], [`PortId`], [`Hop`], [`Link`]: fabric graph vocabulary
//! - [`VlanId`] and [`Color`]: the 802.1Q context a probe travels in and the
//!   3-bit priority tag that carries the sender's color
//! - [`ProbePacket`]: the probe frame and its wire codec

mod fabric;
mod mac;
mod packet;
mod tag;
mod vlan;

pub use fabric::{Hop, Link, PortId, SwitchId};
pub use mac::MacAddress;
pub use packet::{peek_eth_dst, peek_tag, PacketError, ProbePacket};
pub use tag::{Color, MAX_COLOR, TAG_BITS, UNTAGGED};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid switch id: {0}")]
    InvalidSwitchId(String),

    #[error("invalid VLAN ID: {0} (must be 0-4094)")]
    InvalidVlanId(u16),

    #[error("invalid color: {0} (must be 1-{max})", max = MAX_COLOR)]
    InvalidColor(u8),
}
