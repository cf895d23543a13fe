//! Colors and the 3-bit priority tag that carries them.
//!
//! A probe's color lives in the 802.1Q PCP bits. Tag value 0 means "not yet
//! colored" and is never assigned to a switch, which leaves colors 1-7.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU8;

/// Width of the tag field in bits.
pub const TAG_BITS: u32 = 3;

/// Tag value of a probe that has not been colored.
pub const UNTAGGED: u8 = 0;

/// Largest color the tag field can carry.
pub const MAX_COLOR: u8 = (1 << TAG_BITS) - 1;

/// A switch color, always in `1..=MAX_COLOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Color(NonZeroU8);

impl Color {
    pub const FIRST: Color = Color(NonZeroU8::MIN);

    pub fn new(value: u8) -> Result<Self, ParseError> {
        match NonZeroU8::new(value) {
            Some(v) if value <= MAX_COLOR => Ok(Color(v)),
            _ => Err(ParseError::InvalidColor(value)),
        }
    }

    /// Reads a tag value back as a color. The untagged value and anything
    /// wider than the tag field yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::new(tag).ok()
    }

    pub const fn get(self) -> u8 {
        self.0.get()
    }

    /// Iterates every color the tag field can carry, lowest first.
    pub fn all() -> impl Iterator<Item = Color> {
        (1..=MAX_COLOR).filter_map(Color::from_tag)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Color {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Color::new(value)
    }
}

impl From<Color> for u8 {
    fn from(color: Color) -> u8 {
        color.get()
    }
}
