//! Wire-level MQTT types
//!
//! Packets, properties and reason codes for the subset of 3.1.1 and 5.0
//! that a publishing client sends or receives.

mod error;
mod packet;
mod properties;
mod reason;

use std::fmt;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Protocol level written into CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    #[default]
    V311 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(level: u8) -> Option<Self> {
        [Self::V311, Self::V5]
            .into_iter()
            .find(|version| *version as u8 == level)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if *self == Self::V5 { "5.0" } else { "3.1.1" })
    }
}

/// Delivery guarantee of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = 0,
    /// Acknowledged with PUBACK
    AtLeastOnce = 1,
    /// Four-step PUBREC/PUBREL/PUBCOMP handshake
    ExactlyOnce = 2,
}

impl QoS {
    const LEVELS: [QoS; 3] = [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce];

    pub fn from_u8(level: u8) -> Option<Self> {
        Self::LEVELS.get(usize::from(level)).copied()
    }

    /// Numeric level as text, for metric labels
    pub fn as_str(self) -> &'static str {
        ["0", "1", "2"][self as usize]
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
