//! Codec errors

use std::fmt;

/// A buffer could not be decoded into a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed; not an error for a streaming reader
    InsufficientData,
    InvalidPacketType(u8),
    /// Variable byte integer longer than four bytes
    InvalidRemainingLength,
    /// CONNECT did not name "MQTT"
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    /// Fixed header flags not allowed for the packet type
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Exceeds the decoder's configured maximum
    PacketTooLarge,
    InvalidReasonCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InsufficientData => f.write_str("incomplete packet"),
            DecodeError::InvalidPacketType(t) => write!(f, "unsupported packet type {}", t),
            DecodeError::InvalidRemainingLength => f.write_str("remaining length overflow"),
            DecodeError::InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            DecodeError::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            DecodeError::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            DecodeError::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            DecodeError::InvalidPropertyId(id) => write!(f, "unknown property 0x{:02X}", id),
            DecodeError::InvalidFlags => f.write_str("reserved header flags set"),
            DecodeError::MalformedPacket(why) => write!(f, "malformed packet ({})", why),
            DecodeError::PacketTooLarge => f.write_str("packet exceeds maximum size"),
            DecodeError::InvalidReasonCode(r) => write!(f, "unknown reason code 0x{:02X}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A packet could not be put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length beyond what MQTT can express
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// Topic is empty or contains a wildcard or NUL
    InvalidTopicName,
    /// QoS 1/2 publish or acknowledgement without an identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncodeError::PacketTooLarge => "packet exceeds the MQTT size limit",
            EncodeError::StringTooLong => "field longer than 65535 bytes",
            EncodeError::InvalidTopicName => "topic name not allowed for PUBLISH",
            EncodeError::MissingPacketId => "packet identifier required",
        })
    }
}

impl std::error::Error for EncodeError {}
