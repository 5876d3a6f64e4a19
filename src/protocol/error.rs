//! Codec errors

use std::fmt;

/// Why bytes from the wire could not be turned into a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends inside a field; more bytes are needed
    Incomplete,
    /// Packet type outside the v3.1.1 subset we speak
    UnsupportedPacketType(u8),
    /// Remaining length longer than four bytes
    BadRemainingLength,
    /// CONNECT with a protocol level other than 4
    UnsupportedProtocolLevel(u8),
    /// A QoS or return code byte with no meaning
    OutOfRange { field: &'static str, value: u8 },
    Utf8,
    /// Fixed-header flags that v3.1.1 reserves
    ReservedFlags,
    Malformed(&'static str),
    /// Remaining length above the decoder's limit
    TooLarge { size: usize, limit: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => write!(f, "packet truncated"),
            Self::UnsupportedPacketType(t) => write!(f, "unsupported packet type {}", t),
            Self::BadRemainingLength => write!(f, "remaining length uses more than 4 bytes"),
            Self::UnsupportedProtocolLevel(level) => {
                write!(f, "protocol level {} is not MQTT 3.1.1", level)
            }
            Self::OutOfRange { field, value } => write!(f, "{} 0x{:02x} out of range", field, value),
            Self::Utf8 => write!(f, "string is not valid UTF-8"),
            Self::ReservedFlags => write!(f, "reserved header flags set"),
            Self::Malformed(reason) => write!(f, "malformed packet: {}", reason),
            Self::TooLarge { size, limit } => {
                write!(f, "packet of {} bytes exceeds limit of {} bytes", size, limit)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body longer than the variable byte integer can express
    RemainingLengthOverflow,
    /// Length-prefixed field over 65535 bytes
    FieldTooLong,
    /// QoS 1 PUBLISH without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemainingLengthOverflow => write!(f, "packet body too long to encode"),
            Self::FieldTooLong => write!(f, "field longer than 65535 bytes"),
            Self::MissingPacketId => write!(f, "QoS 1 publish needs a packet identifier"),
        }
    }
}

impl std::error::Error for EncodeError {}
