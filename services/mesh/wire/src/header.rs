//! Header-level definitions for the wire protocol.
//!
//! Versions, message types, flag bits and the fixed-width peer identifier
//! that appears in every packet header.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Header size for version 1 packets (u16 length field)
pub const V1_HEADER_SIZE: usize = 14;

/// Header size for version 2 packets (u32 length field)
pub const V2_HEADER_SIZE: usize = 16;

/// Width of sender and recipient identifiers
pub const PEER_ID_SIZE: usize = 8;

/// Width of the signature field
pub const SIGNATURE_SIZE: usize = 64;

/// Default hop budget for new packets
pub const DEFAULT_TTL: u8 = 7;

/// Supported header versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// 14-byte header, 16-bit payload length
    V1 = 1,
    /// 16-byte header, 32-bit payload length
    V2 = 2,
}

impl ProtocolVersion {
    /// Size of the fixed header
    pub fn header_size(self) -> usize {
        match self {
            ProtocolVersion::V1 => V1_HEADER_SIZE,
            ProtocolVersion::V2 => V2_HEADER_SIZE,
        }
    }

    /// Width of the length field, also used for the original-size prefix
    pub fn length_field_size(self) -> usize {
        match self {
            ProtocolVersion::V1 => 2,
            ProtocolVersion::V2 => 4,
        }
    }

    /// Largest value the length field can carry
    pub fn max_length(self) -> u64 {
        match self {
            ProtocolVersion::V1 => u16::MAX as u64,
            ProtocolVersion::V2 => u32::MAX as u64,
        }
    }

    /// Smallest version able to carry a payload of `len` bytes uncompressed
    pub fn for_payload_len(len: usize) -> Self {
        if len as u64 <= ProtocolVersion::V1.max_length() {
            ProtocolVersion::V1
        } else {
            ProtocolVersion::V2
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            _ => Err(crate::WireError::Version(value)),
        }
    }
}

/// Known values of the packet type byte.
///
/// The type byte is carried as a raw `u8` on [`crate::Packet`]; values
/// outside this enum are legal and are passed through untouched.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Presence announcement carrying the sender's nickname
    Announce = 0x01,
    /// Sender is leaving the mesh
    Leave = 0x03,
    /// Application message (chat, ecash token, ...)
    Message = 0x04,
    /// First fragment of a larger packet
    FragmentStart = 0x05,
    /// Middle fragment
    FragmentContinue = 0x06,
    /// Final fragment
    FragmentEnd = 0x07,
}

impl MessageType {
    /// Whether this type carries a fragment payload
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            MessageType::FragmentStart | MessageType::FragmentContinue | MessageType::FragmentEnd
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Announce),
            0x03 => Ok(MessageType::Leave),
            0x04 => Ok(MessageType::Message),
            0x05 => Ok(MessageType::FragmentStart),
            0x06 => Ok(MessageType::FragmentContinue),
            0x07 => Ok(MessageType::FragmentEnd),
            other => Err(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PacketFlags: u8 {
        /// Recipient ID field present
        const HAS_RECIPIENT = 0x01;
        /// Signature field present
        const HAS_SIGNATURE = 0x02;
        /// Payload is compressed and prefixed with its original size
        const IS_COMPRESSED = 0x04;
    }
}

/// Fixed-width 8-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    /// All-ones identifier used as an explicit broadcast recipient
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_SIZE]);

    /// Build from arbitrary bytes: longer input is truncated, shorter input zero-padded
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut id = [0u8; PEER_ID_SIZE];
        let n = bytes.len().min(PEER_ID_SIZE);
        id[..n].copy_from_slice(&bytes[..n]);
        PeerId(id)
    }

    /// Build from a big-endian integer
    pub fn from_u64(value: u64) -> Self {
        PeerId(value.to_be_bytes())
    }

    /// Interpret as a big-endian integer
    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Whether this is the broadcast identifier
    pub fn is_broadcast(&self) -> bool {
        *self == PeerId::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    /// Parse a hex string; short ids are zero-padded like [`PeerId::from_slice`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Ok(PeerId::from_slice(&bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
