//! The packet carried over the radio link.

use crate::header::{MessageType, PacketFlags, PeerId, ProtocolVersion, DEFAULT_TTL};
use bytes::Bytes;

/// One wire-format unit.
///
/// Packets are immutable once built; relaying produces a new packet with a
/// smaller TTL via [`Packet::relayed`]. Flags are not stored, they are
/// derived from the optional fields (compression is decided by the codec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header version (1 or 2)
    pub version: u8,
    /// Raw type byte, see [`MessageType`] for known values
    pub packet_type: u8,
    /// Remaining hop budget
    pub ttl: u8,
    /// Milliseconds since the Unix epoch at creation
    pub timestamp: u64,
    /// Originating peer
    pub sender_id: PeerId,
    /// Addressed peer, `None` for broadcast
    pub recipient_id: Option<PeerId>,
    /// Uncompressed payload
    pub payload: Bytes,
    /// Opaque signature bytes owned by the identity layer
    pub signature: Option<Bytes>,
}

impl Packet {
    /// Create a broadcast packet with the default TTL.
    ///
    /// The version is picked from the payload size so that the length field
    /// can always represent it.
    pub fn new(packet_type: impl Into<u8>, sender_id: PeerId, payload: Bytes, timestamp: u64) -> Self {
        Self {
            version: ProtocolVersion::for_payload_len(payload.len()) as u8,
            packet_type: packet_type.into(),
            ttl: DEFAULT_TTL,
            timestamp,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Address the packet to a single peer
    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    /// Override the hop budget
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: Bytes) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Override the header version
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version as u8;
        self
    }

    /// Known message type, if any
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.packet_type).ok()
    }

    /// Whether this packet carries a fragment
    pub fn is_fragment(&self) -> bool {
        self.message_type().map(MessageType::is_fragment).unwrap_or(false)
    }

    /// Effective recipient: an explicit broadcast id counts as no recipient
    pub fn unicast_recipient(&self) -> Option<PeerId> {
        self.recipient_id.filter(|id| !id.is_broadcast())
    }

    /// Whether a node with id `local` should deliver this packet
    pub fn is_addressed_to(&self, local: PeerId) -> bool {
        match self.unicast_recipient() {
            None => true,
            Some(recipient) => recipient == local,
        }
    }

    /// Flags implied by the optional fields (without compression)
    pub fn base_flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        if self.recipient_id.is_some() {
            flags |= PacketFlags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= PacketFlags::HAS_SIGNATURE;
        }
        flags
    }

    /// Copy for the next hop, or `None` when the hop budget is spent
    pub fn relayed(&self) -> Option<Packet> {
        if self.ttl <= 1 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Some(next)
    }
}
