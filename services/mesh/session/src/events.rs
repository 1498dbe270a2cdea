//! Boundary to the application layer above the mesh.

use crate::peer::PeerSnapshot;
use bytes::Bytes;
use mesh_wire::{MessageType, PeerId};
use serde::Serialize;

/// A message that passed dedup and is addressed to this node or broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredMessage {
    /// Original sender
    pub sender: PeerId,
    /// Recipient, `None` for broadcast
    pub recipient: Option<PeerId>,
    /// Raw type byte
    pub message_type: u8,
    /// Application payload
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Bytes,
    /// Hops the packet could still have travelled
    pub ttl_remaining: u8,
}

impl DeliveredMessage {
    /// Known message type, if any
    pub fn known_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }
}

fn serialize_payload<S: serde::Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

/// Receiver of everything the engine publishes upward
pub trait MessageSink: Send + Sync + std::fmt::Debug {
    /// A message was delivered locally
    fn delivered(&self, message: DeliveredMessage);

    /// A peer's connection state or identity changed
    fn peer_changed(&self, _peer: &PeerSnapshot) {}
}
