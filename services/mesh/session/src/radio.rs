//! Boundary to the platform radio.
//!
//! The engine never touches a radio API directly. It is handed a
//! [`RadioTransport`] at construction and is fed [`RadioEvent`]s by whoever
//! owns the radio.

use bytes::Bytes;
use mesh_wire::PeerId;
use thiserror::Error;

/// Errors reported by a radio transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// No link to the peer
    #[error("no link to peer {0}")]
    NotConnected(PeerId),
    /// The radio has been shut down
    #[error("radio is stopped")]
    Stopped,
    /// Platform-specific failure
    #[error("radio failure: {0}")]
    Platform(String),
}

/// Outbound operations the engine asks of the radio.
///
/// Implementations must not block; results come back as [`RadioEvent`]s.
pub trait RadioTransport: Send + Sync + std::fmt::Debug {
    /// Write one link frame to a connected peer
    fn send_bytes(&self, peer: PeerId, bytes: Bytes) -> Result<(), RadioError>;
    /// Start a connection attempt
    fn connect(&self, peer: PeerId) -> Result<(), RadioError>;
    /// Tear down a link
    fn disconnect(&self, peer: PeerId) -> Result<(), RadioError>;
    /// Begin scanning for peers
    fn start_scanning(&self) -> Result<(), RadioError>;
    /// Begin advertising under `name`
    fn start_advertising(&self, name: &str) -> Result<(), RadioError>;
    /// Stop scanning, advertising and all links
    fn stop_all(&self);
}

/// Events delivered by the radio into the engine's context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A peer was seen advertising
    PeerDiscovered {
        /// Peer id
        peer: PeerId,
        /// Advertised name
        name: Option<String>,
        /// Signal strength
        rssi: Option<i32>,
    },
    /// A link to the peer is up
    LinkEstablished {
        /// Peer id
        peer: PeerId,
    },
    /// A link or attempt ended
    LinkLost {
        /// Peer id
        peer: PeerId,
        /// Error reported by the radio, if any
        error: Option<String>,
    },
    /// The radio failed to reach the peer
    ConnectionError {
        /// Peer id
        peer: PeerId,
        /// Error reported by the radio
        error: String,
    },
    /// Raw bytes arrived on a link
    BytesReceived {
        /// Peer the bytes came from
        peer: PeerId,
        /// One link frame
        bytes: Bytes,
    },
}

impl RadioEvent {
    /// Peer the event concerns
    pub fn peer(&self) -> PeerId {
        match self {
            RadioEvent::PeerDiscovered { peer, .. }
            | RadioEvent::LinkEstablished { peer }
            | RadioEvent::LinkLost { peer, .. }
            | RadioEvent::ConnectionError { peer, .. }
            | RadioEvent::BytesReceived { peer, .. } => *peer,
        }
    }
}
