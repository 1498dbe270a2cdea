//! Peer lifecycle, relay engine and event loop for the ecash mesh.
//!
//! This crate sits between an abstract short-range radio and the
//! application. It tracks every peer the radio reports, suppresses
//! duplicates, reassembles fragmented messages and floods packets onward
//! until their hop budget runs out.
//!
//! ## Features
//!
//! - **Peer table**: one entry per peer with an explicit connection state
//!   machine and deadline sweeps
//! - **TTL relay**: packets are re-broadcast with one less hop to every
//!   connected peer except the one they came from
//! - **Dedup**: each logical message is processed at most once per node
//! - **Fragmentation**: oversized sends are split to fit the link frame and
//!   reassembled on receipt
//! - **Async driver**: [`MeshService`] serializes radio events, commands and
//!   sweeps through one `tokio::select!` loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{EngineConfig, MeshEngine, MeshService, MessageSink, RadioTransport};
//! use mesh_wire::MessageType;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example(radio: Arc<dyn RadioTransport>, sink: Arc<dyn MessageSink>) -> anyhow::Result<()> {
//! let engine = MeshEngine::new(EngineConfig::default(), radio, sink);
//! let (event_tx, event_rx) = mpsc::channel(256);
//! let (service, handle) = MeshService::new(engine, event_rx);
//! tokio::spawn(service.run());
//!
//! // The radio feeds `event_tx`; the application talks through `handle`
//! # drop(event_tx);
//! handle.send(MessageType::Message, "hello".into(), None).await?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod events;
pub mod manager;
pub mod peer;
pub mod radio;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use engine::{
    fingerprint_of, DropReason, EngineConfig, EngineError, EngineStats, MeshEngine, ReceiveOutcome, SendReport,
    SweepReport,
};
pub use events::{DeliveredMessage, MessageSink};
pub use manager::{MeshCommand, MeshHandle, MeshService, MeshStatus};
pub use peer::{ConnectionState, DiscoveryAction, Peer, PeerSnapshot, PeerTable};
pub use radio::{RadioError, RadioEvent, RadioTransport};
