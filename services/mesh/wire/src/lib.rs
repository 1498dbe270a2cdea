//! Wire protocol for the offline ecash mesh.
//!
//! This crate turns [`Packet`]s into the bytes written on a short-range radio
//! link and back, and splits packets that do not fit a single link frame.
//! Everything here is pure computation over buffers.
//!
//! ## Features
//!
//! - **Two header versions**: v1 (14-byte header, u16 length) and v2
//!   (16-byte header, u32 length)
//! - **Opportunistic compression**: raw DEFLATE for payloads over 256 bytes
//! - **Bomb protection**: claimed sizes and ratios are bounded before any
//!   decompression happens
//! - **Block padding**: frames are zero-padded to 16-byte blocks
//! - **Fragmentation**: oversized packets travel as numbered fragments and are
//!   reassembled under a fixed memory budget
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use mesh_wire::{decode, encode, MessageType, Packet, PeerId};
//!
//! let packet = Packet::new(MessageType::Message, PeerId::from_u64(1), Bytes::from_static(b"hi"), 0);
//! let bytes = encode(&packet, true).unwrap();
//! assert_eq!(bytes.len() % 16, 0);
//! assert_eq!(decode(&bytes).unwrap(), packet);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod compression;
pub mod error;
pub mod fragment;
pub mod header;
pub mod packet;
pub mod padding;

// Re-export main types
pub use codec::{decode, encode, try_decode, try_encode};
pub use error::WireError;
pub use fragment::{
    Fragment, FragmentAssembler, FragmentHeader, FragmentKey, Fragmenter, DEFAULT_FRAGMENT_TIMEOUT,
    DEFAULT_MAX_FRAGMENT_SETS, FRAGMENT_HEADER_SIZE, MAX_FRAGMENTS_PER_MESSAGE,
};
pub use header::{
    MessageType, PacketFlags, PeerId, ProtocolVersion, DEFAULT_TTL, PEER_ID_SIZE, SIGNATURE_SIZE,
    V1_HEADER_SIZE, V2_HEADER_SIZE,
};
pub use packet::Packet;
