//! Deduplication storage for the ecash mesh.
//!
//! Every packet a node processes is recorded here by [`Fingerprint`] so that
//! the same logical message is delivered and relayed at most once, however
//! many neighbours forward it. Storage is bounded: once full, entries are
//! aged out according to an [`EvictionPolicy`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier used to recognise an already-processed message
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Fingerprint {
    /// Message carrying an explicit sender-assigned id
    Message {
        /// Raw sender id
        sender: [u8; 8],
        /// Sender-assigned message id
        message_id: u64,
        /// Part number within the message (fragment index, 0 otherwise)
        part: u32,
    },
    /// SHA-256 over the identifying content of a message without an id
    Content([u8; 32]),
}

impl Fingerprint {
    /// Fingerprint for a message with an explicit id
    pub fn message(sender: [u8; 8], message_id: u64, part: u32) -> Self {
        Fingerprint::Message {
            sender,
            message_id,
            part,
        }
    }

    /// Fingerprint over a sequence of fields, hashed in order
    pub fn content<'a>(fields: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field);
        }
        Fingerprint::Content(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Message {
                sender,
                message_id,
                part,
            } => {
                for b in sender {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ":{:016x}:{}", message_id, part)
            }
            Fingerprint::Content(hash) => {
                for b in &hash[..8] {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// What happens when a full cache admits a new entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the least recently inserted entry
    #[default]
    Lru,
    /// Forget everything and start over
    FullClear,
}

/// Deduplication trait for receiver-side idempotency
pub trait Dedup: Send + std::fmt::Debug {
    /// Whether a fingerprint has been recorded
    fn seen(&self, fingerprint: &Fingerprint) -> bool;

    /// Record a fingerprint, evicting per policy when full
    fn remember(&mut self, fingerprint: Fingerprint);

    /// Record a fingerprint; returns `true` if it was already present
    fn check_and_remember(&mut self, fingerprint: Fingerprint) -> bool {
        if self.seen(&fingerprint) {
            return true;
        }
        self.remember(fingerprint);
        false
    }

    /// Forget everything
    fn clear(&mut self);

    /// Number of recorded fingerprints
    fn len(&self) -> usize;

    /// Whether nothing is recorded
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dedup storage configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum number of fingerprints held
    pub capacity: usize,
    /// Eviction policy once full
    pub policy: EvictionPolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            policy: EvictionPolicy::Lru,
        }
    }
}

impl DedupConfig {
    /// Build the configured backend
    pub fn build(self) -> Box<dyn Dedup> {
        Box::new(MemoryDedup::new(self.capacity, self.policy))
    }
}

// Re-export backend implementations
pub use backend::mem::MemoryDedup;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_fingerprint_is_field_sensitive() {
        let a = Fingerprint::content([&b"ab"[..], &b"c"[..]]);
        let b = Fingerprint::content([&b"a"[..], &b"bc"[..]]);
        let c = Fingerprint::content([&b"ab"[..], &b"c"[..]]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_message_fingerprint_display() {
        let fp = Fingerprint::message([0, 0, 0, 0, 0, 0, 0, 1], 0x10, 2);
        assert_eq!(fp.to_string(), "0000000000000001:0000000000000010:2");
    }

    #[test]
    fn test_config_build() {
        let mut dedup = DedupConfig::default().build();
        assert!(dedup.is_empty());
        assert!(!dedup.check_and_remember(Fingerprint::message([1; 8], 1, 0)));
        assert!(dedup.check_and_remember(Fingerprint::message([1; 8], 1, 0)));
        assert_eq!(dedup.len(), 1);
    }
}
