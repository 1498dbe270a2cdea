//! In-memory bounded deduplication backend

use crate::{Dedup, EvictionPolicy, Fingerprint};
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use tracing::debug;

/// In-memory deduplication implementation
pub struct MemoryDedup {
    /// Recorded fingerprints in insertion order
    entries: LruCache<Fingerprint, ()>,
    /// Behaviour once `entries` is full
    policy: EvictionPolicy,
}

impl MemoryDedup {
    /// Create a cache holding at most `capacity` fingerprints (minimum 1)
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            policy,
        }
    }

    /// Maximum number of fingerprints held
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl Default for MemoryDedup {
    fn default() -> Self {
        Self::new(1000, EvictionPolicy::Lru)
    }
}

impl fmt::Debug for MemoryDedup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDedup")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Dedup for MemoryDedup {
    fn seen(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains(fingerprint)
    }

    fn remember(&mut self, fingerprint: Fingerprint) {
        if self.entries.contains(&fingerprint) {
            return;
        }

        if self.entries.len() >= self.capacity() {
            match self.policy {
                EvictionPolicy::Lru => {
                    if let Some((evicted, _)) = self.entries.pop_lru() {
                        debug!("Dedup evicted {}", evicted);
                    }
                }
                EvictionPolicy::FullClear => {
                    debug!("Dedup full ({} entries), clearing", self.entries.len());
                    self.entries.clear();
                }
            }
        }

        self.entries.put(fingerprint, ());
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
