//! Fragmentation of packets that exceed one link frame.
//!
//! A packet too large for the link is encoded once, and the encoded bytes
//! are carried as the payload of a run of fragment packets:
//!
//! ```text
//! +------------------+-----------+-----------+-------------------+--------+
//! | fragment_id u64  | index u16 | total u16 | original type u8  | data   |
//! +------------------+-----------+-----------+-------------------+--------+
//! ```
//!
//! Receivers collect fragments in a [`FragmentAssembler`] keyed by sender and
//! fragment id, and decode the concatenated bytes as an ordinary packet.

use crate::header::{MessageType, PeerId};
use crate::{Packet, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Size of the fragment header inside a fragment packet's payload
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// Most fragments a single message may be split into
pub const MAX_FRAGMENTS_PER_MESSAGE: u16 = 4096;

/// Default bound on concurrently tracked fragment sets
pub const DEFAULT_MAX_FRAGMENT_SETS: usize = 10;

/// Default time a fragment set may stay incomplete
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest number of bytes a single fragment set may accumulate
pub const MAX_REASSEMBLED_SIZE: usize = 2 * 1024 * 1024;

/// Fragment payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Sender-chosen id shared by all fragments of one message
    pub fragment_id: u64,
    /// 0-based position
    pub index: u16,
    /// Number of fragments in the message
    pub total: u16,
    /// Type byte of the packet being carried
    pub original_type: u8,
}

/// A parsed fragment payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Header fields
    pub header: FragmentHeader,
    /// Slice of the encoded original packet
    pub data: Bytes,
}

impl Fragment {
    /// Parse the payload of a fragment packet
    pub fn parse(payload: &Bytes) -> Result<Self, WireError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::Fragment);
        }
        let mut buf = &payload[..FRAGMENT_HEADER_SIZE];
        let header = FragmentHeader {
            fragment_id: buf.get_u64(),
            index: buf.get_u16(),
            total: buf.get_u16(),
            original_type: buf.get_u8(),
        };
        Ok(Self {
            header,
            data: payload.slice(FRAGMENT_HEADER_SIZE..),
        })
    }

    /// Serialize as a fragment packet payload
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len());
        buf.put_u64(self.header.fragment_id);
        buf.put_u16(self.header.index);
        buf.put_u16(self.header.total);
        buf.put_u8(self.header.original_type);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Splits encoded packets into fragment packets
#[derive(Debug, Clone)]
pub struct Fragmenter {
    chunk_size: usize,
}

impl Fragmenter {
    /// Create a fragmenter carrying `chunk_size` data bytes per fragment
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Data bytes carried per fragment
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `encoded` (the unpadded encoding of `original`) into fragment packets.
    ///
    /// Fragments inherit the sender, recipient, TTL and timestamp of the
    /// original packet.
    pub fn split(&self, original: &Packet, encoded: &Bytes, fragment_id: u64) -> Result<Vec<Packet>, WireError> {
        let total = encoded.len().div_ceil(self.chunk_size);
        if total == 0 || total > MAX_FRAGMENTS_PER_MESSAGE as usize {
            return Err(WireError::Size(encoded.len()));
        }
        let total = total as u16;

        let mut packets = Vec::with_capacity(total as usize);
        for index in 0..total {
            let start = index as usize * self.chunk_size;
            let end = (start + self.chunk_size).min(encoded.len());

            let packet_type = match index {
                0 => MessageType::FragmentStart,
                i if i == total - 1 => MessageType::FragmentEnd,
                _ => MessageType::FragmentContinue,
            };
            let fragment = Fragment {
                header: FragmentHeader {
                    fragment_id,
                    index,
                    total,
                    original_type: original.packet_type,
                },
                data: encoded.slice(start..end),
            };

            let mut packet = Packet::new(packet_type, original.sender_id, fragment.to_payload(), original.timestamp)
                .with_ttl(original.ttl);
            packet.recipient_id = original.recipient_id;
            packets.push(packet);
        }

        debug!("Fragmented {} bytes into {} fragments (id {:016x})", encoded.len(), total, fragment_id);
        Ok(packets)
    }
}

/// Identifies one in-flight multi-part message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    /// Sender of the fragments
    pub sender: PeerId,
    /// Sender-chosen fragment id
    pub message_id: u64,
}

#[derive(Debug)]
struct FragmentSet {
    parts: BTreeMap<u16, Bytes>,
    total: u16,
    first_seen: Instant,
    bytes: usize,
}

impl FragmentSet {
    fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    fn concat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.bytes);
        for part in self.parts.values() {
            out.put_slice(part);
        }
        out.freeze()
    }
}

/// Reassembles fragments into complete messages under hard resource bounds
#[derive(Debug)]
pub struct FragmentAssembler {
    sets: HashMap<FragmentKey, FragmentSet>,
    max_sets: usize,
    timeout: Duration,
}

impl FragmentAssembler {
    /// Create an assembler tracking at most `max_sets` incomplete messages
    pub fn new(max_sets: usize, timeout: Duration) -> Self {
        Self {
            sets: HashMap::new(),
            max_sets: max_sets.max(1),
            timeout,
        }
    }

    /// Add one fragment; returns the concatenated message once every index is present.
    ///
    /// A fragment whose `total` disagrees with the set already tracked for
    /// its key is dropped and the existing set is left intact.
    pub fn ingest(&mut self, key: FragmentKey, index: u16, total: u16, data: Bytes, now: Instant) -> Option<Bytes> {
        if total == 0 || total > MAX_FRAGMENTS_PER_MESSAGE || index >= total {
            debug!("Dropping fragment {}/{} from {}: out of range", index, total, key.sender);
            return None;
        }

        if !self.sets.contains_key(&key) {
            if self.sets.len() >= self.max_sets {
                self.evict_oldest();
            }
            self.sets.insert(
                key,
                FragmentSet {
                    parts: BTreeMap::new(),
                    total,
                    first_seen: now,
                    bytes: 0,
                },
            );
        }

        let set = self.sets.get_mut(&key)?;
        if set.total != total {
            warn!(
                "Fragment total mismatch from {} (id {:016x}): have {}, got {}",
                key.sender, key.message_id, set.total, total
            );
            return None;
        }
        if set.parts.contains_key(&index) {
            return None;
        }

        set.bytes += data.len();
        set.parts.insert(index, data);

        if set.bytes > MAX_REASSEMBLED_SIZE {
            warn!("Discarding oversized fragment set from {} ({} bytes)", key.sender, set.bytes);
            self.sets.remove(&key);
            return None;
        }

        if set.is_complete() {
            let message = set.concat();
            self.sets.remove(&key);
            return Some(message);
        }

        None
    }

    /// Drop sets older than the timeout; returns how many were purged
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.sets.len();
        let timeout = self.timeout;
        self.sets
            .retain(|_, set| now.saturating_duration_since(set.first_seen) < timeout);
        let purged = before - self.sets.len();
        if purged > 0 {
            debug!("Purged {} expired fragment sets", purged);
        }
        purged
    }

    /// Drop every in-flight set
    pub fn clear(&mut self) {
        self.sets.clear();
    }

    /// Number of incomplete sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no sets are being tracked
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.first_seen)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            warn!("Fragment set limit reached, evicting {} (id {:016x})", key.sender, key.message_id);
            self.sets.remove(&key);
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAGMENT_SETS, DEFAULT_FRAGMENT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    fn key(sender: u64, id: u64) -> FragmentKey {
        FragmentKey {
            sender: PeerId::from_u64(sender),
            message_id: id,
        }
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();
        let k = key(1, 99);

        assert!(assembler.ingest(k, 1, 3, Bytes::from_static(b"BBB"), now).is_none());
        assert!(assembler.ingest(k, 0, 3, Bytes::from_static(b"AAA"), now).is_none());
        let message = assembler.ingest(k, 2, 3, Bytes::from_static(b"CC"), now).unwrap();

        assert_eq!(message, Bytes::from_static(b"AAABBBCC"));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_total_mismatch_keeps_existing_set() {
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();
        let k = key(1, 7);

        assert!(assembler.ingest(k, 1, 3, Bytes::from_static(b"b"), now).is_none());
        assert!(assembler.ingest(k, 0, 3, Bytes::from_static(b"a"), now).is_none());
        assert!(assembler.ingest(k, 3, 4, Bytes::from_static(b"x"), now).is_none());
        assert_eq!(assembler.len(), 1);

        let message = assembler.ingest(k, 2, 3, Bytes::from_static(b"c"), now).unwrap();
        assert_eq!(message, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_duplicate_index_ignored() {
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();
        let k = key(2, 1);

        assert!(assembler.ingest(k, 0, 2, Bytes::from_static(b"first"), now).is_none());
        assert!(assembler.ingest(k, 0, 2, Bytes::from_static(b"again"), now).is_none());
        let message = assembler.ingest(k, 1, 2, Bytes::from_static(b"!"), now).unwrap();
        assert_eq!(message, Bytes::from_static(b"first!"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();

        assert!(assembler.ingest(key(1, 1), 3, 3, Bytes::new(), now).is_none());
        assert!(assembler.ingest(key(1, 2), 0, 0, Bytes::new(), now).is_none());
        assert!(assembler
            .ingest(key(1, 3), 0, MAX_FRAGMENTS_PER_MESSAGE + 1, Bytes::new(), now)
            .is_none());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut assembler = FragmentAssembler::new(10, DEFAULT_FRAGMENT_TIMEOUT);
        let start = Instant::now();

        for id in 0..10u64 {
            let at = start + Duration::from_millis(id);
            assembler.ingest(key(1, id), 0, 2, Bytes::from_static(b"x"), at);
        }
        assert_eq!(assembler.len(), 10);

        assembler.ingest(key(1, 100), 0, 2, Bytes::from_static(b"y"), start + Duration::from_secs(1));
        assert_eq!(assembler.len(), 10);

        // Set 1 survived and can still complete.
        assert!(assembler
            .ingest(key(1, 1), 1, 2, Bytes::from_static(b"z"), start + Duration::from_secs(1))
            .is_some());
        // The oldest set (id 0) is gone: its second half starts a fresh set.
        assert!(assembler
            .ingest(key(1, 0), 1, 2, Bytes::from_static(b"z"), start + Duration::from_secs(1))
            .is_none());
        assert_eq!(assembler.len(), 10);
    }

    #[test]
    fn test_sweep_drops_expired() {
        let mut assembler = FragmentAssembler::new(10, Duration::from_secs(30));
        let start = Instant::now();

        assembler.ingest(key(1, 1), 0, 2, Bytes::from_static(b"a"), start);
        assembler.ingest(key(1, 2), 0, 2, Bytes::from_static(b"b"), start + Duration::from_secs(20));

        assert_eq!(assembler.sweep(start + Duration::from_secs(31)), 1);
        assert_eq!(assembler.len(), 1);
        assert_eq!(assembler.sweep(start + Duration::from_secs(60)), 1);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_oversized_set_discarded() {
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();
        let big = Bytes::from(vec![1u8; MAX_REASSEMBLED_SIZE / 2 + 1]);

        assert!(assembler.ingest(key(3, 3), 0, 3, big.clone(), now).is_none());
        assert!(assembler.ingest(key(3, 3), 1, 3, big, now).is_none());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_split_and_reassemble_packet() {
        let original = Packet::new(
            MessageType::Message,
            PeerId::from_u64(5),
            Bytes::from(noise(1500)),
            123,
        )
        .with_recipient(PeerId::from_u64(6));
        let encoded = encode(&original, false).unwrap();

        let fragmenter = Fragmenter::new(400);
        let fragments = fragmenter.split(&original, &encoded, 0xDEAD).unwrap();
        assert_eq!(fragments.len(), encoded.len().div_ceil(400));
        assert_eq!(fragments[0].packet_type, MessageType::FragmentStart as u8);
        assert_eq!(fragments.last().unwrap().packet_type, MessageType::FragmentEnd as u8);
        assert!(fragments.iter().all(|f| f.recipient_id == original.recipient_id));

        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();
        let mut result = None;
        for fragment_packet in fragments.iter().rev() {
            let wire = encode(fragment_packet, true).unwrap();
            let received = decode(&wire).unwrap();
            let fragment = Fragment::parse(&received.payload).unwrap();
            assert_eq!(fragment.header.original_type, MessageType::Message as u8);
            let k = FragmentKey {
                sender: received.sender_id,
                message_id: fragment.header.fragment_id,
            };
            result = assembler.ingest(k, fragment.header.index, fragment.header.total, fragment.data, now);
        }

        assert_eq!(decode(&result.unwrap()).unwrap(), original);
    }

    #[test]
    fn test_fragment_parse_rejects_short_payload() {
        assert_eq!(Fragment::parse(&Bytes::from_static(&[0u8; 12])), Err(WireError::Fragment));
    }
}
