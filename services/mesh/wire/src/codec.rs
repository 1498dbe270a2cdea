//! Encoding and decoding of [`Packet`]s.
//!
//! ```text
//! +---------+------+-----+---------------+-------+-------------+
//! | version | type | ttl | timestamp u64 | flags | length u16/ |
//! |   u8    |  u8  | u8  |               |  u8   |    u32      |
//! +---------+------+-----+---------------+-------+-------------+
//! | sender (8B) | recipient (8B, opt) | original size (opt)     |
//! +-------------+---------------------+-------------------------+
//! | payload (length bytes, minus the original-size prefix)     |
//! +------------------------------------------------------------+
//! | signature (64B, opt)                                       |
//! +------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. The length field covers the payload plus
//! the original-size prefix when the payload is compressed.

use crate::compression::{self, COMPRESSION_THRESHOLD};
use crate::header::{PacketFlags, PeerId, ProtocolVersion, PEER_ID_SIZE, SIGNATURE_SIZE};
use crate::padding;
use crate::{Packet, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// Encode a packet, optionally padding to the block size.
///
/// Returns `None` when the packet cannot be represented, for instance an
/// unknown version or a payload too large for the version's length field.
pub fn encode(packet: &Packet, pad: bool) -> Option<Bytes> {
    match try_encode(packet, pad) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!("Failed to encode packet type {}: {}", packet.packet_type, e);
            None
        }
    }
}

/// Encode a packet, reporting why it could not be represented
pub fn try_encode(packet: &Packet, pad: bool) -> Result<Bytes, WireError> {
    let version = ProtocolVersion::try_from(packet.version)?;
    let prefix_len = version.length_field_size();

    let mut flags = packet.base_flags();
    let compressed = compress_for_wire(version, &packet.payload);
    if compressed.is_some() {
        flags |= PacketFlags::IS_COMPRESSED;
    }

    let body: &[u8] = compressed.as_deref().unwrap_or(&packet.payload);
    let length = if compressed.is_some() {
        body.len() + prefix_len
    } else {
        body.len()
    };
    if length as u64 > version.max_length() {
        return Err(WireError::Size(length));
    }

    let mut size = version.header_size() + PEER_ID_SIZE + length;
    if packet.recipient_id.is_some() {
        size += PEER_ID_SIZE;
    }
    if packet.signature.is_some() {
        size += SIGNATURE_SIZE;
    }

    let mut buf = BytesMut::with_capacity(padding::block_size(size));
    buf.put_u8(packet.version);
    buf.put_u8(packet.packet_type);
    buf.put_u8(packet.ttl);
    buf.put_u64(packet.timestamp);
    buf.put_u8(flags.bits());
    put_length(&mut buf, version, length);

    buf.put_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = packet.recipient_id {
        buf.put_slice(recipient.as_bytes());
    }
    if compressed.is_some() {
        put_length(&mut buf, version, packet.payload.len());
    }
    buf.put_slice(body);

    if let Some(signature) = &packet.signature {
        let n = signature.len().min(SIGNATURE_SIZE);
        buf.put_slice(&signature[..n]);
        buf.put_bytes(0, SIGNATURE_SIZE - n);
    }

    if pad {
        padding::pad(&mut buf);
    }

    Ok(buf.freeze())
}

/// Decode a packet, returning `None` for anything unparseable.
///
/// The input is parsed as-is first; only if that fails on a length or
/// truncation problem are trailing zero bytes stripped and the parse
/// retried once. Compression-bound violations are never retried.
pub fn decode(data: &[u8]) -> Option<Packet> {
    match try_decode(data) {
        Ok(packet) => Some(packet),
        Err(e) if e.is_length_error() => {
            let stripped = padding::unpad(data);
            if stripped.len() == data.len() {
                debug!("Dropping unparseable packet ({} bytes): {}", data.len(), e);
                return None;
            }
            match try_decode(stripped) {
                Ok(packet) => Some(packet),
                Err(e) => {
                    debug!("Dropping unparseable packet after unpad ({} bytes): {}", data.len(), e);
                    None
                }
            }
        }
        Err(e @ WireError::CompressionBounds { .. }) => {
            warn!("Rejected compressed packet: {}", e);
            None
        }
        Err(e) => {
            debug!("Dropping packet ({} bytes): {}", data.len(), e);
            None
        }
    }
}

/// Decode a packet, reporting why it was rejected.
///
/// Bytes after a complete packet are ignored.
pub fn try_decode(data: &[u8]) -> Result<Packet, WireError> {
    let mut buf = data;
    if buf.is_empty() {
        return Err(WireError::Incomplete);
    }

    let version = ProtocolVersion::try_from(buf[0])?;
    if buf.remaining() < version.header_size() + PEER_ID_SIZE {
        return Err(WireError::Incomplete);
    }

    let raw_version = buf.get_u8();
    let packet_type = buf.get_u8();
    let ttl = buf.get_u8();
    let timestamp = buf.get_u64();
    let flags = PacketFlags::from_bits_truncate(buf.get_u8());
    let length = get_length(&mut buf, version);

    let sender_id = PeerId::from_slice(&buf[..PEER_ID_SIZE]);
    buf.advance(PEER_ID_SIZE);

    let recipient_id = if flags.contains(PacketFlags::HAS_RECIPIENT) {
        if buf.remaining() < PEER_ID_SIZE {
            return Err(WireError::Incomplete);
        }
        let id = PeerId::from_slice(&buf[..PEER_ID_SIZE]);
        buf.advance(PEER_ID_SIZE);
        Some(id)
    } else {
        None
    };

    let payload = if flags.contains(PacketFlags::IS_COMPRESSED) {
        let prefix_len = version.length_field_size();
        if length < prefix_len {
            return Err(WireError::Malformed);
        }
        if buf.remaining() < prefix_len {
            return Err(WireError::Incomplete);
        }
        let original_size = get_length(&mut buf, version);
        let compressed_len = length - prefix_len;

        if !compression::within_bounds(original_size, compressed_len) {
            return Err(WireError::CompressionBounds {
                original: original_size,
                compressed: compressed_len,
            });
        }
        if buf.remaining() < compressed_len {
            return Err(WireError::Incomplete);
        }

        let restored = compression::decompress(&buf[..compressed_len], original_size)
            .ok_or(WireError::Decompress)?;
        buf.advance(compressed_len);
        Bytes::from(restored)
    } else {
        if buf.remaining() < length {
            return Err(WireError::Incomplete);
        }
        let payload = Bytes::copy_from_slice(&buf[..length]);
        buf.advance(length);
        payload
    };

    let signature = if flags.contains(PacketFlags::HAS_SIGNATURE) {
        if buf.remaining() < SIGNATURE_SIZE {
            return Err(WireError::Incomplete);
        }
        Some(Bytes::copy_from_slice(&buf[..SIGNATURE_SIZE]))
    } else {
        None
    };

    Ok(Packet {
        version: raw_version,
        packet_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        payload,
        signature,
    })
}

/// Compressed payload to put on the wire, if compression is worth it
fn compress_for_wire(version: ProtocolVersion, payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() <= COMPRESSION_THRESHOLD || payload.len() as u64 > version.max_length() {
        return None;
    }
    let compressed = compression::compress(payload)?;
    if compressed.len() + version.length_field_size() < payload.len() {
        Some(compressed)
    } else {
        None
    }
}

fn put_length(buf: &mut BytesMut, version: ProtocolVersion, value: usize) {
    match version {
        ProtocolVersion::V1 => buf.put_u16(value as u16),
        ProtocolVersion::V2 => buf.put_u32(value as u32),
    }
}

fn get_length(buf: &mut &[u8], version: ProtocolVersion) -> usize {
    match version {
        ProtocolVersion::V1 => buf.get_u16() as usize,
        ProtocolVersion::V2 => buf.get_u32() as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MessageType, V1_HEADER_SIZE, V2_HEADER_SIZE};

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

    fn sample_packet() -> Packet {
        Packet::new(
            MessageType::Message,
            PeerId::from_u64(0x1122334455667788),
            Bytes::from_static(b"hello mesh"),
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_round_trip_minimal() {
        let packet = sample_packet();
        let bytes = encode(&packet, false).unwrap();
        assert_eq!(bytes.len(), V1_HEADER_SIZE + PEER_ID_SIZE + 10);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_all_fields() {
        let packet = sample_packet()
            .with_recipient(PeerId::from_u64(42))
            .with_signature(Bytes::from(vec![0xAB; SIGNATURE_SIZE]))
            .with_ttl(3);
        let bytes = encode(&packet, false).unwrap();
        assert_eq!(bytes[11], (PacketFlags::HAS_RECIPIENT | PacketFlags::HAS_SIGNATURE).bits());
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_v2() {
        let packet = sample_packet().with_version(ProtocolVersion::V2);
        let bytes = encode(&packet, false).unwrap();
        assert_eq!(bytes.len(), V2_HEADER_SIZE + PEER_ID_SIZE + 10);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_header_layout() {
        let packet = sample_packet().with_ttl(5);
        let bytes = encode(&packet, false).unwrap();

        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], MessageType::Message as u8);
        assert_eq!(bytes[2], 5);
        assert_eq!(&bytes[3..11], &1_700_000_000_000u64.to_be_bytes());
        assert_eq!(bytes[11], 0);
        assert_eq!(&bytes[12..14], &10u16.to_be_bytes());
        assert_eq!(&bytes[14..22], &0x1122334455667788u64.to_be_bytes());
        assert_eq!(&bytes[22..], b"hello mesh");
    }

    #[test]
    fn test_padding_round_trip() {
        let packet = sample_packet();
        let bytes = encode(&packet, true).unwrap();
        assert_eq!(bytes.len() % 16, 0);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_zero_suffixed_payload_survives() {
        let packet = Packet::new(
            MessageType::Message,
            PeerId::from_u64(9),
            Bytes::from_static(&[1, 2, 3, 0, 0]),
            1,
        );
        let bytes = encode(&packet, true).unwrap();
        assert_eq!(decode(&bytes).unwrap().payload, packet.payload);
    }

    #[test]
    fn test_signature_truncated_and_padded() {
        let long = sample_packet().with_signature(Bytes::from(vec![1u8; 80]));
        let decoded = decode(&encode(&long, false).unwrap()).unwrap();
        assert_eq!(decoded.signature.unwrap(), Bytes::from(vec![1u8; 64]));

        let short = sample_packet().with_signature(Bytes::from(vec![2u8; 4]));
        let decoded = decode(&encode(&short, false).unwrap()).unwrap();
        let sig = decoded.signature.unwrap();
        assert_eq!(&sig[..4], &[2u8; 4]);
        assert!(sig[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_compression_applied() {
        let payload = Bytes::from(b"token:cashuA".repeat(64));
        let packet = Packet::new(MessageType::Message, PeerId::from_u64(1), payload.clone(), 7);
        let bytes = encode(&packet, false).unwrap();

        assert!(PacketFlags::from_bits_truncate(bytes[11]).contains(PacketFlags::IS_COMPRESSED));
        assert!(bytes.len() < payload.len());
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let packet = Packet::new(MessageType::Message, PeerId::from_u64(1), Bytes::from(vec![b'a'; 256]), 7);
        let bytes = encode(&packet, false).unwrap();
        assert_eq!(bytes[11] & PacketFlags::IS_COMPRESSED.bits(), 0);
    }

    #[test]
    fn test_incompressible_payload_sent_raw() {
        let packet = Packet::new(MessageType::Message, PeerId::from_u64(1), Bytes::from(noise(600)), 7);
        let bytes = encode(&packet, false).unwrap();
        assert_eq!(bytes[11] & PacketFlags::IS_COMPRESSED.bits(), 0);
        assert_eq!(bytes.len(), V1_HEADER_SIZE + PEER_ID_SIZE + 600);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_v1_oversized_payload_fails() {
        let packet = Packet::new(MessageType::Message, PeerId::from_u64(1), Bytes::from(noise(70_000)), 7)
            .with_version(ProtocolVersion::V1);
        assert!(encode(&packet, false).is_none());
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = BytesMut::from(&encode(&sample_packet(), false).unwrap()[..]);
        bytes[0] = 3;
        assert!(decode(&bytes).is_none());
        assert_eq!(try_decode(&bytes), Err(WireError::Version(3)));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&sample_packet().with_recipient(PeerId::from_u64(2)), false).unwrap();
        for cut in [0, 1, 5, V1_HEADER_SIZE, V1_HEADER_SIZE + 12, bytes.len() - 1] {
            assert!(decode(&bytes[..cut]).is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_declared_length_exceeds_data() {
        let mut bytes = BytesMut::from(&encode(&sample_packet(), false).unwrap()[..]);
        bytes[12..14].copy_from_slice(&200u16.to_be_bytes());
        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn test_compressed_flag_without_prefix() {
        let mut bytes = BytesMut::from(&encode(&sample_packet(), false).unwrap()[..]);
        bytes[11] = PacketFlags::IS_COMPRESSED.bits();
        bytes[12..14].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(try_decode(&bytes), Err(WireError::Malformed));
    }

    #[test]
    fn test_compression_bomb_rejected() {
        // Claims 900,000 bytes from 10 compressed bytes (90,000:1).
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(MessageType::Message as u8);
        buf.put_u8(7);
        buf.put_u64(1);
        buf.put_u8(PacketFlags::IS_COMPRESSED.bits());
        buf.put_u32(10 + 4);
        buf.put_slice(&[1u8; 8]);
        buf.put_u32(900_000);
        buf.put_slice(&[0u8; 10]);

        assert!(decode(&buf).is_none());
        assert_eq!(
            try_decode(&buf),
            Err(WireError::CompressionBounds {
                original: 900_000,
                compressed: 10
            })
        );
    }

    #[test]
    fn test_oversized_original_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(MessageType::Message as u8);
        buf.put_u8(7);
        buf.put_u64(1);
        buf.put_u8(PacketFlags::IS_COMPRESSED.bits());
        buf.put_u32(100_000 + 4);
        buf.put_slice(&[1u8; 8]);
        buf.put_u32(2_000_000);
        buf.put_bytes(0, 100_000);

        assert!(matches!(try_decode(&buf), Err(WireError::CompressionBounds { .. })));
    }

    #[test]
    fn test_lying_original_size_rejected() {
        let payload = Bytes::from(vec![b'z'; 2000]);
        let packet = Packet::new(MessageType::Message, PeerId::from_u64(1), payload, 7);
        let mut bytes = BytesMut::from(&encode(&packet, false).unwrap()[..]);

        // Original-size prefix sits right after the sender id in a v1 broadcast.
        let prefix = V1_HEADER_SIZE + PEER_ID_SIZE;
        bytes[prefix..prefix + 2].copy_from_slice(&1999u16.to_be_bytes());
        assert_eq!(try_decode(&bytes), Err(WireError::Decompress));
    }
}
