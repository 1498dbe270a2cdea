//! Basic usage example for the mesh wire protocol.

use bytes::Bytes;
use mesh_wire::{
    decode, encode, Fragment, FragmentAssembler, FragmentKey, Fragmenter, MessageType, Packet, PeerId,
};
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Protocol Example ===\n");

    // 1. Encode a private message
    println!("1. Encoding a private MESSAGE packet...");
    let alice = PeerId::from_u64(0x1234567890ABCDEF);
    let bob = PeerId::from_u64(0xFEDCBA0987654321);
    let packet = Packet::new(MessageType::Message, alice, Bytes::from_static(b"Hello, mesh network!"), 1)
        .with_recipient(bob);

    let bytes = encode(&packet, true).ok_or("encode failed")?;
    println!("   Encoded (padded) size: {} bytes", bytes.len());

    // 2. Decode it back
    println!("\n2. Decoding the packet...");
    let decoded = decode(&bytes).ok_or("decode failed")?;
    println!("   Sender: {}", decoded.sender_id);
    println!("   Recipient: {:?}", decoded.recipient_id);
    println!("   Payload: {:?}", std::str::from_utf8(&decoded.payload));

    // 3. A compressible ecash token
    println!("\n3. Compressing a large token...");
    let token = Bytes::from("cashuAeyJ0b2tlbiI6W3sicHJvb2ZzIjpbXX1dfQ".repeat(40));
    let token_packet = Packet::new(MessageType::Message, alice, token.clone(), 2);
    let token_bytes = encode(&token_packet, false).ok_or("encode failed")?;
    println!("   Payload {} bytes -> frame {} bytes", token.len(), token_bytes.len());

    // 4. Fragment and reassemble
    println!("\n4. Fragmenting for a 128-byte link...");
    let fragments = Fragmenter::new(96).split(&token_packet, &token_bytes, 7)?;
    println!("   {} fragments", fragments.len());

    let mut assembler = FragmentAssembler::default();
    let now = Instant::now();
    for fragment_packet in &fragments {
        let fragment = Fragment::parse(&fragment_packet.payload)?;
        let key = FragmentKey {
            sender: fragment_packet.sender_id,
            message_id: fragment.header.fragment_id,
        };
        if let Some(whole) = assembler.ingest(key, fragment.header.index, fragment.header.total, fragment.data, now) {
            let restored = decode(&whole).ok_or("reassembled packet did not decode")?;
            println!("   Reassembled {} payload bytes", restored.payload.len());
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
