//! Raw DEFLATE compression with caller-bounded decompression.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Payloads larger than this are considered for compression
pub const COMPRESSION_THRESHOLD: usize = 256;

/// Largest original size a packet may claim
pub const MAX_DECOMPRESSED_SIZE: usize = 1_000_000;

/// Largest accepted original/compressed ratio
pub const MAX_COMPRESSION_RATIO: usize = 50_000;

/// Compress `data`, returning `None` if the encoder fails or produces nothing
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).ok()?;
    let out = encoder.finish().ok()?;
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Decompress `data`, which must expand to exactly `expected_size` bytes.
///
/// At most `expected_size + 1` bytes are ever produced, so a stream that
/// keeps expanding past its claim is cut off and rejected.
pub fn decompress(data: &[u8], expected_size: usize) -> Option<Vec<u8>> {
    if data.is_empty() || expected_size > MAX_DECOMPRESSED_SIZE {
        return None;
    }

    let mut out = Vec::with_capacity(expected_size);
    DeflateDecoder::new(data)
        .take(expected_size as u64 + 1)
        .read_to_end(&mut out)
        .ok()?;

    if out.len() == expected_size {
        Some(out)
    } else {
        None
    }
}

/// Whether a claimed original size is acceptable for `compressed_len` bytes
pub fn within_bounds(original_size: usize, compressed_len: usize) -> bool {
    original_size <= MAX_DECOMPRESSED_SIZE
        && compressed_len > 0
        && original_size as u64 <= compressed_len as u64 * MAX_COMPRESSION_RATIO as u64
}
