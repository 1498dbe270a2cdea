//! Block padding for link frames.
//!
//! Frames are padded with zero bytes up to the next 16-byte boundary.
//! Stripping is the reverse approximation: every trailing zero byte is
//! treated as padding, so a frame whose real content ends in zero bytes
//! loses them. The codec only strips after a plain parse fails, which keeps
//! that loss off the common path, but peers must not rely on trailing zero
//! bytes surviving an unpad.

use bytes::BytesMut;

/// Padding block size
pub const PAD_BLOCK: usize = 16;

/// Size of `n` rounded up to the next block boundary
pub fn block_size(n: usize) -> usize {
    n.div_ceil(PAD_BLOCK) * PAD_BLOCK
}

/// Append zero bytes up to the block boundary (no-op when already aligned)
pub fn pad(buf: &mut BytesMut) {
    let target = block_size(buf.len());
    if target > buf.len() {
        buf.resize(target, 0);
    }
}

/// Strip the trailing run of zero bytes
pub fn unpad(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    &data[..end]
}
