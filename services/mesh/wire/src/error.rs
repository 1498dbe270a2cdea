//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes for a declared field
    #[error("incomplete packet")]
    Incomplete,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Payload does not fit the length field of the packet version
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Claimed original size or compression ratio is out of bounds
    #[error("compression bounds violated: original={original} compressed={compressed}")]
    CompressionBounds {
        /// Claimed decompressed size
        original: usize,
        /// Compressed bytes on the wire
        compressed: usize,
    },

    /// Decompression failed or produced the wrong length
    #[error("decompression failed")]
    Decompress,

    /// Malformed packet structure
    #[error("malformed packet")]
    Malformed,

    /// Malformed fragment payload
    #[error("malformed fragment")]
    Fragment,
}

impl WireError {
    /// Whether a retry after stripping padding could succeed
    pub fn is_length_error(&self) -> bool {
        matches!(self, WireError::Incomplete | WireError::Malformed)
    }
}
