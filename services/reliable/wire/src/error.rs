//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Body checksum mismatch
    #[error("frame checksum mismatch")]
    Checksum,

    /// Unknown action
    #[error("unknown action {0}")]
    Action(u8),

    /// Unsupported content type
    #[error("unsupported content type: {0}")]
    ContentType(String),

    /// CBOR encoding failed
    #[error("cbor encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("cbor decode failed: {0}")]
    Decode(String),

    /// Invalid acknowledgement range
    #[error("invalid range [{0}, {1}]")]
    Range(u64, u64),

    /// Malformed message structure
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}
