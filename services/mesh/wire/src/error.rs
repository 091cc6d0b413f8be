//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// CRC or content hash mismatch
    #[error("integrity check failed")]
    Integrity,

    /// Length prefix exceeds the frame cap
    #[error("frame of {0} bytes exceeds cap of {1}")]
    OversizeFrame(usize, usize),

    /// Decoded packet violates a structural bound
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reassembly buffer lacks space for the write
    #[error("reassembly buffer overflow: {needed} bytes, {free} free")]
    Overflow {
        /// Bytes the producer tried to append
        needed: usize,
        /// Free bytes at the time of the call
        free: usize,
    },

    /// Byte stream completed before a whole frame arrived
    #[error("stream closed")]
    Closed,

    /// Producer signaled a stream failure
    #[error("stream failed: {0}")]
    Stream(String),

    /// Unknown packet tag
    #[error("unknown packet type {0:#04x}")]
    UnknownPacket(u8),

    /// Packet body failed to decode
    #[error("packet body malformed")]
    Decode,

    /// Packet body failed to encode
    #[error("packet body encoding failed")]
    Encode,

    /// Unknown enum discriminant
    #[error("unknown code {0}")]
    Code(u8),

    /// Sealed payload could not be opened
    #[error("sealed payload rejected")]
    Sealed,
}
