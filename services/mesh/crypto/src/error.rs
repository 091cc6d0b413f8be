//! Crypto error types.

use thiserror::Error;

/// Crypto errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    KeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// AEAD sealing failed
    #[error("seal failed")]
    Seal,

    /// AEAD opening failed (tampered or wrong key)
    #[error("open failed")]
    Open,

    /// Sealed box shorter than its nonce
    #[error("sealed payload truncated")]
    Truncated,
}
