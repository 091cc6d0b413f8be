//! Canonical byte encoding for signable structures.
//!
//! Fields are appended in a fixed declared order with no framing between
//! them. Optional fingerprints are a presence byte followed, when present,
//! by two big-endian 64-bit words. Strings are raw UTF-8, flags a single
//! byte and hash lists their concatenated digests.

use crate::hash::Fingerprint;

/// A structure with a canonical byte form that can be signed and verified
pub trait Signable {
    /// Canonical bytes fed to the signature primitive
    fn canonical_bytes(&self) -> Vec<u8>;
}

/// Builder for canonical byte strings
#[derive(Debug, Default, Clone)]
pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create an empty encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an optional fingerprint behind a presence byte
    pub fn fingerprint(mut self, fingerprint: Option<&Fingerprint>) -> Self {
        self.buf.push(u8::from(fingerprint.is_some()));
        if let Some(fp) = fingerprint {
            self.buf.extend_from_slice(&fp.msb.to_be_bytes());
            self.buf.extend_from_slice(&fp.lsb.to_be_bytes());
        }
        self
    }

    /// Append a UTF-8 string
    pub fn str(mut self, value: &str) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append raw bytes
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Append a single flag byte
    pub fn flag(mut self, value: bool) -> Self {
        self.buf.push(u8::from(value));
        self
    }

    /// Append an ordered list of hashes
    pub fn hashes<H: AsRef<[u8]>>(mut self, hashes: &[H]) -> Self {
        for hash in hashes {
            self.buf.extend_from_slice(hash.as_ref());
        }
        self
    }

    /// Finish and return the canonical bytes
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
