//! BLAKE2b generic hashing and public-key fingerprints.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// Generic hash output size in bytes
pub const HASH_SIZE: usize = 32;

/// Generic hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Compute the generic hash of arbitrary data.
pub fn generic_hash(data: &[u8]) -> HashOutput {
    generic_hash_multi(&[data])
}

/// Hash several byte slices in sequence without concatenating them first.
pub fn generic_hash_multi(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; HASH_SIZE];
    output.copy_from_slice(&hasher.finalize());
    output
}

/// 128-bit identity fingerprint: the first half of the generic hash of a
/// public key, split into most- and least-significant 64-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Most significant 64 bits
    pub msb: u64,
    /// Least significant 64 bits
    pub lsb: u64,
}

impl Fingerprint {
    /// Fingerprint a public key
    pub fn of(public_key: &[u8]) -> Self {
        let digest = generic_hash(public_key);
        let mut msb = [0u8; 8];
        let mut lsb = [0u8; 8];
        msb.copy_from_slice(&digest[..8]);
        lsb.copy_from_slice(&digest[8..16]);
        Self {
            msb: u64::from_be_bytes(msb),
            lsb: u64::from_be_bytes(lsb),
        }
    }

    /// Big-endian byte form (msb then lsb)
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.msb.to_be_bytes());
        out[8..].copy_from_slice(&self.lsb.to_be_bytes());
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.msb, self.lsb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(generic_hash(b"scatter"), generic_hash(b"scatter"));
        assert_ne!(generic_hash(b"scatter"), generic_hash(b"gather"));
    }

    #[test]
    fn test_hash_multi_equivalent() {
        assert_eq!(
            generic_hash(b"helloworld"),
            generic_hash_multi(&[b"hello", b"world"])
        );
    }

    #[test]
    fn test_fingerprint_is_hash_prefix() {
        let key = [7u8; 32];
        let digest = generic_hash(&key);
        let fp = Fingerprint::of(&key);
        assert_eq!(&fp.to_bytes()[..], &digest[..16]);
        assert_eq!(fp.to_string().len(), 32);
    }
}
