//! Authenticated sealing of packet payloads between holders of a shared key.
//!
//! Sealed layout: `nonce (24B) || ciphertext || tag (16B)`.

use crate::error::CryptoError;
use crate::hash::generic_hash_multi;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;

/// Seal key length
pub const SEAL_KEY_SIZE: usize = 32;
/// Random nonce length
pub const NONCE_SIZE: usize = 24;

const KDF_CONTEXT: &[u8] = b"mesh-seal-v1";

/// Symmetric key for [`seal`] / [`open`]
#[derive(Clone, PartialEq, Eq)]
pub struct SealKey([u8; SEAL_KEY_SIZE]);

impl SealKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; SEAL_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut key = [0u8; SEAL_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Derive a shared key from an X25519 secret and the peer's X25519 public key.
    pub fn derive(local_secret: [u8; 32], peer_public: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(local_secret);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer_public));
        Self(generic_hash_multi(&[KDF_CONTEXT, shared.as_bytes()]))
    }

    /// X25519 public key matching a secret, for publishing to peers
    pub fn public_for(local_secret: [u8; 32]) -> [u8; 32] {
        let secret = x25519_dalek::StaticSecret::from(local_secret);
        x25519_dalek::PublicKey::from(&secret).to_bytes()
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::KeyLength {
            expected: SEAL_KEY_SIZE,
            actual: self.0.len(),
        })
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealKey(..)")
    }
}

/// Seal a plaintext under a random nonce
pub fn seal(key: &SealKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()?
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload
pub fn open(key: &SealKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    key.cipher()?
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Open)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = SealKey::generate();
        let sealed = seal(&key, b"declare hashes").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"declare hashes");
    }

    #[test]
    fn test_nonce_is_random() {
        let key = SealKey::generate();
        assert_ne!(seal(&key, b"x").unwrap(), seal(&key, b"x").unwrap());
    }

    #[test]
    fn test_tamper_rejected() {
        let key = SealKey::generate();
        let mut sealed = seal(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open(&key, &sealed), Err(CryptoError::Open));
        assert_eq!(open(&key, &sealed[..4]), Err(CryptoError::Truncated));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = seal(&SealKey::generate(), b"payload").unwrap();
        assert_eq!(open(&SealKey::generate(), &sealed), Err(CryptoError::Open));
    }

    #[test]
    fn test_derived_keys_agree() {
        let a = [3u8; 32];
        let b = [5u8; 32];
        let ka = SealKey::derive(a, SealKey::public_for(b));
        let kb = SealKey::derive(b, SealKey::public_for(a));
        assert_eq!(ka, kb);

        let sealed = seal(&ka, b"shared").unwrap();
        assert_eq!(open(&kb, &sealed).unwrap(), b"shared");
    }
}
