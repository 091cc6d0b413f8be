//! Ed25519 signing and verification over canonical bytes.

use crate::canonical::Signable;
use crate::error::CryptoError;
use crate::hash::Fingerprint;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Ed25519 secret key length
pub const SECRET_KEY_SIZE: usize = 32;
/// Ed25519 public key length
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Ed25519 signature length
pub const SIGNATURE_SIZE: usize = 64;

/// Signing keypair for a local identity
#[derive(Clone)]
pub struct Keypair {
    inner: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from a 32-byte secret seed
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; SECRET_KEY_SIZE] = seed.try_into().map_err(|_| CryptoError::KeyLength {
            expected: SECRET_KEY_SIZE,
            actual: seed.len(),
        })?;
        Ok(Self {
            inner: SigningKey::from_bytes(&seed),
        })
    }

    /// Secret seed bytes
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// Public key bytes
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.inner.verifying_key().to_bytes()
    }

    /// Fingerprint of the public key
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.public_bytes())
    }

    /// Sign a structure's canonical bytes
    pub fn sign<S: Signable + ?Sized>(&self, structure: &S) -> [u8; SIGNATURE_SIZE] {
        self.inner.sign(&structure.canonical_bytes()).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Sign a structure with a raw secret key.
///
/// The key length is checked before the signature primitive is called.
pub fn sign<S: Signable + ?Sized>(
    secret_key: &[u8],
    structure: &S,
) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
    Ok(Keypair::from_seed(secret_key)?.sign(structure))
}

/// Verify a signature over a structure's canonical bytes.
///
/// Never fails: malformed keys or signatures simply verify as `false`.
pub fn verify<S: Signable + ?Sized>(public_key: &[u8], structure: &S, signature: &[u8]) -> bool {
    let Ok(public_key) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
        return false;
    };
    let Ok(signature) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    verifying_key
        .verify(&structure.canonical_bytes(), &signature)
        .is_ok()
}
