//! Hashing, fingerprints, canonical signing and payload sealing for mesh.
//!
//! Every structure that travels signed (identities, message headers) is reduced
//! to one canonical byte string before it reaches Ed25519. The encoding is
//! defined once in [`canonical`] and reused by every signer and verifier.
//!
//! ## Primitives
//!
//! - **Generic hash**: BLAKE2b-256, used for commitments, fingerprints and
//!   content-chunk hashes
//! - **Signatures**: Ed25519 over canonical bytes; verification never errors
//! - **Sealing**: XChaCha20-Poly1305 with a random nonce prefixed to the
//!   ciphertext

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod error;
pub mod hash;
pub mod seal;
pub mod sign;

pub use canonical::{CanonicalEncoder, Signable};
pub use error::CryptoError;
pub use hash::{generic_hash, generic_hash_multi, Fingerprint, HashOutput, HASH_SIZE};
pub use seal::{open, seal, SealKey, NONCE_SIZE, SEAL_KEY_SIZE};
pub use sign::{sign, verify, Keypair, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE};
