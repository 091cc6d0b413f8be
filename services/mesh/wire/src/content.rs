//! Content packets: identities, declared hashes and message blocks.
//!
//! Identities carry a self-signature over their canonical form. Message
//! headers may carry a signature by the `from` identity over the header's
//! canonical form, which covers the content hash list but not the blocks
//! themselves; blocks are bound to the header by their hashes.

use crate::error::WireError;
use crate::header::BlockFlags;
use crate::packet::{
    check_entries, check_hashes, check_len, invalid, Validate, MAX_BLOCK_SIZE,
    MAX_EXTRA_VALUE_LEN, MAX_MAP_KEY_LEN, MAX_NAME_LEN,
};
use bytes::Bytes;
use mesh_crypto::{
    generic_hash, CanonicalEncoder, Fingerprint, HashOutput, Keypair, Signable, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Self-signed identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPacket {
    /// Display name
    pub name: String,
    /// Ed25519 public key
    pub public_key: Bytes,
    /// Self-signature over the canonical form
    pub signature: Bytes,
    /// Application-defined attributes
    pub extra: BTreeMap<String, Bytes>,
    /// Stream terminator; carries no identity
    pub end: bool,
}

impl IdentityPacket {
    /// Build and self-sign an identity
    pub fn new_signed(keypair: &Keypair, name: impl Into<String>, extra: BTreeMap<String, Bytes>) -> Self {
        let mut identity = Self {
            name: name.into(),
            public_key: Bytes::copy_from_slice(&keypair.public_bytes()),
            signature: Bytes::new(),
            extra,
            end: false,
        };
        identity.signature = Bytes::copy_from_slice(&keypair.sign(&identity));
        identity
    }

    /// Terminator closing an identity stream
    pub fn end_marker() -> Self {
        Self {
            name: String::new(),
            public_key: Bytes::new(),
            signature: Bytes::new(),
            extra: BTreeMap::new(),
            end: true,
        }
    }

    /// Whether the self-signature holds
    pub fn verify(&self) -> bool {
        !self.end && mesh_crypto::verify(&self.public_key, self, &self.signature)
    }

    /// Fingerprint of the identity's public key
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.public_key)
    }
}

impl Signable for IdentityPacket {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = CanonicalEncoder::new().str(&self.name).bytes(&self.public_key);
        for (key, value) in &self.extra {
            enc = enc.str(key).bytes(value);
        }
        enc.finish()
    }
}

impl Validate for IdentityPacket {
    fn validate(&self) -> Result<(), WireError> {
        if self.end {
            return Ok(());
        }
        check_len("identity name", self.name.len(), MAX_NAME_LEN)?;
        if self.public_key.len() != PUBLIC_KEY_SIZE {
            return Err(invalid(format!(
                "public key of {} bytes, expected {PUBLIC_KEY_SIZE}",
                self.public_key.len()
            )));
        }
        if self.signature.len() != SIGNATURE_SIZE {
            return Err(invalid(format!(
                "signature of {} bytes, expected {SIGNATURE_SIZE}",
                self.signature.len()
            )));
        }
        check_entries("extra", self.extra.len())?;
        for (key, value) in &self.extra {
            check_len("extra key", key.len(), MAX_MAP_KEY_LEN)?;
            check_len("extra value", value.len(), MAX_EXTRA_VALUE_LEN)?;
        }
        Ok(())
    }
}

/// Content hashes the sender already holds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeclareHashesPacket {
    /// Message hashes
    pub hashes: Vec<Bytes>,
    /// Sender does not want any content
    pub opt_out: bool,
}

impl DeclareHashesPacket {
    /// Declare a set of held message hashes
    pub fn declare(hashes: Vec<Bytes>) -> Self {
        Self {
            hashes,
            opt_out: false,
        }
    }

    /// Decline all content
    pub fn opt_out() -> Self {
        Self {
            hashes: Vec::new(),
            opt_out: true,
        }
    }

    /// Whether the sender already holds a message
    pub fn contains(&self, message_hash: &[u8]) -> bool {
        self.hashes.iter().any(|h| h.as_ref() == message_hash)
    }
}

impl Validate for DeclareHashesPacket {
    fn validate(&self) -> Result<(), WireError> {
        if self.opt_out && !self.hashes.is_empty() {
            return Err(invalid("opt-out declaration carries hashes"));
        }
        check_hashes("declared hashes", &self.hashes)
    }
}

/// Message header preceding its content blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderPacket {
    /// Author fingerprint
    pub from: Option<Fingerprint>,
    /// Recipient fingerprint
    pub to: Option<Fingerprint>,
    /// Application namespace
    pub application: String,
    /// File extension
    pub extension: String,
    /// MIME type
    pub mime: String,
    /// File name
    pub filename: String,
    /// Header flags
    pub flags: BlockFlags,
    /// Generic hash of each block, in sequence order
    pub hashes: Vec<Bytes>,
    /// Nominal block size in bytes
    pub block_size: u32,
    /// Author signature over the canonical form
    pub signature: Option<Bytes>,
}

impl BlockHeaderPacket {
    /// Unsigned header for content split into `hashes`
    pub fn new(application: impl Into<String>, hashes: Vec<Bytes>, block_size: u32) -> Self {
        Self {
            from: None,
            to: None,
            application: application.into(),
            extension: String::new(),
            mime: String::new(),
            filename: String::new(),
            flags: BlockFlags::empty(),
            hashes,
            block_size,
            signature: None,
        }
    }

    /// Header closing a block stream
    pub fn end_of_stream() -> Self {
        let mut header = Self::new("", Vec::new(), 0);
        header.flags = BlockFlags::END_OF_STREAM;
        header
    }

    /// Whether this header closes the stream
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BlockFlags::END_OF_STREAM)
    }

    /// Whether the content is a file
    pub fn is_file(&self) -> bool {
        self.flags.contains(BlockFlags::IS_FILE)
    }

    /// Message identity: generic hash over the concatenated block hashes
    pub fn message_hash(&self) -> HashOutput {
        let mut all = Vec::with_capacity(self.hashes.len() * mesh_crypto::HASH_SIZE);
        for hash in &self.hashes {
            all.extend_from_slice(hash);
        }
        generic_hash(&all)
    }

    /// Set the author and sign the header
    pub fn sign_with(&mut self, keypair: &Keypair) {
        self.from = Some(keypair.fingerprint());
        self.signature = Some(Bytes::copy_from_slice(&keypair.sign(self)));
    }

    /// Check the signature against the author's public key; unsigned headers fail
    pub fn verify_signature(&self, public_key: &[u8]) -> bool {
        match &self.signature {
            Some(signature) => mesh_crypto::verify(public_key, self, signature),
            None => false,
        }
    }
}

impl Signable for BlockHeaderPacket {
    fn canonical_bytes(&self) -> Vec<u8> {
        CanonicalEncoder::new()
            .fingerprint(self.from.as_ref())
            .fingerprint(self.to.as_ref())
            .str(&self.application)
            .str(&self.extension)
            .str(&self.mime)
            .str(&self.filename)
            .flag(self.is_file())
            .hashes(&self.hashes)
            .finish()
    }
}

impl Validate for BlockHeaderPacket {
    fn validate(&self) -> Result<(), WireError> {
        check_len("application", self.application.len(), MAX_NAME_LEN)?;
        check_len("extension", self.extension.len(), MAX_NAME_LEN)?;
        check_len("mime", self.mime.len(), MAX_NAME_LEN)?;
        check_len("filename", self.filename.len(), MAX_NAME_LEN)?;
        check_hashes("block hashes", &self.hashes)?;
        check_len("block size", self.block_size as usize, MAX_BLOCK_SIZE)?;
        if !self.is_end_of_stream() && !self.hashes.is_empty() && self.block_size == 0 {
            return Err(invalid("zero block size"));
        }
        if let Some(signature) = &self.signature {
            if signature.len() != SIGNATURE_SIZE {
                return Err(invalid(format!(
                    "header signature of {} bytes, expected {SIGNATURE_SIZE}",
                    signature.len()
                )));
            }
        }
        Ok(())
    }
}

/// One content block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSequencePacket {
    /// Zero-based block index
    pub seq: u32,
    /// Block bytes
    pub data: Bytes,
    /// Last block of the message
    pub end: bool,
}

impl Validate for BlockSequencePacket {
    fn validate(&self) -> Result<(), WireError> {
        check_len("block data", self.data.len(), MAX_BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn test_identity_self_signature() {
        let kp = Keypair::generate();
        let mut extra = BTreeMap::new();
        extra.insert("avatar".to_string(), Bytes::from_static(b"\x89PNG"));
        let identity = IdentityPacket::new_signed(&kp, "river", extra);

        assert!(identity.verify());
        assert_eq!(identity.fingerprint(), kp.fingerprint());

        let mut renamed = identity.clone();
        renamed.name = "impostor".to_string();
        assert!(!renamed.verify());

        let mut retagged = identity.clone();
        retagged
            .extra
            .insert("avatar".to_string(), Bytes::from_static(b"GIF8"));
        assert!(!retagged.verify());
    }

    #[test]
    fn test_identity_end_marker() {
        let end = IdentityPacket::end_marker();
        assert!(end.validate().is_ok());
        assert!(!end.verify());

        let mut broken = IdentityPacket::new_signed(&Keypair::generate(), "x", BTreeMap::new());
        broken.public_key = Bytes::from_static(b"short");
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_header_signature() {
        let kp = Keypair::generate();
        let mut header = BlockHeaderPacket::new(
            "chat",
            vec![Bytes::copy_from_slice(&generic_hash(b"hello"))],
            64,
        );
        header.sign_with(&kp);

        assert_eq!(header.from, Some(kp.fingerprint()));
        assert!(header.verify_signature(&kp.public_bytes()));
        assert!(!header.verify_signature(&Keypair::generate().public_bytes()));

        let mut tampered = header.clone();
        tampered.mime = "text/html".to_string();
        assert!(!tampered.verify_signature(&kp.public_bytes()));

        // Size is not part of the signed form.
        let mut resized = header.clone();
        resized.block_size = 128;
        assert!(resized.verify_signature(&kp.public_bytes()));

        let decoded = Packet::decode(&Packet::BlockHeader(header.clone()).encode().unwrap()).unwrap();
        assert_eq!(decoded, Packet::BlockHeader(header));
    }

    #[test]
    fn test_swapped_author_and_recipient_fail() {
        let kp = Keypair::generate();
        let mut header = BlockHeaderPacket::new(
            "chat",
            vec![Bytes::copy_from_slice(&generic_hash(b"hello"))],
            64,
        );
        header.sign_with(&kp);

        let mut swapped = header.clone();
        swapped.to = swapped.from.take();
        assert!(!swapped.verify_signature(&kp.public_bytes()));
    }

    #[test]
    fn test_message_hash_depends_on_order() {
        let a = Bytes::copy_from_slice(&generic_hash(b"a"));
        let b = Bytes::copy_from_slice(&generic_hash(b"b"));
        let ab = BlockHeaderPacket::new("chat", vec![a.clone(), b.clone()], 1);
        let ba = BlockHeaderPacket::new("chat", vec![b, a], 1);
        assert_ne!(ab.message_hash(), ba.message_hash());
    }

    #[test]
    fn test_declare_rules() {
        let h = Bytes::copy_from_slice(&generic_hash(b"x"));
        let declared = DeclareHashesPacket::declare(vec![h.clone()]);
        assert!(declared.validate().is_ok());
        assert!(declared.contains(&h));

        let confused = DeclareHashesPacket {
            hashes: vec![h],
            opt_out: true,
        };
        assert!(confused.validate().is_err());
        assert!(DeclareHashesPacket::opt_out().validate().is_ok());
    }

    #[test]
    fn test_block_bounds() {
        let big = BlockSequencePacket {
            seq: 0,
            data: Bytes::from(vec![0u8; MAX_BLOCK_SIZE + 1]),
            end: true,
        };
        assert!(big.validate().is_err());
        assert!(BlockHeaderPacket::end_of_stream().validate().is_ok());
    }
}
