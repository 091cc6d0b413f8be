//! Message store collaborator for mesh: messages, identities and declared hashes.
//!
//! The handshake never owns content; it pulls random batches to offer a peer
//! and pushes whatever the peer sends back through the [`MessageStore`] trait.
//! Backends decide persistence. An in-memory backend is provided for nodes
//! without a database and for tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use mesh_crypto::{Fingerprint, HashOutput};
use mesh_wire::{BlockHeaderPacket, BlockSequencePacket, Chunker, DeclareHashesPacket, IdentityPacket};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Content does not match the header's hash list
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation or argument
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A message as held by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Header, possibly signed
    pub header: BlockHeaderPacket,
    /// Reassembled content
    pub content: Bytes,
}

impl StoredMessage {
    /// Message identity
    pub fn message_hash(&self) -> HashOutput {
        self.header.message_hash()
    }

    /// Split the content back into the blocks the header describes
    pub fn blocks(&self) -> Vec<BlockSequencePacket> {
        Chunker::new(self.header.block_size as usize)
            .chunk(&self.content)
            .1
    }
}

/// Content store used by the handshake's content stages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message; returns `false` if it was already held
    async fn insert_message(
        &self,
        header: BlockHeaderPacket,
        content: Bytes,
    ) -> Result<bool, StoreError>;

    /// Up to `n` random messages whose hashes are not in `exclude`
    async fn top_random_messages(
        &self,
        n: usize,
        exclude: &[Bytes],
    ) -> BoxStream<'static, StoredMessage>;

    /// Store a verified identity; returns `false` if it was already held
    async fn insert_identity(&self, identity: IdentityPacket) -> Result<bool, StoreError>;

    /// Up to `n` random identities
    async fn top_random_identities(&self, n: usize) -> BoxStream<'static, IdentityPacket>;

    /// Look up an identity by public-key fingerprint
    async fn find_identity(&self, fingerprint: &Fingerprint) -> Option<IdentityPacket>;

    /// Hashes of every held message, as offered to a peer
    async fn declare_hashes_snapshot(&self) -> DeclareHashesPacket;
}

pub use backend::mem::MemoryStore;
