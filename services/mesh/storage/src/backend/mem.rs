//! In-memory message store for development and testing

use crate::{MessageStore, StoreError, StoredMessage};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use mesh_crypto::{Fingerprint, HashOutput};
use mesh_wire::packet::MAX_HASHES;
use mesh_wire::{BlockHeaderPacket, Chunker, DeclareHashesPacket, IdentityPacket};
use rand::seq::IteratorRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// In-memory store keyed by message hash and identity fingerprint
#[derive(Clone, Default)]
pub struct MemoryStore {
    /// message hash -> message
    messages: Arc<DashMap<HashOutput, StoredMessage>>,
    /// fingerprint -> identity
    identities: Arc<DashMap<Fingerprint, IdentityPacket>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of held messages
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of held identities
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Whether a message is held
    pub fn contains_message(&self, hash: &HashOutput) -> bool {
        self.messages.contains_key(hash)
    }

    /// Fetch a held message
    pub fn get_message(&self, hash: &HashOutput) -> Option<StoredMessage> {
        self.messages.get(hash).map(|m| m.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(
        &self,
        header: BlockHeaderPacket,
        content: Bytes,
    ) -> Result<bool, StoreError> {
        if header.is_end_of_stream() {
            return Err(StoreError::Invalid("end-of-stream header".to_string()));
        }

        let (hashes, _) = Chunker::new(header.block_size as usize).chunk(&content);
        if hashes != header.hashes {
            return Err(StoreError::Corruption(
                "content does not match header hashes".to_string(),
            ));
        }

        let hash = header.message_hash();
        if self.messages.contains_key(&hash) {
            debug!("Message {} already held", hex(&hash));
            return Ok(false);
        }

        debug!(
            "Storing message {} ({} bytes, app={})",
            hex(&hash),
            content.len(),
            header.application
        );
        self.messages.insert(hash, StoredMessage { header, content });
        Ok(true)
    }

    async fn top_random_messages(
        &self,
        n: usize,
        exclude: &[Bytes],
    ) -> BoxStream<'static, StoredMessage> {
        let excluded: HashSet<&[u8]> = exclude.iter().map(|h| h.as_ref()).collect();
        let picked = self
            .messages
            .iter()
            .filter(|entry| !excluded.contains(&entry.key().as_slice()))
            .map(|entry| entry.value().clone())
            .choose_multiple(&mut rand::thread_rng(), n);
        stream::iter(picked).boxed()
    }

    async fn insert_identity(&self, identity: IdentityPacket) -> Result<bool, StoreError> {
        if !identity.verify() {
            return Err(StoreError::Invalid("identity self-signature invalid".to_string()));
        }
        let fingerprint = identity.fingerprint();
        if self.identities.contains_key(&fingerprint) {
            return Ok(false);
        }
        debug!("Storing identity {} ({})", fingerprint, identity.name);
        self.identities.insert(fingerprint, identity);
        Ok(true)
    }

    async fn top_random_identities(&self, n: usize) -> BoxStream<'static, IdentityPacket> {
        let picked = self
            .identities
            .iter()
            .map(|entry| entry.value().clone())
            .choose_multiple(&mut rand::thread_rng(), n);
        stream::iter(picked).boxed()
    }

    async fn find_identity(&self, fingerprint: &Fingerprint) -> Option<IdentityPacket> {
        self.identities.get(fingerprint).map(|i| i.clone())
    }

    async fn declare_hashes_snapshot(&self) -> DeclareHashesPacket {
        let hashes = self
            .messages
            .iter()
            .take(MAX_HASHES)
            .map(|entry| Bytes::copy_from_slice(entry.key()))
            .collect();
        DeclareHashesPacket::declare(hashes)
    }
}

fn hex(hash: &HashOutput) -> String {
    hash[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::Keypair;
    use std::collections::BTreeMap;

    fn message(text: &'static str) -> (BlockHeaderPacket, Bytes) {
        let content = Bytes::from_static(text.as_bytes());
        let (hashes, _) = Chunker::new(8).chunk(&content);
        (BlockHeaderPacket::new("chat", hashes, 8), content)
    }

    #[tokio::test]
    async fn test_insert_dedups_by_hash() {
        let store = MemoryStore::new();
        let (header, content) = message("hello mesh");

        assert!(store.insert_message(header.clone(), content.clone()).await.unwrap());
        assert!(!store.insert_message(header.clone(), content).await.unwrap());
        assert_eq!(store.message_count(), 1);
        assert!(store.contains_message(&header.message_hash()));
    }

    #[tokio::test]
    async fn test_insert_rejects_mismatched_content() {
        let store = MemoryStore::new();
        let (header, _) = message("hello mesh");
        let result = store
            .insert_message(header, Bytes::from_static(b"goodbye mesh"))
            .await;
        assert!(matches!(result, Err(StoreError::Corruption(_))));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_random_messages_exclude() {
        let store = MemoryStore::new();
        let (first, c1) = message("first");
        let (second, c2) = message("second");
        store.insert_message(first.clone(), c1).await.unwrap();
        store.insert_message(second.clone(), c2).await.unwrap();

        let exclude = vec![Bytes::copy_from_slice(&first.message_hash())];
        let picked: Vec<_> = store.top_random_messages(10, &exclude).await.collect().await;
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].header, second);
        assert_eq!(picked[0].blocks().len(), 1);

        let limited: Vec<_> = store.top_random_messages(1, &[]).await.collect().await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_declare_snapshot() {
        let store = MemoryStore::new();
        let (header, content) = message("declared");
        store.insert_message(header.clone(), content).await.unwrap();

        let declared = store.declare_hashes_snapshot().await;
        assert!(!declared.opt_out);
        assert!(declared.contains(&header.message_hash()));
    }

    #[tokio::test]
    async fn test_identities() {
        let store = MemoryStore::new();
        let kp = Keypair::generate();
        let identity = IdentityPacket::new_signed(&kp, "harbor", BTreeMap::new());

        assert!(store.insert_identity(identity.clone()).await.unwrap());
        assert!(!store.insert_identity(identity.clone()).await.unwrap());
        assert_eq!(store.find_identity(&kp.fingerprint()).await, Some(identity));
        assert_eq!(store.find_identity(&Keypair::generate().fingerprint()).await, None);

        let mut forged = IdentityPacket::new_signed(&Keypair::generate(), "forged", BTreeMap::new());
        forged.name = "harbor".to_string();
        assert!(store.insert_identity(forged).await.is_err());

        let all: Vec<_> = store.top_random_identities(5).await.collect().await;
        assert_eq!(all.len(), 1);
    }
}
