//! Bounded pool of bearer channels.
//!
//! A stage holds one channel while its steps run. The pool caps how many
//! remotes are served at once and never lets two stages for the same
//! remote hold channels together.

use crate::error::HandshakeError;
use crate::session::RemoteId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Shared channel pool
#[derive(Debug, Clone)]
pub struct ChannelPool {
    permits: Arc<Semaphore>,
    per_remote: Arc<DashMap<RemoteId, Arc<Mutex<()>>>>,
    max_channels: usize,
}

/// A held channel; released on drop
#[derive(Debug)]
pub struct ChannelGuard {
    _remote: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl ChannelPool {
    /// Create a pool of `max_channels` channels
    pub fn new(max_channels: usize) -> Self {
        let max_channels = max_channels.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_channels)),
            per_remote: Arc::new(DashMap::new()),
            max_channels,
        }
    }

    /// Wait for a channel to `remote`
    pub async fn acquire(&self, remote: &RemoteId) -> Result<ChannelGuard, HandshakeError> {
        let lock = self
            .per_remote
            .entry(remote.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let remote_guard = lock.lock_owned().await;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HandshakeError::Disposed)?;
        trace!("Channel acquired for {} ({} free)", remote, self.available());
        Ok(ChannelGuard {
            _remote: remote_guard,
            _permit: permit,
        })
    }

    /// Channels not currently held
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pool size
    pub fn capacity(&self) -> usize {
        self.max_channels
    }

    /// Drop the per-remote lock of a finished remote
    pub fn forget(&self, remote: &RemoteId) {
        self.per_remote
            .remove_if(remote, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded() {
        let pool = ChannelPool::new(2);
        let a = pool.acquire(&"a".into()).await.unwrap();
        let _b = pool.acquire(&"b".into()).await.unwrap();
        assert_eq!(pool.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&"c".into())).await;
        assert!(blocked.is_err());

        drop(a);
        assert_eq!(pool.available(), 1);
        let _c = pool.acquire(&"c".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_channel_per_remote() {
        let pool = ChannelPool::new(4);
        let held = pool.acquire(&"a".into()).await.unwrap();

        let second = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&"a".into())).await;
        assert!(second.is_err());
        assert_eq!(pool.available(), 3);

        drop(held);
        let _again = pool.acquire(&"a".into()).await.unwrap();
        pool.forget(&"a".into());
    }
}
