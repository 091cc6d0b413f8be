//! Ephemeral identifiers: commitments, reveal checks and rotation.

use crate::error::HandshakeError;
use mesh_crypto::{generic_hash, HashOutput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Commitment to a LUID
pub fn luid_hash(luid: &Uuid) -> HashOutput {
    generic_hash(luid.as_bytes())
}

/// Check a revealed LUID against the commitment received earlier
pub fn verify_luid(commitment: &[u8], luid: &Uuid) -> Result<(), HandshakeError> {
    if luid_hash(luid).as_slice() == commitment {
        Ok(())
    } else {
        Err(HandshakeError::InvalidLuid)
    }
}

/// Count of handshakes in flight; the LUID may only change while it is zero
#[derive(Debug, Clone, Default)]
pub struct TransactionLock {
    in_flight: Arc<AtomicUsize>,
}

impl TransactionLock {
    /// Create an idle lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a transaction as running until the guard drops
    pub fn begin(&self) -> TransactionGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        TransactionGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    /// Number of running transactions
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Held for the lifetime of one handshake
#[derive(Debug)]
pub struct TransactionGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds the local LUID and replaces it between transactions
#[derive(Debug)]
pub struct LuidRotator {
    current: RwLock<Uuid>,
    lock: TransactionLock,
}

impl LuidRotator {
    /// Start with a fresh random LUID
    pub fn new(lock: TransactionLock) -> Self {
        Self {
            current: RwLock::new(Uuid::new_v4()),
            lock,
        }
    }

    /// Current LUID
    pub fn current(&self) -> Uuid {
        *self.current.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Commitment to the current LUID, as advertised during discovery
    pub fn current_hash(&self) -> HashOutput {
        luid_hash(&self.current())
    }

    /// Replace the LUID unless a transaction is running; returns whether it changed
    pub fn rotate(&self) -> bool {
        if self.lock.in_flight() > 0 {
            debug!("LUID rotation skipped: {} transactions in flight", self.lock.in_flight());
            return false;
        }
        let next = Uuid::new_v4();
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = next;
        info!("Rotated LUID");
        true
    }

    /// Rotate on a timer until the task is aborted
    pub fn run(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.rotate();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_luid() {
        let luid = Uuid::new_v4();
        let commitment = luid_hash(&luid);
        assert!(verify_luid(&commitment, &luid).is_ok());
        assert_eq!(
            verify_luid(&commitment, &Uuid::new_v4()),
            Err(HandshakeError::InvalidLuid)
        );
        assert_eq!(verify_luid(&[], &luid), Err(HandshakeError::InvalidLuid));
    }

    #[test]
    fn test_rotation_blocked_in_flight() {
        let lock = TransactionLock::new();
        let rotator = LuidRotator::new(lock.clone());
        let before = rotator.current();

        let guard = lock.begin();
        assert!(!rotator.rotate());
        assert_eq!(rotator.current(), before);

        drop(guard);
        assert_eq!(lock.in_flight(), 0);
        assert!(rotator.rotate());
        assert_ne!(rotator.current(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_rotation() {
        let rotator = Arc::new(LuidRotator::new(TransactionLock::new()));
        let before = rotator.current();
        let task = rotator.clone().run(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_ne!(rotator.current(), before);
        task.abort();
    }
}
