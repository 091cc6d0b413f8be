//! Streaming reassembly buffer.
//!
//! Bridges a push-driven producer (GATT notifications, socket reads) to the
//! pull-driven frame decoder. The ring holds `capacity + 1` bytes so that a
//! full buffer and an empty buffer have distinct cursor positions.
//!
//! One mutex guards both cursors. Every append, completion and failure adds a
//! permit to a counting semaphore that wakes a consumer blocked in
//! [`ReassemblyBuffer::get`]; the consumer re-checks the cursors after each
//! wake, so surplus permits only cost a spurious re-check.

use crate::error::WireError;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};
use tracing::trace;

/// Default reassembly capacity (1 MiB)
pub const DEFAULT_REASSEMBLY_CAPACITY: usize = 1024 * 1024;

/// Pull-side byte stream consumed by the frame decoder
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Fill `dest` completely, suspending until enough bytes arrive.
    ///
    /// Returns fewer bytes than requested only once the producer has
    /// completed the stream.
    async fn get(&self, dest: &mut [u8]) -> Result<usize, WireError>;
}

struct RingState {
    store: Box<[u8]>,
    read: usize,
    write: usize,
    complete: bool,
    error: Option<String>,
}

impl RingState {
    fn used(&self) -> usize {
        (self.write + self.store.len() - self.read) % self.store.len()
    }

    fn push(&mut self, bytes: &[u8]) {
        let len = self.store.len();
        let first = bytes.len().min(len - self.write);
        self.store[self.write..self.write + first].copy_from_slice(&bytes[..first]);
        self.store[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.write = (self.write + bytes.len()) % len;
    }

    fn pop(&mut self, dest: &mut [u8]) {
        let len = self.store.len();
        let first = dest.len().min(len - self.read);
        let n = dest.len();
        dest[..first].copy_from_slice(&self.store[self.read..self.read + first]);
        dest[first..].copy_from_slice(&self.store[..n - first]);
        self.read = (self.read + n) % len;
    }
}

/// Fixed-capacity single-producer/single-consumer byte ring
pub struct ReassemblyBuffer {
    state: Mutex<RingState>,
    data_ready: Semaphore,
    space_ready: Notify,
    capacity: usize,
}

impl ReassemblyBuffer {
    /// Create a buffer able to hold `capacity` unread bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                store: vec![0u8; capacity + 1].into_boxed_slice(),
                read: 0,
                write: 0,
                complete: false,
                error: None,
            }),
            data_ready: Semaphore::new(0),
            space_ready: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        // A panic while holding the lock cannot leave the cursors torn:
        // every mutation completes before the guard drops.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Maximum number of unread bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unread bytes currently buffered
    pub fn len(&self) -> usize {
        self.lock().used()
    }

    /// Whether no unread bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free space in bytes
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    /// Whether the producer has completed or failed the stream
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.complete || state.error.is_some()
    }

    /// Append bytes; fails without modifying the buffer if they do not fit
    pub fn put(&self, bytes: &[u8]) -> Result<(), WireError> {
        {
            let mut state = self.lock();
            if state.complete || state.error.is_some() {
                return Err(WireError::Closed);
            }
            let free = self.capacity - state.used();
            if bytes.len() > free {
                return Err(WireError::Overflow {
                    needed: bytes.len(),
                    free,
                });
            }
            state.push(bytes);
        }
        trace!("Reassembly put {} bytes", bytes.len());
        self.data_ready.add_permits(1);
        Ok(())
    }

    /// Append bytes, waiting for the consumer to free enough space
    pub async fn put_when_free(&self, bytes: &[u8]) -> Result<(), WireError> {
        if bytes.len() > self.capacity {
            return Err(WireError::Overflow {
                needed: bytes.len(),
                free: self.capacity,
            });
        }
        loop {
            let notified = self.space_ready.notified();
            match self.put(bytes) {
                Err(WireError::Overflow { .. }) => notified.await,
                other => return other,
            }
        }
    }

    /// Signal end of stream; a blocked consumer drains what is left
    pub fn complete(&self) {
        self.lock().complete = true;
        self.data_ready.add_permits(1);
        self.space_ready.notify_waiters();
    }

    /// Signal a producer failure; propagated to the consumer
    pub fn fail(&self, reason: impl Into<String>) {
        self.lock().error = Some(reason.into());
        self.data_ready.add_permits(1);
        self.space_ready.notify_waiters();
    }

    /// Read a single byte
    pub async fn read(&self) -> Result<u8, WireError> {
        let mut byte = [0u8; 1];
        match self.get(&mut byte).await? {
            1 => Ok(byte[0]),
            _ => Err(WireError::Closed),
        }
    }

    /// Discard `n` bytes
    pub async fn skip(&self, n: usize) -> Result<(), WireError> {
        let mut scratch = [0u8; 256];
        let mut remaining = n;
        while remaining > 0 {
            let step = remaining.min(scratch.len());
            let got = self.get(&mut scratch[..step]).await?;
            if got < step {
                return Err(WireError::Closed);
            }
            remaining -= step;
        }
        Ok(())
    }
}

#[async_trait]
impl ByteSource for ReassemblyBuffer {
    async fn get(&self, dest: &mut [u8]) -> Result<usize, WireError> {
        // Requests larger than the ring can never be satisfied in one piece.
        if dest.len() > self.capacity {
            let mut filled = 0;
            while filled < dest.len() {
                let step = (dest.len() - filled).min(self.capacity);
                let got = self.get(&mut dest[filled..filled + step]).await?;
                filled += got;
                if got < step {
                    break;
                }
            }
            return Ok(filled);
        }

        loop {
            {
                let mut state = self.lock();
                let available = state.used();
                if available >= dest.len() {
                    state.pop(dest);
                    drop(state);
                    self.space_ready.notify_waiters();
                    return Ok(dest.len());
                }
                if let Some(reason) = &state.error {
                    return Err(WireError::Stream(reason.clone()));
                }
                if state.complete {
                    state.pop(&mut dest[..available]);
                    return Ok(available);
                }
            }
            self.data_ready
                .acquire()
                .await
                .map_err(|_| WireError::Closed)?
                .forget();
        }
    }
}

impl std::fmt::Debug for ReassemblyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassemblyBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_get() {
        let buf = ReassemblyBuffer::new(8);
        buf.put(b"abcd").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(buf.get(&mut out).await.unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_wraparound() {
        let buf = ReassemblyBuffer::new(8);
        let mut out = [0u8; 6];
        buf.put(b"123456").unwrap();
        buf.get(&mut out).await.unwrap();
        buf.put(b"abcdefgh").unwrap();
        assert_eq!(buf.free(), 0);

        let mut out = [0u8; 8];
        buf.get(&mut out).await.unwrap();
        assert_eq!(&out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_overflow_leaves_contents_unchanged() {
        let buf = ReassemblyBuffer::new(8);
        buf.put(b"12345").unwrap();
        let err = buf.put(b"abcd").unwrap_err();
        assert_eq!(err, WireError::Overflow { needed: 4, free: 3 });
        assert_eq!(buf.len(), 5);

        let mut out = [0u8; 5];
        buf.get(&mut out).await.unwrap();
        assert_eq!(&out, b"12345");
    }

    #[tokio::test]
    async fn test_get_blocks_until_enough() {
        let buf = Arc::new(ReassemblyBuffer::new(16));
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 6];
                let n = buf.get(&mut out).await.unwrap();
                (n, out)
            })
        };

        buf.put(b"abc").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        buf.put(b"def").unwrap();
        let (n, out) = reader.await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(&out, b"abcdef");
    }

    #[tokio::test]
    async fn test_short_read_after_complete() {
        let buf = ReassemblyBuffer::new(16);
        buf.put(b"ab").unwrap();
        buf.complete();

        let mut out = [0u8; 4];
        assert_eq!(buf.get(&mut out).await.unwrap(), 2);
        assert_eq!(&out[..2], b"ab");
        assert_eq!(buf.read().await, Err(WireError::Closed));
        assert_eq!(buf.put(b"x"), Err(WireError::Closed));
    }

    #[tokio::test]
    async fn test_error_propagates() {
        let buf = Arc::new(ReassemblyBuffer::new(16));
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.read().await })
        };
        buf.fail("gatt disconnected");
        assert_eq!(
            reader.await.unwrap(),
            Err(WireError::Stream("gatt disconnected".to_string()))
        );
    }

    #[tokio::test]
    async fn test_read_and_skip() {
        let buf = ReassemblyBuffer::new(600);
        buf.put(&[0u8; 500]).unwrap();
        buf.put(b"z").unwrap();
        buf.skip(500).await.unwrap();
        assert_eq!(buf.read().await.unwrap(), b'z');
    }

    #[tokio::test]
    async fn test_put_when_free_waits_for_consumer() {
        let buf = Arc::new(ReassemblyBuffer::new(4));
        buf.put(b"1234").unwrap();

        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.put_when_free(b"56").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        let mut out = [0u8; 2];
        buf.get(&mut out).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(buf.len(), 4);

        assert!(matches!(
            buf.put_when_free(b"too long").await,
            Err(WireError::Overflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_larger_than_capacity() {
        let buf = Arc::new(ReassemblyBuffer::new(4));
        let producer = {
            let buf = buf.clone();
            tokio::spawn(async move {
                for chunk in b"0123456789".chunks(3) {
                    buf.put_when_free(chunk).await.unwrap();
                }
            })
        };
        let mut out = [0u8; 10];
        assert_eq!(buf.get(&mut out).await.unwrap(), 10);
        assert_eq!(&out, b"0123456789");
        producer.await.unwrap();
    }
}
