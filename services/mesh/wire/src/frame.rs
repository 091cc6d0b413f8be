//! Length-prefixed, CRC32-checked frames.
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 length (BE)      | payload byte count         |
//! +----------------------+----------------------------+
//! | payload              | length bytes               |
//! +----------------------+----------------------------+
//! | u32 crc32 (BE)       | CRC32 of payload           |
//! +----------------------+----------------------------+
//! ```

use crate::error::WireError;
use crate::ring::ByteSource;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Default frame cap (512 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024;
/// Hard frame cap (16 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Bytes added around every payload
pub const FRAME_OVERHEAD: usize = 8;

/// Frame encoder/decoder
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default cap
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom cap, clamped to [`HARD_MAX_FRAME_SIZE`]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Configured frame cap
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a payload into a frame
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, WireError> {
        if payload.len() > self.max_frame_size {
            return Err(WireError::OversizeFrame(payload.len(), self.max_frame_size));
        }

        let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.put_u32(crc32fast::hash(payload));
        Ok(buf.freeze())
    }

    /// Decode one frame from a byte source, suspending until it is complete
    pub async fn decode<S: ByteSource + ?Sized>(&self, source: &S) -> Result<Bytes, WireError> {
        let mut len_buf = [0u8; 4];
        read_exact(source, &mut len_buf).await?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Err(WireError::OversizeFrame(len, self.max_frame_size));
        }

        let mut payload = vec![0u8; len];
        read_exact(source, &mut payload).await?;

        let mut crc_buf = [0u8; 4];
        read_exact(source, &mut crc_buf).await?;

        if u32::from_be_bytes(crc_buf) != crc32fast::hash(&payload) {
            return Err(WireError::Integrity);
        }

        trace!("Decoded frame of {} bytes", len);
        Ok(Bytes::from(payload))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_exact<S: ByteSource + ?Sized>(source: &S, dest: &mut [u8]) -> Result<(), WireError> {
    let n = source.get(dest).await?;
    if n < dest.len() {
        return Err(WireError::Closed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ReassemblyBuffer;
    use proptest::prelude::*;

    async fn decode_bytes(codec: &FrameCodec, wire: &[u8]) -> Result<Bytes, WireError> {
        let buf = ReassemblyBuffer::new(wire.len() + 16);
        buf.put(wire).unwrap();
        buf.complete();
        codec.decode(&buf).await
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let codec = FrameCodec::new();
        let wire = codec.encode(b"abc").unwrap();
        assert_eq!(&wire[..4], &3u32.to_be_bytes());
        assert_eq!(&wire[4..7], b"abc");
        assert_eq!(&wire[7..], &crc32fast::hash(b"abc").to_be_bytes());
    }

    #[tokio::test]
    async fn test_oversize_rejected() {
        let codec = FrameCodec::with_max_frame_size(16);
        assert!(matches!(
            codec.encode(&[0u8; 17]),
            Err(WireError::OversizeFrame(17, 16))
        ));

        let mut wire = Vec::new();
        wire.extend_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(
            decode_bytes(&codec, &wire).await,
            Err(WireError::OversizeFrame(1000, 16))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed() {
        let codec = FrameCodec::new();
        let wire = codec.encode(b"hello world").unwrap();
        assert_eq!(
            decode_bytes(&codec, &wire[..wire.len() - 2]).await,
            Err(WireError::Closed)
        );
    }

    #[tokio::test]
    async fn test_decode_across_partial_puts() {
        let codec = FrameCodec::new();
        let wire = codec.encode(b"split across several notifications").unwrap();
        let buf = std::sync::Arc::new(ReassemblyBuffer::new(64));

        let producer = {
            let buf = buf.clone();
            let wire = wire.clone();
            tokio::spawn(async move {
                for piece in wire.chunks(5) {
                    buf.put_when_free(piece).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let payload = codec.decode(buf.as_ref()).await.unwrap();
        producer.await.unwrap();
        assert_eq!(&payload[..], b"split across several notifications");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let codec = FrameCodec::new();
            let wire = codec.encode(&payload).unwrap();
            let decoded = runtime().block_on(decode_bytes(&codec, &wire)).unwrap();
            prop_assert_eq!(&decoded[..], &payload[..]);
        }

        #[test]
        fn prop_bit_flip_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            pos in any::<proptest::sample::Index>(),
            bit in 0u8..8,
        ) {
            let codec = FrameCodec::new();
            let mut wire = codec.encode(&payload).unwrap().to_vec();
            // Flip a bit anywhere after the length prefix.
            let idx = 4 + pos.index(wire.len() - 4);
            wire[idx] ^= 1 << bit;
            let result = runtime().block_on(decode_bytes(&codec, &wire));
            prop_assert_eq!(result, Err(WireError::Integrity));
        }
    }
}
