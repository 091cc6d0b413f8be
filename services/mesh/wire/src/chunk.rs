//! Message chunking into hashed content blocks.
//!
//! Content is split into fixed-size blocks; the header carries the generic
//! hash of every block so the receiver can check each block as it arrives.

use crate::content::{BlockHeaderPacket, BlockSequencePacket};
use crate::error::WireError;
use crate::packet::MAX_BLOCK_SIZE;
use bytes::{Bytes, BytesMut};
use mesh_crypto::generic_hash;

/// Default block size, small enough for a BLE-sized reassembly buffer
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Splits content into hashed blocks
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    block_size: usize,
}

impl Chunker {
    /// Create a chunker; the block size is clamped to the wire bound
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.clamp(1, MAX_BLOCK_SIZE),
        }
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Split content into blocks, returning the per-block hashes
    pub fn chunk(&self, content: &Bytes) -> (Vec<Bytes>, Vec<BlockSequencePacket>) {
        if content.is_empty() {
            let block = BlockSequencePacket {
                seq: 0,
                data: Bytes::new(),
                end: true,
            };
            return (vec![Bytes::copy_from_slice(&generic_hash(&[]))], vec![block]);
        }

        let total = content.len().div_ceil(self.block_size);
        let mut hashes = Vec::with_capacity(total);
        let mut blocks = Vec::with_capacity(total);

        for (seq, start) in (0..content.len()).step_by(self.block_size).enumerate() {
            let end = (start + self.block_size).min(content.len());
            let data = content.slice(start..end);
            hashes.push(Bytes::copy_from_slice(&generic_hash(&data)));
            blocks.push(BlockSequencePacket {
                seq: seq as u32,
                data,
                end: seq + 1 == total,
            });
        }

        (hashes, blocks)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

/// Collects the blocks of one message, checking each against its header hash.
///
/// Every block except the last must be exactly `block_size` bytes and none
/// may exceed it, so the content can never outgrow what the header declares.
#[derive(Debug)]
pub struct Reassembler {
    hashes: Vec<Bytes>,
    block_size: usize,
    max_content: usize,
    next: u32,
    content: BytesMut,
    done: bool,
}

impl Reassembler {
    /// Start reassembling the message described by `header`
    pub fn new(header: &BlockHeaderPacket) -> Self {
        Self {
            hashes: header.hashes.clone(),
            block_size: header.block_size as usize,
            max_content: usize::MAX,
            next: 0,
            content: BytesMut::new(),
            done: false,
        }
    }

    /// Start reassembling, refusing content larger than `max_content` bytes.
    ///
    /// Fails up front when the full blocks the header implies already exceed
    /// the limit.
    pub fn with_limit(header: &BlockHeaderPacket, max_content: usize) -> Result<Self, WireError> {
        let full_blocks = header.hashes.len().saturating_sub(1);
        let least = full_blocks.saturating_mul(header.block_size as usize);
        if least > max_content {
            return Err(WireError::Validation(format!(
                "message of at least {least} bytes exceeds limit of {max_content}"
            )));
        }
        Ok(Self {
            max_content,
            ..Self::new(header)
        })
    }

    /// Whether the final block has been accepted
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Accept the next block; yields the whole content on the final one
    pub fn push(&mut self, block: BlockSequencePacket) -> Result<Option<Bytes>, WireError> {
        if self.done {
            return Err(WireError::Validation("block after end of message".to_string()));
        }
        if block.seq != self.next {
            return Err(WireError::Validation(format!(
                "block {} out of order, expected {}",
                block.seq, self.next
            )));
        }
        if block.data.len() > self.block_size {
            return Err(WireError::Validation(format!(
                "block {} of {} bytes exceeds block size {}",
                block.seq,
                block.data.len(),
                self.block_size
            )));
        }
        if !block.end && block.data.len() < self.block_size {
            return Err(WireError::Validation(format!(
                "short block {} of {} bytes before the end",
                block.seq,
                block.data.len()
            )));
        }
        if self.content.len() + block.data.len() > self.max_content {
            return Err(WireError::Validation(format!(
                "message exceeds limit of {} bytes",
                self.max_content
            )));
        }

        let expected = self
            .hashes
            .get(block.seq as usize)
            .ok_or_else(|| WireError::Validation(format!("block {} has no header hash", block.seq)))?;
        if generic_hash(&block.data).as_slice() != expected.as_ref() {
            return Err(WireError::Integrity);
        }

        self.content.extend_from_slice(&block.data);
        self.next += 1;

        if block.end {
            if self.next as usize != self.hashes.len() {
                return Err(WireError::Validation(format!(
                    "message ended after {} of {} blocks",
                    self.next,
                    self.hashes.len()
                )));
            }
            self.done = true;
            return Ok(Some(std::mem::take(&mut self.content).freeze()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(hashes: Vec<Bytes>, block_size: usize) -> BlockHeaderPacket {
        BlockHeaderPacket::new("test", hashes, block_size as u32)
    }

    #[test]
    fn test_chunk_and_reassemble() {
        let content = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<_>>());
        let chunker = Chunker::new(4096);
        let (hashes, blocks) = chunker.chunk(&content);

        assert_eq!(hashes.len(), 3);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[2].end);
        assert!(!blocks[0].end);

        let mut reassembler = Reassembler::new(&header_for(hashes, 4096));
        assert_eq!(reassembler.push(blocks[0].clone()).unwrap(), None);
        assert_eq!(reassembler.push(blocks[1].clone()).unwrap(), None);
        assert_eq!(reassembler.push(blocks[2].clone()).unwrap(), Some(content));
        assert!(reassembler.is_done());
    }

    #[test]
    fn test_empty_content_is_one_block() {
        let (hashes, blocks) = Chunker::default().chunk(&Bytes::new());
        assert_eq!(hashes.len(), 1);
        let mut reassembler = Reassembler::new(&header_for(hashes, DEFAULT_BLOCK_SIZE));
        assert_eq!(
            reassembler.push(blocks[0].clone()).unwrap(),
            Some(Bytes::new())
        );
    }

    #[test]
    fn test_tampered_block() {
        let content = Bytes::from_static(b"the quick brown fox");
        let (hashes, mut blocks) = Chunker::new(8).chunk(&content);
        blocks[1].data = Bytes::from_static(b"jumps ov");

        let mut reassembler = Reassembler::new(&header_for(hashes, 8));
        reassembler.push(blocks[0].clone()).unwrap();
        assert_eq!(reassembler.push(blocks[1].clone()), Err(WireError::Integrity));
    }

    #[test]
    fn test_out_of_order_block() {
        let content = Bytes::from_static(b"the quick brown fox");
        let (hashes, blocks) = Chunker::new(8).chunk(&content);
        let mut reassembler = Reassembler::new(&header_for(hashes, 8));
        assert!(matches!(
            reassembler.push(blocks[1].clone()),
            Err(WireError::Validation(_))
        ));
    }

    #[test]
    fn test_block_length_must_match_header() {
        let content = Bytes::from_static(b"the quick brown fox");
        let (hashes, blocks) = Chunker::new(8).chunk(&content);

        // Header claims smaller blocks than were sent.
        let mut reassembler = Reassembler::new(&header_for(hashes.clone(), 4));
        assert!(matches!(
            reassembler.push(blocks[0].clone()),
            Err(WireError::Validation(_))
        ));

        // A short block that is not the last one.
        let short = BlockSequencePacket {
            seq: 0,
            data: Bytes::from_static(b"the"),
            end: false,
        };
        let mut reassembler = Reassembler::new(&header_for(
            vec![Bytes::copy_from_slice(&generic_hash(b"the")), hashes[1].clone()],
            8,
        ));
        assert!(matches!(reassembler.push(short), Err(WireError::Validation(_))));
    }

    #[test]
    fn test_content_limit() {
        let content = Bytes::from(vec![5u8; 40]);
        let (hashes, blocks) = Chunker::new(8).chunk(&content);
        let header = header_for(hashes, 8);

        // Four full blocks already exceed 16 bytes.
        assert!(matches!(
            Reassembler::with_limit(&header, 16),
            Err(WireError::Validation(_))
        ));

        // The lower bound fits but the final block does not.
        let mut reassembler = Reassembler::with_limit(&header, 35).unwrap();
        for block in &blocks[..4] {
            assert_eq!(reassembler.push(block.clone()).unwrap(), None);
        }
        assert!(matches!(
            reassembler.push(blocks[4].clone()),
            Err(WireError::Validation(_))
        ));

        let mut reassembler = Reassembler::with_limit(&header, 40).unwrap();
        let mut out = None;
        for block in blocks {
            out = reassembler.push(block).unwrap();
        }
        assert_eq!(out, Some(content));
    }

    #[test]
    fn test_block_size_clamped() {
        assert_eq!(Chunker::new(0).block_size(), 1);
        assert_eq!(Chunker::new(usize::MAX).block_size(), MAX_BLOCK_SIZE);
    }
}
