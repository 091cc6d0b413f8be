//! Wire protocol for the mesh handshake: framing, reassembly, packets and chunking.
//!
//! Bearers deliver bytes in arbitrary pieces; a [`ReassemblyBuffer`] collects
//! them and the [`FrameCodec`] cuts whole frames back out. Each frame payload
//! is one tagged [`Packet`].
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 length (BE)      | length of the payload      |
//! +----------------------+----------------------------+
//! | u8 packet tag        | see `PacketType`           |
//! +----------------------+----------------------------+
//! | body                 | CBOR, per-variant schema   |
//! +----------------------+----------------------------+
//! | u32 crc32 (BE)       | CRC32 of tag + body        |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod codec;
pub mod content;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod packet;
pub mod ring;

// Re-export main types
pub use chunk::{Chunker, Reassembler, DEFAULT_BLOCK_SIZE};
pub use codec::{get_meta_str, get_meta_u32, open_packet, seal_packet, MetaBuilder};
pub use content::{BlockHeaderPacket, BlockSequencePacket, DeclareHashesPacket, IdentityPacket};
pub use error::WireError;
pub use frame::{FrameCodec, DEFAULT_MAX_FRAME_SIZE, FRAME_OVERHEAD, HARD_MAX_FRAME_SIZE};
pub use handshake::{
    AckPacket, AdvertisePacket, Band, Capability, ElectLeaderPacket, ElectionReveal, LuidPacket,
    Role, UpgradePacket,
};
pub use header::{AckStatus, BlockFlags, PacketType, PROTOCOL_VERSION};
pub use packet::{Packet, TypedPacket, Validate};
pub use ring::{ByteSource, ReassemblyBuffer, DEFAULT_REASSEMBLY_CAPACITY};
