//! Packet type tags, ack status codes and block flags.
//!
//! Every frame payload starts with a one-byte [`PacketType`] tag followed by
//! the CBOR body of that variant.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Handshake protocol version carried in cleartext LUID packets
pub const PROTOCOL_VERSION: u32 = 1;

/// Packet type tags as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Capability advertisement
    Advertise = 0x01,
    /// Ephemeral identifier (hashed or clear)
    Luid = 0x02,
    /// Leader election commitment or reveal
    ElectLeader = 0x03,
    /// Bearer upgrade rendezvous parameters
    Upgrade = 0x04,
    /// Signed identity
    Identity = 0x05,
    /// Content hashes already held
    DeclareHashes = 0x06,
    /// Message header for content transfer
    BlockHeader = 0x07,
    /// Message content block
    BlockSequence = 0x08,
    /// Stage acknowledgment
    Ack = 0x09,
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Advertise),
            0x02 => Ok(PacketType::Luid),
            0x03 => Ok(PacketType::ElectLeader),
            0x04 => Ok(PacketType::Upgrade),
            0x05 => Ok(PacketType::Identity),
            0x06 => Ok(PacketType::DeclareHashes),
            0x07 => Ok(PacketType::BlockHeader),
            0x08 => Ok(PacketType::BlockSequence),
            0x09 => Ok(PacketType::Ack),
            _ => Err(crate::WireError::UnknownPacket(value)),
        }
    }
}

/// Status codes carried by stage acknowledgments
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AckStatus {
    /// Stage succeeded
    Ok = 0,
    /// Unrecoverable local error
    Fatal = 1,
    /// Stage timed out
    Timeout = 2,
    /// Local outcomes disagreed on the next stage
    Conflict = 3,
    /// Peer sent invalid data (bad commitment, bad frame, bad packet)
    Invalid = 4,
    /// Duplicate transaction in flight
    Busy = 5,
}

impl From<AckStatus> for u8 {
    fn from(status: AckStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for AckStatus {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::Fatal),
            2 => Ok(AckStatus::Timeout),
            3 => Ok(AckStatus::Conflict),
            4 => Ok(AckStatus::Invalid),
            5 => Ok(AckStatus::Busy),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

bitflags! {
    /// Block header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BlockFlags: u8 {
        /// Content is a file rather than an inline message
        const IS_FILE = 1 << 0;
        /// No more messages follow on this stream
        const END_OF_STREAM = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0x01).unwrap(), PacketType::Advertise);
        assert_eq!(PacketType::try_from(0x09).unwrap(), PacketType::Ack);
        assert!(matches!(
            PacketType::try_from(0xFF),
            Err(crate::WireError::UnknownPacket(0xFF))
        ));
    }

    #[test]
    fn test_ack_status_conversion() {
        assert_eq!(AckStatus::try_from(2).unwrap(), AckStatus::Timeout);
        assert_eq!(u8::from(AckStatus::Busy), 5);
        assert!(AckStatus::try_from(42).is_err());
    }

    #[test]
    fn test_block_flags() {
        let flags = BlockFlags::IS_FILE | BlockFlags::END_OF_STREAM;
        assert!(flags.contains(BlockFlags::IS_FILE));
        assert!(!BlockFlags::empty().contains(BlockFlags::END_OF_STREAM));
    }
}
