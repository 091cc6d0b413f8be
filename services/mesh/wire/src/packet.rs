//! Packet envelope: one tagged variant per protocol message.
//!
//! Payload layout is `[u8 tag][CBOR body]`. Decoding dispatches on the tag
//! and runs the variant's structural validation before the packet is handed
//! to any caller.

use crate::codec::{decode_body, encode_body};
use crate::content::{BlockHeaderPacket, BlockSequencePacket, DeclareHashesPacket, IdentityPacket};
use crate::error::WireError;
use crate::handshake::{AckPacket, AdvertisePacket, ElectLeaderPacket, LuidPacket, UpgradePacket};
use crate::header::PacketType;
use bytes::Bytes;
use mesh_crypto::HASH_SIZE;
use tracing::trace;

/// Maximum capabilities in an advertisement
pub const MAX_CAPABILITIES: usize = 16;
/// Maximum entries in any map field
pub const MAX_MAP_ENTRIES: usize = 64;
/// Maximum bytes of a map key
pub const MAX_MAP_KEY_LEN: usize = 64;
/// Maximum bytes of a string metadata value
pub const MAX_META_VALUE_LEN: usize = 512;
/// Maximum bytes of an identity extra value
pub const MAX_EXTRA_VALUE_LEN: usize = 4096;
/// Maximum bytes of a name or header string
pub const MAX_NAME_LEN: usize = 256;
/// Maximum hashes in one list
pub const MAX_HASHES: usize = 4096;
/// Maximum content block size (256 KiB)
pub const MAX_BLOCK_SIZE: usize = 256 * 1024;
/// Maximum ack message length
pub const MAX_ACK_MESSAGE_LEN: usize = 1024;
/// Commitment salt length
pub const SALT_SIZE: usize = 32;

/// Structural validation run right after decode
pub trait Validate {
    /// Check field bounds
    fn validate(&self) -> Result<(), WireError>;
}

/// Packet variant with a fixed wire tag
pub trait TypedPacket: Validate + Sized {
    /// Wire tag of this variant
    const TYPE: PacketType;

    /// Wrap into the envelope enum
    fn into_packet(self) -> Packet;

    /// Unwrap from the envelope enum, handing back mismatches
    fn from_packet(packet: Packet) -> Result<Self, Packet>;
}

/// Decoded protocol packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Capability advertisement
    Advertise(AdvertisePacket),
    /// Ephemeral identifier
    Luid(LuidPacket),
    /// Leader election
    ElectLeader(ElectLeaderPacket),
    /// Bearer upgrade
    Upgrade(UpgradePacket),
    /// Signed identity
    Identity(IdentityPacket),
    /// Declared content hashes
    DeclareHashes(DeclareHashesPacket),
    /// Message header
    BlockHeader(BlockHeaderPacket),
    /// Message content block
    BlockSequence(BlockSequencePacket),
    /// Stage acknowledgment
    Ack(AckPacket),
}

macro_rules! typed_packet {
    ($ty:ty, $variant:ident) => {
        impl TypedPacket for $ty {
            const TYPE: PacketType = PacketType::$variant;

            fn into_packet(self) -> Packet {
                Packet::$variant(self)
            }

            fn from_packet(packet: Packet) -> Result<Self, Packet> {
                match packet {
                    Packet::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for Packet {
            fn from(inner: $ty) -> Self {
                Packet::$variant(inner)
            }
        }
    };
}

typed_packet!(AdvertisePacket, Advertise);
typed_packet!(LuidPacket, Luid);
typed_packet!(ElectLeaderPacket, ElectLeader);
typed_packet!(UpgradePacket, Upgrade);
typed_packet!(IdentityPacket, Identity);
typed_packet!(DeclareHashesPacket, DeclareHashes);
typed_packet!(BlockHeaderPacket, BlockHeader);
typed_packet!(BlockSequencePacket, BlockSequence);
typed_packet!(AckPacket, Ack);

fn decode_typed<T>(body: &[u8]) -> Result<Packet, WireError>
where
    T: TypedPacket + serde::de::DeserializeOwned,
{
    let inner: T = decode_body(body)?;
    inner.validate()?;
    Ok(inner.into_packet())
}

impl Packet {
    /// Wire tag of this packet
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Advertise(_) => PacketType::Advertise,
            Packet::Luid(_) => PacketType::Luid,
            Packet::ElectLeader(_) => PacketType::ElectLeader,
            Packet::Upgrade(_) => PacketType::Upgrade,
            Packet::Identity(_) => PacketType::Identity,
            Packet::DeclareHashes(_) => PacketType::DeclareHashes,
            Packet::BlockHeader(_) => PacketType::BlockHeader,
            Packet::BlockSequence(_) => PacketType::BlockSequence,
            Packet::Ack(_) => PacketType::Ack,
        }
    }

    /// Validate the inner variant
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Packet::Advertise(p) => p.validate(),
            Packet::Luid(p) => p.validate(),
            Packet::ElectLeader(p) => p.validate(),
            Packet::Upgrade(p) => p.validate(),
            Packet::Identity(p) => p.validate(),
            Packet::DeclareHashes(p) => p.validate(),
            Packet::BlockHeader(p) => p.validate(),
            Packet::BlockSequence(p) => p.validate(),
            Packet::Ack(p) => p.validate(),
        }
    }

    /// Encode to a frame payload; packets that fail validation are not sent
    pub fn encode(&self) -> Result<Bytes, WireError> {
        self.validate()?;

        let mut buf = vec![self.packet_type() as u8];
        match self {
            Packet::Advertise(p) => encode_body(p, &mut buf)?,
            Packet::Luid(p) => encode_body(p, &mut buf)?,
            Packet::ElectLeader(p) => encode_body(p, &mut buf)?,
            Packet::Upgrade(p) => encode_body(p, &mut buf)?,
            Packet::Identity(p) => encode_body(p, &mut buf)?,
            Packet::DeclareHashes(p) => encode_body(p, &mut buf)?,
            Packet::BlockHeader(p) => encode_body(p, &mut buf)?,
            Packet::BlockSequence(p) => encode_body(p, &mut buf)?,
            Packet::Ack(p) => encode_body(p, &mut buf)?,
        }
        Ok(Bytes::from(buf))
    }

    /// Decode and validate a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let (&tag, body) = payload
            .split_first()
            .ok_or_else(|| WireError::Validation("empty payload".to_string()))?;

        let typ = PacketType::try_from(tag)?;
        trace!("Decoding {:?} packet ({} bytes)", typ, body.len());

        match typ {
            PacketType::Advertise => decode_typed::<AdvertisePacket>(body),
            PacketType::Luid => decode_typed::<LuidPacket>(body),
            PacketType::ElectLeader => decode_typed::<ElectLeaderPacket>(body),
            PacketType::Upgrade => decode_typed::<UpgradePacket>(body),
            PacketType::Identity => decode_typed::<IdentityPacket>(body),
            PacketType::DeclareHashes => decode_typed::<DeclareHashesPacket>(body),
            PacketType::BlockHeader => decode_typed::<BlockHeaderPacket>(body),
            PacketType::BlockSequence => decode_typed::<BlockSequencePacket>(body),
            PacketType::Ack => decode_typed::<AckPacket>(body),
        }
    }
}

/// Fail validation with a formatted reason
pub(crate) fn invalid(reason: impl Into<String>) -> WireError {
    WireError::Validation(reason.into())
}

/// Check a string field's byte length
pub(crate) fn check_len(field: &str, len: usize, max: usize) -> Result<(), WireError> {
    if len > max {
        return Err(invalid(format!("{field} length {len} exceeds {max}")));
    }
    Ok(())
}

/// Check a map's cardinality
pub(crate) fn check_entries(field: &str, len: usize) -> Result<(), WireError> {
    check_len(field, len, MAX_MAP_ENTRIES)
}

/// Check a hash list: bounded count, every digest the generic hash size
pub(crate) fn check_hashes(field: &str, hashes: &[Bytes]) -> Result<(), WireError> {
    check_len(field, hashes.len(), MAX_HASHES)?;
    check_digest_sizes(field, hashes)
}

fn check_digest_sizes(field: &str, hashes: &[Bytes]) -> Result<(), WireError> {
    if let Some(bad) = hashes.iter().find(|h| h.len() != HASH_SIZE) {
        return Err(invalid(format!(
            "{field} entry of {} bytes, expected {HASH_SIZE}",
            bad.len()
        )));
    }
    Ok(())
}

/// Check a single digest
pub(crate) fn check_digest(field: &str, hash: &[u8]) -> Result<(), WireError> {
    if hash.len() != HASH_SIZE {
        return Err(invalid(format!(
            "{field} of {} bytes, expected {HASH_SIZE}",
            hash.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Capability, LuidPacket};
    use crate::header::AckStatus;

    #[test]
    fn test_dispatch_by_tag() {
        let packet: Packet = AckPacket::failure(AckStatus::Timeout, "stage timed out").into();
        let raw = packet.encode().unwrap();
        assert_eq!(raw[0], PacketType::Ack as u8);
        assert_eq!(Packet::decode(&raw).unwrap(), packet);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(Packet::decode(&[0x7F, 0xA0]), Err(WireError::UnknownPacket(0x7F)));
        assert!(matches!(Packet::decode(&[]), Err(WireError::Validation(_))));
    }

    #[test]
    fn test_garbage_body() {
        assert_eq!(
            Packet::decode(&[PacketType::Luid as u8, 0xFF, 0x00]),
            Err(WireError::Decode)
        );
    }

    #[test]
    fn test_validation_runs_on_decode() {
        // Hand-encode an advertisement with too many capabilities.
        let body = AdvertisePacket {
            capabilities: vec![Capability::Ble; MAX_CAPABILITIES + 1],
        };
        let mut raw = vec![PacketType::Advertise as u8];
        encode_body(&body, &mut raw).unwrap();
        assert!(matches!(Packet::decode(&raw), Err(WireError::Validation(_))));

        // And refuses to encode it in the first place.
        assert!(Packet::Advertise(body).encode().is_err());
    }

    #[test]
    fn test_typed_unwrap() {
        let packet: Packet = LuidPacket::hashed([1u8; 32]).into();
        let back = Packet::Ack(AckPacket::ok());
        assert!(LuidPacket::from_packet(packet).is_ok());
        assert!(matches!(LuidPacket::from_packet(back), Err(Packet::Ack(_))));
    }
}
