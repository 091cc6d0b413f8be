//! Handshake packets: advertisement, LUID, election, upgrade and ack.

use crate::error::WireError;
use crate::header::{AckStatus, PROTOCOL_VERSION};
use crate::packet::{
    check_digest, check_entries, check_len, invalid, Validate, MAX_ACK_MESSAGE_LEN,
    MAX_CAPABILITIES, MAX_MAP_KEY_LEN, MAX_META_VALUE_LEN, SALT_SIZE,
};
use bytes::Bytes;
use mesh_crypto::{generic_hash_multi, HashOutput};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Bearers a peer can provide
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Capability {
    /// Bluetooth LE discovery bearer
    Ble = 0,
    /// Wi-Fi Direct group
    WifiDirect = 1,
    /// Shared local network
    Lan = 2,
}

impl Capability {
    /// Numeric code used in election commitments
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<Capability> for u8 {
    fn from(c: Capability) -> Self {
        c as u8
    }
}

impl TryFrom<u8> for Capability {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Capability::Ble),
            1 => Ok(Capability::WifiDirect),
            2 => Ok(Capability::Lan),
            _ => Err(WireError::Code(value)),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Ble => "ble",
            Capability::WifiDirect => "wifi-direct",
            Capability::Lan => "lan",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Capability {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ble" => Ok(Capability::Ble),
            "wifi-direct" | "wifi" => Ok(Capability::WifiDirect),
            "lan" => Ok(Capability::Lan),
            other => Err(invalid(format!("unknown capability {other}"))),
        }
    }
}

/// Handshake roles
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Role {
    /// Acceptor; owns the upgraded-bearer rendezvous
    Uke = 0,
    /// Initiator; joins a rendezvous
    Seme = 1,
    /// Initiator that also relays rendezvous information for other peers
    SuperSeme = 2,
}

impl From<Role> for u8 {
    fn from(r: Role) -> Self {
        r as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Uke),
            1 => Ok(Role::Seme),
            2 => Ok(Role::SuperSeme),
            _ => Err(WireError::Code(value)),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uke" => Ok(Role::Uke),
            "seme" => Ok(Role::Seme),
            "superseme" | "super-seme" => Ok(Role::SuperSeme),
            other => Err(invalid(format!("unknown role {other}"))),
        }
    }
}

/// Rendezvous frequency band
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Band {
    /// No preference
    #[default]
    Any = 0,
    /// 2.4 GHz
    Ghz2_4 = 1,
    /// 5 GHz
    Ghz5 = 2,
}

impl From<Band> for u8 {
    fn from(b: Band) -> Self {
        b as u8
    }
}

impl TryFrom<u8> for Band {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Band::Any),
            1 => Ok(Band::Ghz2_4),
            2 => Ok(Band::Ghz5),
            _ => Err(WireError::Code(value)),
        }
    }
}

impl std::str::FromStr for Band {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Band::Any),
            "2.4" | "2.4ghz" => Ok(Band::Ghz2_4),
            "5" | "5ghz" => Ok(Band::Ghz5),
            other => Err(invalid(format!("unknown band {other}"))),
        }
    }
}

/// Capability advertisement, most preferred first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisePacket {
    /// Bearers the sender can provide
    pub capabilities: Vec<Capability>,
}

impl AdvertisePacket {
    /// Create an advertisement
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }
}

impl Validate for AdvertisePacket {
    fn validate(&self) -> Result<(), WireError> {
        if self.capabilities.is_empty() {
            return Err(invalid("advertisement without capabilities"));
        }
        check_len("capabilities", self.capabilities.len(), MAX_CAPABILITIES)?;
        let unique: HashSet<_> = self.capabilities.iter().collect();
        if unique.len() != self.capabilities.len() {
            return Err(invalid("duplicate capability"));
        }
        Ok(())
    }
}

/// Ephemeral identifier, committed then revealed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LuidPacket {
    /// Commitment: generic hash of the identifier
    Hashed {
        /// Hash of the LUID bytes
        hash: Bytes,
    },
    /// Reveal: the identifier itself
    Clear {
        /// The LUID
        luid: Uuid,
        /// Sender's protocol version
        version: u32,
    },
}

impl LuidPacket {
    /// Build a commitment packet
    pub fn hashed(hash: HashOutput) -> Self {
        LuidPacket::Hashed {
            hash: Bytes::copy_from_slice(&hash),
        }
    }

    /// Build a reveal packet at the current protocol version
    pub fn clear(luid: Uuid) -> Self {
        LuidPacket::Clear {
            luid,
            version: PROTOCOL_VERSION,
        }
    }
}

impl Validate for LuidPacket {
    fn validate(&self) -> Result<(), WireError> {
        match self {
            LuidPacket::Hashed { hash } => check_digest("luid hash", hash),
            LuidPacket::Clear { .. } => Ok(()),
        }
    }
}

/// Revealed election body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionReveal {
    /// Random salt blinding the commitment
    pub salt: Bytes,
    /// Random tiebreaker
    pub tiebreaker: Uuid,
    /// Sender's LUID
    pub luid: Uuid,
    /// Bearer the sender votes for
    pub provides: Capability,
    /// Role the sender currently holds in other encounters
    pub role: Role,
    /// Preferred rendezvous band
    pub band: Band,
    /// Roles the sender demands for specific LUIDs
    pub force: BTreeMap<Uuid, Role>,
    /// LUIDs the sender drops from its group
    pub remove: BTreeMap<Uuid, Role>,
}

impl ElectionReveal {
    /// Commitment over `salt || tiebreaker || capability code`
    pub fn commitment(&self) -> HashOutput {
        let code = self.provides.code().to_be_bytes();
        generic_hash_multi(&[self.salt.as_ref(), self.tiebreaker.as_bytes(), &code[..]])
    }
}

/// Leader election packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectLeaderPacket {
    /// Commitment round
    Hashed {
        /// Commitment digest
        hash: Bytes,
    },
    /// Reveal round
    Revealed(ElectionReveal),
}

impl ElectLeaderPacket {
    /// Commitment packet for a reveal
    pub fn commit(reveal: &ElectionReveal) -> Self {
        ElectLeaderPacket::Hashed {
            hash: Bytes::copy_from_slice(&reveal.commitment()),
        }
    }

    /// Commitment digest: carried for hashed packets, recomputed for reveals
    pub fn commitment(&self) -> Bytes {
        match self {
            ElectLeaderPacket::Hashed { hash } => hash.clone(),
            ElectLeaderPacket::Revealed(reveal) => Bytes::copy_from_slice(&reveal.commitment()),
        }
    }
}

impl Validate for ElectLeaderPacket {
    fn validate(&self) -> Result<(), WireError> {
        match self {
            ElectLeaderPacket::Hashed { hash } => check_digest("election commitment", hash),
            ElectLeaderPacket::Revealed(reveal) => {
                if reveal.salt.len() != SALT_SIZE {
                    return Err(invalid(format!(
                        "salt of {} bytes, expected {SALT_SIZE}",
                        reveal.salt.len()
                    )));
                }
                check_entries("force", reveal.force.len())?;
                check_entries("remove", reveal.remove.len())
            }
        }
    }
}

/// Bearer upgrade parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePacket {
    /// Upgrade session identifier
    pub session_id: Uuid,
    /// Bearer being upgraded to
    pub provides: Capability,
    /// Rendezvous parameters
    pub metadata: BTreeMap<String, String>,
}

impl UpgradePacket {
    /// Create an upgrade packet
    pub fn new(session_id: Uuid, provides: Capability, metadata: BTreeMap<String, String>) -> Self {
        Self {
            session_id,
            provides,
            metadata,
        }
    }
}

impl Validate for UpgradePacket {
    fn validate(&self) -> Result<(), WireError> {
        check_entries("metadata", self.metadata.len())?;
        for (key, value) in &self.metadata {
            check_len("metadata key", key.len(), MAX_MAP_KEY_LEN)?;
            check_len("metadata value", value.len(), MAX_META_VALUE_LEN)?;
        }
        Ok(())
    }
}

/// Stage acknowledgment exchanged at the ack barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPacket {
    /// Whether the sender's stage succeeded
    pub success: bool,
    /// Status code
    pub status: AckStatus,
    /// Optional human-readable reason
    pub message: Option<String>,
}

impl AckPacket {
    /// Success acknowledgment
    pub fn ok() -> Self {
        Self {
            success: true,
            status: AckStatus::Ok,
            message: None,
        }
    }

    /// Failure acknowledgment; the message is truncated to the wire bound
    pub fn failure(status: AckStatus, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ACK_MESSAGE_LEN {
            let mut cut = MAX_ACK_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            success: false,
            status,
            message: Some(message),
        }
    }
}

impl Validate for AckPacket {
    fn validate(&self) -> Result<(), WireError> {
        if let Some(message) = &self.message {
            check_len("ack message", message.len(), MAX_ACK_MESSAGE_LEN)?;
        }
        if self.success != (self.status == AckStatus::Ok) {
            return Err(invalid("ack success flag disagrees with status"));
        }
        Ok(())
    }
}
