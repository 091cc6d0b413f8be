//! CBOR body encoding, string metadata helpers and sealed payloads.

use crate::error::WireError;
use crate::packet::Packet;
use bytes::Bytes;
use mesh_crypto::SealKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Serialize a packet body as CBOR
pub fn encode_body<T: Serialize>(body: &T, buf: &mut Vec<u8>) -> Result<(), WireError> {
    ciborium::into_writer(body, buf).map_err(|_| WireError::Encode)
}

/// Deserialize a packet body from CBOR
pub fn decode_body<T: DeserializeOwned>(raw: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(raw).map_err(|_| WireError::Decode)
}

/// String metadata builder for upgrade packets
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    map: BTreeMap<String, String>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }

    /// Insert a u32 value
    pub fn insert_u32(mut self, key: &str, value: u32) -> Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }

    /// Build the metadata map
    pub fn build(self) -> BTreeMap<String, String> {
        self.map
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, String>, key: &str) -> Option<String> {
    meta.get(key).cloned()
}

/// Get u32 value from metadata
pub fn get_meta_u32(meta: &BTreeMap<String, String>, key: &str) -> Option<u32> {
    meta.get(key).and_then(|v| v.parse().ok())
}

/// Encode a packet and seal the payload for a holder of `key`
pub fn seal_packet(key: &SealKey, packet: &Packet) -> Result<Bytes, WireError> {
    let plain = packet.encode()?;
    mesh_crypto::seal(key, &plain)
        .map(Bytes::from)
        .map_err(|_| WireError::Sealed)
}

/// Open a sealed payload and decode the packet inside
pub fn open_packet(key: &SealKey, sealed: &[u8]) -> Result<Packet, WireError> {
    let plain = mesh_crypto::open(key, sealed).map_err(|_| WireError::Sealed)?;
    Packet::decode(&plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{AdvertisePacket, Capability};

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str("name", "DIRECT-xy")
            .insert_u32("band", 5)
            .build();

        assert_eq!(get_meta_str(&meta, "name"), Some("DIRECT-xy".to_string()));
        assert_eq!(get_meta_u32(&meta, "band"), Some(5));
        assert_eq!(get_meta_u32(&meta, "name"), None);
        assert_eq!(get_meta_str(&meta, "missing"), None);
    }

    #[test]
    fn test_sealed_packet() {
        let key = SealKey::generate();
        let packet = Packet::Advertise(AdvertisePacket::new(vec![Capability::Ble]));
        let sealed = seal_packet(&key, &packet).unwrap();
        assert_eq!(open_packet(&key, &sealed).unwrap(), packet);
        assert_eq!(
            open_packet(&SealKey::generate(), &sealed),
            Err(WireError::Sealed)
        );
    }
}
