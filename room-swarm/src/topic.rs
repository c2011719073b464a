//! Topic derivation (spec §4.6).
//!
//! A topic is a 32-byte identifier used on the DHT to announce and find
//! peers interested in the same room or drive. Room topics derive from the
//! room's discovery key (the bootstrap writer-core's public key); blob
//! topics derive from the drive's public key. Both use the first 32 bytes
//! of SHA-256, independent of any encryption key, so two peers that only
//! share the discovery key (not the room's symmetric encryption key) can
//! still find each other.

use sha2::{Digest, Sha256};

/// A 32-byte DHT topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("topic hex must decode to 32 bytes"))?;
        Ok(Topic(arr))
    }
}

/// Derives a topic from a 32-byte discovery key (room bootstrap key or
/// drive public key), per spec §4.6's "first 32 bytes of SHA-256".
pub fn topic_from_discovery_key(discovery_key: &[u8; 32]) -> Topic {
    let mut hasher = Sha256::new();
    hasher.update(discovery_key);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Topic(out)
}

/// Derives a topic from an arbitrary name, used for the pairing side
/// channel (the candidate topic is derived from the invite id, not from a
/// room key the candidate does not yet hold).
pub fn topic_from_name(name: &[u8]) -> Topic {
    let mut hasher = Sha256::new();
    hasher.update(name);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Topic(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_topic() {
        let key = [7u8; 32];
        assert_eq!(topic_from_discovery_key(&key), topic_from_discovery_key(&key));
    }

    #[test]
    fn different_keys_different_topics() {
        let a = topic_from_discovery_key(&[1u8; 32]);
        let b = topic_from_discovery_key(&[2u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trips() {
        let t = topic_from_name(b"room-discovery");
        let hex = t.to_hex();
        assert_eq!(Topic::from_hex(&hex).unwrap(), t);
    }
}
