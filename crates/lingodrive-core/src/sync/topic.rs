//! Discovery topic derivation
//!
//! Every process that knows a drive's key derives the same gossip topic, so
//! the topic works as the rendezvous point for the drive's swarm:
//!
//! ```text
//! topic_id = BLAKE3("lingodrive-discovery-v1:" || drive_key_bytes)
//! ```
//!
//! Hashing keeps the raw key out of the gossip layer; peers that do not know
//! the key cannot map a topic back to a drive.

use iroh_gossip::proto::TopicId;

use crate::key::DriveKey;

/// Domain separation prefix for drive discovery topics.
const DISCOVERY_TOPIC_PREFIX: &[u8] = b"lingodrive-discovery-v1:";

/// Derive the gossip topic ID for a drive.
pub fn derive_discovery_topic(key: &DriveKey) -> TopicId {
    let mut input = Vec::with_capacity(DISCOVERY_TOPIC_PREFIX.len() + key.len());
    input.extend_from_slice(DISCOVERY_TOPIC_PREFIX);
    input.extend_from_slice(key.as_bytes());

    let hash = blake3::hash(&input);
    TopicId::from_bytes(*hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_discovery_topic_deterministic() {
        let key = DriveKey::from([7u8; 32]);
        assert_eq!(derive_discovery_topic(&key), derive_discovery_topic(&key));
    }

    #[test]
    fn test_derive_discovery_topic_unique() {
        let a = DriveKey::from([1u8; 32]);
        let b = DriveKey::from([2u8; 32]);
        assert_ne!(derive_discovery_topic(&a), derive_discovery_topic(&b));
    }

    #[test]
    fn test_topic_is_not_the_raw_key() {
        let key = DriveKey::from([9u8; 32]);
        let topic = derive_discovery_topic(&key);
        assert_ne!(topic.as_bytes(), key.as_bytes());
    }
}
