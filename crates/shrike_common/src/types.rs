use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Size of the slot space. Every document key hashes to exactly one slot;
/// a topology snapshot assigns every slot to exactly one shard.
pub const SLOT_COUNT: u16 = 16384;

/// Identifier of an independently-indexing shard node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard_{}", self.0)
    }
}

/// Role of a member node within a shard. Only masters participate in fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Replica,
}

/// Map a document key onto the slot space.
pub fn slot_for_key(key: &str) -> u16 {
    (xxh3_64(key.as_bytes()) % SLOT_COUNT as u64) as u16
}
