//! Versioned, immutable topology snapshots and the store that publishes them.
//!
//! A snapshot maps slot ranges to shard masters. It is validated once at
//! publish time — slot ranges across all shards must partition the full slot
//! space with no gaps or overlaps — and never mutated afterwards. Queries
//! capture an `Arc` to the snapshot at the moment they start and stay
//! internally consistent against it no matter what discovery does next.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::{ShardId, SLOT_COUNT};

/// An inclusive range of slots `[start, end]` owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// One shard's entry in a snapshot: its slot ranges and endpoints.
/// Replica endpoints are carried for completeness but never fanned out to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub slot_ranges: Vec<SlotRange>,
    /// Master endpoint (`host:port`) — the only fanout target.
    pub master: String,
    pub replicas: Vec<String>,
}

impl ShardDescriptor {
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slot_ranges.iter().any(|r| r.contains(slot))
    }
}

/// An immutable view of shard/slot/endpoint assignment at one version.
///
/// Published snapshots always satisfy the partition invariant; holders may
/// rely on `owner_of_slot` returning `Some` for every slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: u64,
    /// Sorted by `shard_id` for deterministic iteration.
    pub shards: Vec<ShardDescriptor>,
}

impl TopologySnapshot {
    /// The empty pre-discovery snapshot. Version 0, no shards.
    pub fn empty() -> Self {
        Self {
            version: 0,
            shards: Vec::new(),
        }
    }

    pub fn shard(&self, shard_id: ShardId) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.shard_id).collect()
    }

    /// Which shard owns `slot` in this snapshot. Always `Some` for a
    /// published (validated) non-empty snapshot.
    pub fn owner_of_slot(&self, slot: u16) -> Option<ShardId> {
        self.shards
            .iter()
            .find(|s| s.owns_slot(slot))
            .map(|s| s.shard_id)
    }

    /// True when `shard_id` owns `slot` in this snapshot. The aggregator
    /// uses this to drop rows answered by a shard that no longer (or not
    /// yet) owns the row's slot — the migration dedup step.
    pub fn shard_owns(&self, shard_id: ShardId, slot: u16) -> bool {
        self.shard(shard_id).is_some_and(|s| s.owns_slot(slot))
    }

    /// Check the partition invariant: every slot in `[0, SLOT_COUNT)` is
    /// owned by exactly one shard, every shard has a master endpoint.
    pub fn validate(shards: &[ShardDescriptor]) -> Result<(), String> {
        if shards.is_empty() {
            return Err("candidate topology has no shards".into());
        }

        let mut ranges: Vec<(SlotRange, ShardId)> = Vec::new();
        for shard in shards {
            if shard.master.is_empty() {
                return Err(format!("{} has no reachable master endpoint", shard.shard_id));
            }
            if shard.slot_ranges.is_empty() {
                return Err(format!("{} owns no slot ranges", shard.shard_id));
            }
            for r in &shard.slot_ranges {
                if r.start > r.end || r.end >= SLOT_COUNT {
                    return Err(format!(
                        "{} has malformed slot range [{}, {}]",
                        shard.shard_id, r.start, r.end
                    ));
                }
                ranges.push((*r, shard.shard_id));
            }
        }

        ranges.sort_by_key(|(r, _)| r.start);

        let mut next_expected: u32 = 0;
        for (r, shard_id) in &ranges {
            if (r.start as u32) < next_expected {
                return Err(format!(
                    "slot range [{}, {}] of {} overlaps previous range",
                    r.start, r.end, shard_id
                ));
            }
            if (r.start as u32) > next_expected {
                return Err(format!(
                    "slot coverage gap: slots {}..{} unowned",
                    next_expected,
                    r.start - 1
                ));
            }
            next_expected = r.end as u32 + 1;
        }
        if next_expected != SLOT_COUNT as u32 {
            return Err(format!(
                "slot coverage gap: slots {}..{} unowned",
                next_expected,
                SLOT_COUNT - 1
            ));
        }
        Ok(())
    }
}

/// Owns the current snapshot. Publish swaps the `Arc` under a short write
/// lock (single writer: the discovery loop); readers capture the `Arc` and
/// never observe mutation.
pub struct TopologyStore {
    current: RwLock<Arc<TopologySnapshot>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(TopologySnapshot::empty())),
        }
    }

    /// Capture the current snapshot.
    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.current.read().clone()
    }

    /// Validate a candidate shard set and publish it as the next version.
    /// On rejection the previous snapshot is kept and `TopologyInvalid` is
    /// returned — in-flight and future queries are unaffected.
    pub fn publish(&self, mut shards: Vec<ShardDescriptor>) -> CoordResult<Arc<TopologySnapshot>> {
        TopologySnapshot::validate(&shards).map_err(CoordError::TopologyInvalid)?;
        shards.sort_by_key(|s| s.shard_id);

        let mut guard = self.current.write();
        let snapshot = Arc::new(TopologySnapshot {
            version: guard.version + 1,
            shards,
        });
        *guard = snapshot.clone();
        tracing::info!(
            version = snapshot.version,
            shards = snapshot.shards.len(),
            "topology snapshot published"
        );
        Ok(snapshot)
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: u64, ranges: &[(u16, u16)]) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: ShardId(id),
            slot_ranges: ranges.iter().map(|&(s, e)| SlotRange::new(s, e)).collect(),
            master: format!("10.0.0.{}:6379", id),
            replicas: vec![],
        }
    }

    #[test]
    fn test_publish_valid_partition() {
        let store = TopologyStore::new();
        let snap = store
            .publish(vec![shard(0, &[(0, 8191)]), shard(1, &[(8192, 16383)])])
            .expect("valid");
        assert_eq!(snap.version, 1);
        assert_eq!(snap.owner_of_slot(0), Some(ShardId(0)));
        assert_eq!(snap.owner_of_slot(8192), Some(ShardId(1)));
        assert_eq!(snap.owner_of_slot(16383), Some(ShardId(1)));
    }

    #[test]
    fn test_reject_gap_keeps_previous() {
        let store = TopologyStore::new();
        store
            .publish(vec![shard(0, &[(0, 16383)])])
            .expect("valid");
        let err = store
            .publish(vec![shard(0, &[(0, 100)]), shard(1, &[(102, 16383)])])
            .unwrap_err();
        assert!(matches!(err, CoordError::TopologyInvalid(_)));
        // Previous snapshot stays authoritative.
        assert_eq!(store.current().version, 1);
        assert_eq!(store.current().shards.len(), 1);
    }

    #[test]
    fn test_reject_overlap() {
        let store = TopologyStore::new();
        let err = store
            .publish(vec![shard(0, &[(0, 9000)]), shard(1, &[(8192, 16383)])])
            .unwrap_err();
        assert!(matches!(err, CoordError::TopologyInvalid(_)));
        assert_eq!(store.current().version, 0);
    }

    #[test]
    fn test_reject_missing_master() {
        let store = TopologyStore::new();
        let mut s = shard(0, &[(0, 16383)]);
        s.master = String::new();
        let err = store.publish(vec![s]).unwrap_err();
        assert!(matches!(err, CoordError::TopologyInvalid(_)));
    }

    #[test]
    fn test_reject_out_of_range() {
        let store = TopologyStore::new();
        let err = store.publish(vec![shard(0, &[(0, 16384)])]).unwrap_err();
        assert!(matches!(err, CoordError::TopologyInvalid(_)));
    }

    #[test]
    fn test_multi_range_shard() {
        let store = TopologyStore::new();
        let snap = store
            .publish(vec![
                shard(0, &[(0, 99), (200, 16383)]),
                shard(1, &[(100, 199)]),
            ])
            .expect("valid");
        assert!(snap.shard_owns(ShardId(0), 50));
        assert!(snap.shard_owns(ShardId(1), 150));
        assert!(snap.shard_owns(ShardId(0), 300));
        assert!(!snap.shard_owns(ShardId(1), 300));
    }

    #[test]
    fn test_versions_monotonic() {
        let store = TopologyStore::new();
        store.publish(vec![shard(0, &[(0, 16383)])]).expect("v1");
        store
            .publish(vec![shard(0, &[(0, 8191)]), shard(1, &[(8192, 16383)])])
            .expect("v2");
        assert_eq!(store.current().version, 2);
    }
}
