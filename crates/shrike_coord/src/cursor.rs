//! Cursor manager: tracks multi-batch distributed queries across restarts
//! of the fanout for each next batch.
//!
//! A cursor pins the shard set that produced the first batch. Before every
//! continuation the set is re-validated against the current topology: a
//! removed backing shard makes the cursor terminally `StaleCursor` rather
//! than silently resuming with partial data. Cursors die on exhaustion,
//! explicit release, or inactivity TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use shrike_common::config::CursorConfig;
use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::ShardId;

use crate::plan::DistributedPlan;
use crate::topology::TopologySnapshot;
use crate::transport::RemoteCommand;

/// Server-side state of one paginated query.
pub struct CursorState {
    pub cursor_id: u64,
    /// Version of the snapshot the first batch ran against.
    pub snapshot_version: u64,
    /// The remote command re-issued for every batch.
    pub command: RemoteCommand,
    /// The split plan driving each batch's merge.
    pub plan: DistributedPlan,
    /// Per-shard continuation tokens, opaque to the coordinator. Shards
    /// drop out of this map as they exhaust.
    pub tokens: HashMap<ShardId, String>,
    last_used: Instant,
}

pub struct CursorManager {
    cursors: DashMap<u64, CursorState>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl CursorManager {
    pub fn new(cfg: &CursorConfig) -> Self {
        Self {
            cursors: DashMap::new(),
            next_id: AtomicU64::new(1),
            ttl: Duration::from_millis(cfg.ttl_ms),
        }
    }

    /// Register a cursor for a first batch that returned continuation
    /// tokens. Returns the new cursor id.
    pub fn create(
        &self,
        snapshot_version: u64,
        command: RemoteCommand,
        plan: DistributedPlan,
        tokens: HashMap<ShardId, String>,
    ) -> u64 {
        let cursor_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.cursors.insert(
            cursor_id,
            CursorState {
                cursor_id,
                snapshot_version,
                command,
                plan,
                tokens,
                last_used: Instant::now(),
            },
        );
        tracing::debug!(cursor_id, snapshot_version, "cursor created");
        cursor_id
    }

    /// Check a cursor out for its next batch. The cursor leaves the
    /// registry while the batch runs; `store` puts it back with refreshed
    /// tokens. Validation failures consume the cursor.
    pub fn take(&self, cursor_id: u64, current: &TopologySnapshot) -> CoordResult<CursorState> {
        let (_, mut state) = self
            .cursors
            .remove(&cursor_id)
            .ok_or(CoordError::CursorNotFound(cursor_id))?;

        if state.last_used.elapsed() > self.ttl {
            tracing::debug!(cursor_id, "cursor expired on access");
            return Err(CoordError::CursorNotFound(cursor_id));
        }

        for shard_id in state.tokens.keys() {
            if current.shard(*shard_id).is_none() {
                return Err(CoordError::StaleCursor {
                    cursor_id,
                    reason: format!(
                        "{} backing this cursor left the topology (version {} -> {})",
                        shard_id, state.snapshot_version, current.version
                    ),
                });
            }
        }
        if current.version != state.snapshot_version {
            tracing::debug!(
                cursor_id,
                cursor_version = state.snapshot_version,
                current_version = current.version,
                "topology moved under cursor; backing shards all present, continuing"
            );
        }

        state.last_used = Instant::now();
        Ok(state)
    }

    /// Return a cursor to the registry after a batch, with updated tokens.
    pub fn store(&self, state: CursorState) {
        self.cursors.insert(state.cursor_id, state);
    }

    /// Explicit release. Returns false when the cursor was unknown.
    pub fn release(&self, cursor_id: u64) -> bool {
        let released = self.cursors.remove(&cursor_id).is_some();
        if released {
            tracing::debug!(cursor_id, "cursor released");
        }
        released
    }

    /// Reap cursors idle past the TTL. Piggybacked on the discovery tick.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.cursors.len();
        self.cursors.retain(|cursor_id, state| {
            let keep = state.last_used.elapsed() <= ttl;
            if !keep {
                tracing::debug!(cursor_id, "cursor reaped by TTL sweep");
            }
            keep
        });
        before - self.cursors.len()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::plan::{DistributedPlan, LocalPlan, RemotePlan, Window};
    use crate::topology::{ShardDescriptor, SlotRange, TopologyStore};

    fn plan() -> DistributedPlan {
        DistributedPlan {
            remote: RemotePlan::empty("idx"),
            local: LocalPlan {
                group_keys: vec![],
                combines: vec![],
                sort: None,
                window: Window { offset: 0, count: 10 },
            },
            merge_sort: None,
        }
    }

    fn shard(id: u64, start: u16, end: u16) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: ShardId(id),
            slot_ranges: vec![SlotRange::new(start, end)],
            master: format!("s{}:1", id),
            replicas: vec![],
        }
    }

    fn tokens(ids: &[u64]) -> HashMap<ShardId, String> {
        ids.iter()
            .map(|&id| (ShardId(id), format!("tok-{}", id)))
            .collect()
    }

    fn manager(ttl_ms: u64) -> CursorManager {
        CursorManager::new(&CursorConfig { ttl_ms })
    }

    #[test]
    fn test_create_take_store_roundtrip() {
        let store = TopologyStore::new();
        let snap = store
            .publish(vec![shard(0, 0, 8191), shard(1, 8192, 16383)])
            .expect("valid");

        let mgr = manager(60_000);
        let id = mgr.create(
            snap.version,
            RemoteCommand::new(RemotePlan::empty("idx")),
            plan(),
            tokens(&[0, 1]),
        );
        assert_eq!(mgr.len(), 1);

        let state = mgr.take(id, &snap).expect("valid cursor");
        assert_eq!(mgr.len(), 0, "cursor leaves registry while batch runs");
        mgr.store(state);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_removed_backing_shard_is_stale() {
        let store = TopologyStore::new();
        let v1 = store
            .publish(vec![shard(0, 0, 8191), shard(1, 8192, 16383)])
            .expect("v1");

        let mgr = manager(60_000);
        let id = mgr.create(
            v1.version,
            RemoteCommand::new(RemotePlan::empty("idx")),
            plan(),
            tokens(&[0, 1]),
        );

        // Shard 1 leaves; shard 0 absorbs its slots.
        let v2 = store.publish(vec![shard(0, 0, 16383)]).expect("v2");
        let err = mgr.take(id, &v2).unwrap_err();
        assert!(matches!(err, CoordError::StaleCursor { .. }));
        // The stale cursor was consumed, not left to retry.
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_version_change_alone_is_not_stale() {
        let store = TopologyStore::new();
        let v1 = store
            .publish(vec![shard(0, 0, 8191), shard(1, 8192, 16383)])
            .expect("v1");

        let mgr = manager(60_000);
        let id = mgr.create(
            v1.version,
            RemoteCommand::new(RemotePlan::empty("idx")),
            plan(),
            tokens(&[0, 1]),
        );

        // A slot moves between the two backing shards; both still exist.
        let v2 = store
            .publish(vec![shard(0, 0, 9000), shard(1, 9001, 16383)])
            .expect("v2");
        assert!(mgr.take(id, &v2).is_ok());
    }

    #[test]
    fn test_ttl_expiry() {
        let store = TopologyStore::new();
        let snap = store.publish(vec![shard(0, 0, 16383)]).expect("v1");

        let mgr = manager(0);
        let id = mgr.create(
            snap.version,
            RemoteCommand::new(RemotePlan::empty("idx")),
            plan(),
            tokens(&[0]),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            mgr.take(id, &snap).unwrap_err(),
            CoordError::CursorNotFound(_)
        ));
    }

    #[test]
    fn test_sweep_reaps_only_expired() {
        let store = TopologyStore::new();
        let snap = store.publish(vec![shard(0, 0, 16383)]).expect("v1");

        let mgr = manager(50);
        let _old = mgr.create(
            snap.version,
            RemoteCommand::new(RemotePlan::empty("idx")),
            plan(),
            tokens(&[0]),
        );
        std::thread::sleep(Duration::from_millis(80));
        let fresh = mgr.create(
            snap.version,
            RemoteCommand::new(RemotePlan::empty("idx")),
            plan(),
            tokens(&[0]),
        );

        assert_eq!(mgr.sweep_expired(), 1);
        assert_eq!(mgr.len(), 1);
        assert!(mgr.release(fresh));
    }

    #[test]
    fn test_release_unknown() {
        let mgr = manager(1_000);
        assert!(!mgr.release(404));
    }
}
