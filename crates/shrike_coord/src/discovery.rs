//! Topology discovery loop.
//!
//! Periodically queries the external slot-assignment authority, validates
//! the candidate shard set, publishes an accepted candidate as the next
//! snapshot version, and reconciles the connection pools. A failed fetch or
//! a rejected candidate is logged and retried next cycle; the previous
//! snapshot stays authoritative and in-flight queries never notice.
//!
//! The loop is the single writer of the topology store and the only caller
//! of `PoolManager::reconcile`. Cursor TTL sweeping piggybacks on the tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use shrike_common::config::DiscoveryConfig;
use shrike_common::error::CoordResult;
use shrike_common::types::{NodeRole, ShardId};

use crate::cursor::CursorManager;
use crate::pool::PoolManager;
use crate::topology::{ShardDescriptor, SlotRange, TopologyStore};

/// One member node as reported by the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub endpoint: String,
    pub role: NodeRole,
}

/// One shard as reported by the authority: contiguous slot ranges plus
/// role-tagged member nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSpec {
    pub shard_id: ShardId,
    pub slot_ranges: Vec<SlotRange>,
    pub nodes: Vec<NodeSpec>,
}

/// The external slot-assignment authority, queried once per cycle.
#[async_trait]
pub trait TopologyAuthority: Send + Sync {
    async fn fetch_topology(&self) -> CoordResult<Vec<ShardSpec>>;
}

/// Convert authority output into snapshot descriptors, enforcing exactly
/// one master per shard.
pub fn descriptors_from_specs(specs: Vec<ShardSpec>) -> Result<Vec<ShardDescriptor>, String> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let masters: Vec<&NodeSpec> = spec
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::Master)
            .collect();
        if masters.len() != 1 {
            return Err(format!(
                "{} reports {} masters, expected exactly one",
                spec.shard_id,
                masters.len()
            ));
        }
        let master = masters[0].endpoint.clone();
        let replicas = spec
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::Replica)
            .map(|n| n.endpoint.clone())
            .collect();
        out.push(ShardDescriptor {
            shard_id: spec.shard_id,
            slot_ranges: spec.slot_ranges,
            master,
            replicas,
        });
    }
    Ok(out)
}

/// One discovery cycle: fetch, validate, publish, reconcile. Exposed so
/// tests (and embedders) can drive topology changes deterministically.
pub async fn run_discovery_cycle(
    authority: &dyn TopologyAuthority,
    store: &TopologyStore,
    pools: &PoolManager,
) {
    let specs = match authority.fetch_topology().await {
        Ok(specs) => specs,
        Err(e) => {
            tracing::warn!(error = %e, "slot-assignment authority unreachable, keeping current snapshot");
            return;
        }
    };

    let mut candidate = match descriptors_from_specs(specs) {
        Ok(descriptors) => descriptors,
        Err(reason) => {
            tracing::warn!(reason = %reason, "topology candidate rejected, keeping current snapshot");
            return;
        }
    };
    candidate.sort_by_key(|s| s.shard_id);

    let previous = store.current();
    if previous.version > 0 && previous.shards == candidate {
        return;
    }

    match store.publish(candidate) {
        Ok(snapshot) => {
            let added: Vec<(ShardId, String)> = snapshot
                .shards
                .iter()
                .filter(|s| {
                    previous
                        .shard(s.shard_id)
                        .is_none_or(|old| old.master != s.master)
                })
                .map(|s| (s.shard_id, s.master.clone()))
                .collect();
            let removed: Vec<ShardId> = previous
                .shards
                .iter()
                .filter(|s| snapshot.shard(s.shard_id).is_none())
                .map(|s| s.shard_id)
                .collect();
            pools.reconcile(&added, &removed);
        }
        Err(e) => {
            tracing::warn!(error = %e, "topology candidate rejected, keeping current snapshot");
        }
    }
}

/// Handle to a running discovery loop. Dropping it does not stop the loop;
/// call `shutdown`.
pub struct DiscoveryHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

pub struct DiscoveryLoop;

impl DiscoveryLoop {
    /// Spawn the periodic loop. One cycle runs immediately so a freshly
    /// started coordinator converges without waiting a full interval.
    pub fn spawn(
        authority: Arc<dyn TopologyAuthority>,
        store: Arc<TopologyStore>,
        pools: Arc<PoolManager>,
        cursors: Arc<CursorManager>,
        cfg: DiscoveryConfig,
    ) -> DiscoveryHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(cfg.interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = cfg.interval_ms, "topology discovery loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_discovery_cycle(authority.as_ref(), &store, &pools).await;
                        let reaped = cursors.sweep_expired();
                        if reaped > 0 {
                            tracing::debug!(reaped, "expired cursors reaped");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("topology discovery loop stopped");
        });
        DiscoveryHandle { shutdown_tx, join }
    }
}
