//! The coordinator engine: ties planner → fanout → aggregation → response
//! for one-shot and cursor-paginated queries.
//!
//! Every query captures one topology snapshot up front and is internally
//! consistent against it; the discovery loop swaps snapshots out-of-band
//! without touching in-flight work.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use shrike_common::config::CoordConfig;
use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::ShardId;

use crate::aggregate::{Aggregator, FailurePolicy, FanoutMetrics};
use crate::cursor::CursorManager;
use crate::fanout::{FanoutExecutor, FanoutRequest};
use crate::plan::AggregationPlan;
use crate::planner;
use crate::pool::PoolManager;
use crate::topology::TopologyStore;
use crate::transport::{RemoteCommand, ResultRow};

/// Final merged result of one query (or one cursor batch).
pub struct SearchResult {
    /// Merged row/group count before window truncation.
    pub total: usize,
    pub rows: Vec<ResultRow>,
    /// Shards excluded from this result; empty on full success.
    pub failed_shards: Vec<ShardId>,
}

/// One batch of a paginated query. `cursor_id` is `None` once exhausted.
pub struct CursorBatch {
    pub result: SearchResult,
    pub cursor_id: Option<u64>,
}

pub struct Coordinator {
    store: Arc<TopologyStore>,
    pools: Arc<PoolManager>,
    fanout: FanoutExecutor,
    cursors: Arc<CursorManager>,
    cfg: CoordConfig,
    policy: FailurePolicy,
    last_metrics: Mutex<FanoutMetrics>,
}

impl Coordinator {
    pub fn new(store: Arc<TopologyStore>, pools: Arc<PoolManager>, cfg: CoordConfig) -> Self {
        let fanout = FanoutExecutor::new(pools.clone(), &cfg.query);
        let cursors = Arc::new(CursorManager::new(&cfg.cursor));
        Self {
            store,
            pools,
            fanout,
            cursors,
            cfg,
            policy: FailurePolicy::BestEffort,
            last_metrics: Mutex::new(FanoutMetrics::default()),
        }
    }

    /// Fail whole queries on any shard failure instead of degrading to
    /// partial results.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The cursor registry, shared with the discovery loop for TTL sweeps.
    pub fn cursors(&self) -> Arc<CursorManager> {
        self.cursors.clone()
    }

    /// Fanout/merge metrics of the most recent query.
    pub fn last_fanout_metrics(&self) -> FanoutMetrics {
        self.last_metrics.lock().clone()
    }

    /// Execute a one-shot query: split the plan, fan the remote half out to
    /// the captured snapshot, merge, run the local half, window.
    pub async fn search(&self, plan: &AggregationPlan) -> CoordResult<SearchResult> {
        let snapshot = self.store.current();
        let dist = planner::distribute(plan, &self.cfg.query)?;
        let command = RemoteCommand::new(dist.remote.clone());

        let stream = self
            .fanout
            .execute(FanoutRequest::new(snapshot.clone(), command))?;
        let outcome = Aggregator::new(&self.cfg.query)
            .with_policy(self.policy)
            .collect(stream, &dist, &snapshot)
            .await?;

        *self.last_metrics.lock() = outcome.metrics.clone();
        Ok(SearchResult {
            total: outcome.total,
            rows: outcome.rows,
            failed_shards: outcome.failed_shards,
        })
    }

    /// Execute the first batch of a paginated query. Returns a cursor id
    /// when at least one shard has more data.
    pub async fn search_with_cursor(&self, plan: &AggregationPlan) -> CoordResult<CursorBatch> {
        let snapshot = self.store.current();
        let dist = planner::distribute(plan, &self.cfg.query)?;
        let mut command = RemoteCommand::new(dist.remote.clone());
        command.with_cursor = true;

        let stream = self
            .fanout
            .execute(FanoutRequest::new(snapshot.clone(), command.clone()))?;
        let outcome = Aggregator::new(&self.cfg.query)
            .with_policy(self.policy)
            .collect(stream, &dist, &snapshot)
            .await?;
        *self.last_metrics.lock() = outcome.metrics.clone();

        let cursor_id = if outcome.cursor_tokens.is_empty() {
            None
        } else {
            Some(self.cursors.create(
                snapshot.version,
                command,
                dist,
                outcome.cursor_tokens,
            ))
        };
        Ok(CursorBatch {
            result: SearchResult {
                total: outcome.total,
                rows: outcome.rows,
                failed_shards: outcome.failed_shards,
            },
            cursor_id,
        })
    }

    /// Fetch the next batch of a paginated query. Fails with `StaleCursor`
    /// when a shard backing the cursor has left the topology.
    pub async fn cursor_next(&self, cursor_id: u64) -> CoordResult<CursorBatch> {
        let snapshot = self.store.current();
        let mut state = self.cursors.take(cursor_id, &snapshot)?;

        let mut request = FanoutRequest::new(snapshot.clone(), state.command.clone());
        request.per_shard_tokens = Some(state.tokens.clone());

        let stream = self.fanout.execute(request)?;
        let outcome = Aggregator::new(&self.cfg.query)
            .with_policy(self.policy)
            .collect(stream, &state.plan, &snapshot)
            .await?;
        *self.last_metrics.lock() = outcome.metrics.clone();

        let result = SearchResult {
            total: outcome.total,
            rows: outcome.rows,
            failed_shards: outcome.failed_shards,
        };
        if outcome.cursor_tokens.is_empty() {
            // Every shard exhausted; the cursor was consumed by `take`.
            Ok(CursorBatch {
                result,
                cursor_id: None,
            })
        } else {
            state.tokens = outcome.cursor_tokens;
            self.cursors.store(state);
            Ok(CursorBatch {
                result,
                cursor_id: Some(cursor_id),
            })
        }
    }

    /// Explicitly release a cursor. Returns false when unknown or expired.
    pub fn release_cursor(&self, cursor_id: u64) -> bool {
        self.cursors.release(cursor_id)
    }

    /// Probe every shard in the current snapshot with a trivial ping.
    /// Returns `(shard_id, healthy, latency_us)` per shard.
    pub async fn shard_health(&self) -> Vec<(ShardId, bool, u64)> {
        let snapshot = self.store.current();
        let handles: Vec<_> = snapshot
            .shard_ids()
            .into_iter()
            .map(|shard_id| {
                let pools = self.pools.clone();
                tokio::spawn(async move {
                    let start = Instant::now();
                    let healthy = match pools.acquire(shard_id).await {
                        Ok(mut conn) => conn.ping().await.is_ok(),
                        Err(_) => false,
                    };
                    (shard_id, healthy, start.elapsed().as_micros() as u64)
                })
            })
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(probe) = handle.await {
                out.push(probe);
            }
        }
        out.sort_by_key(|(shard_id, _, _)| *shard_id);
        out
    }

    /// Hard failure when no topology has been resolved at all.
    pub fn require_topology(&self) -> CoordResult<()> {
        let snapshot = self.store.current();
        if snapshot.shards.is_empty() {
            return Err(CoordError::NoShardsAvailable {
                version: snapshot.version,
            });
        }
        Ok(())
    }
}
