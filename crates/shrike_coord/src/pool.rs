//! Bounded per-shard connection pools.
//!
//! Pools are created when a shard first appears in a published snapshot and
//! drained when it disappears. `acquire` suspends the caller until a free
//! connection exists or the acquire timeout elapses (`PoolExhausted`); an
//! acquire racing with the shard's removal fails with `ShardGone`.
//!
//! A `PooledConnection` returns itself to the pool on drop unless it was
//! discarded (broken transport) or its pool has been drained — so every
//! exit path of a fanout task, including cancellation, releases capacity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use shrike_common::config::PoolConfig;
use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::ShardId;

use crate::transport::{RemoteCommand, ShardConnection, ShardConnector, ShardReply};

/// Point-in-time pool occupancy for admin/observability.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub shard_id: ShardId,
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct ShardPool {
    shard_id: ShardId,
    endpoint: String,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn ShardConnection>>>,
    closed: AtomicBool,
}

impl ShardPool {
    fn new(shard_id: ShardId, endpoint: String, capacity: usize) -> Self {
        Self {
            shard_id,
            endpoint,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    /// Drain the pool: wake all waiters with `ShardGone`, drop idle
    /// connections, and make in-flight returns discard instead of park.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.idle.lock().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A connection checked out of a pool. Dropping it returns the connection
/// (and its capacity permit) to the pool; `discard` drops the connection
/// itself while still freeing the permit.
pub struct PooledConnection {
    pub shard_id: ShardId,
    conn: Option<Box<dyn ShardConnection>>,
    pool: Arc<ShardPool>,
    discarded: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub async fn execute(&mut self, command: &RemoteCommand) -> CoordResult<ShardReply> {
        match self.conn.as_mut() {
            Some(c) => c.execute(command).await,
            None => Err(CoordError::Transport("connection already released".into())),
        }
    }

    pub async fn ping(&mut self) -> CoordResult<()> {
        match self.conn.as_mut() {
            Some(c) => c.ping().await,
            None => Err(CoordError::Transport("connection already released".into())),
        }
    }

    /// Mark the connection broken: it will not be parked for reuse.
    pub fn discard(mut self) {
        self.discarded = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.discarded && !self.pool.is_closed() {
                self.pool.idle.lock().push(conn);
            }
        }
    }
}

/// Owns one pool per shard. `reconcile` is the only mutating entry point
/// and is invoked solely by the discovery loop (single writer); `acquire`
/// proceeds concurrently except for shards being removed.
pub struct PoolManager {
    pools: DashMap<ShardId, Arc<ShardPool>>,
    connector: Arc<dyn ShardConnector>,
    cfg: PoolConfig,
}

impl PoolManager {
    pub fn new(connector: Arc<dyn ShardConnector>, cfg: PoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            connector,
            cfg,
        }
    }

    /// Check a connection out of `shard_id`'s pool, suspending until one is
    /// free. Fails with `PoolExhausted` after the acquire timeout, or
    /// `ShardGone` if the shard is unknown or removed while waiting.
    pub async fn acquire(&self, shard_id: ShardId) -> CoordResult<PooledConnection> {
        let pool = self
            .pools
            .get(&shard_id)
            .map(|p| p.clone())
            .ok_or(CoordError::ShardGone { shard_id })?;

        let wait = Duration::from_millis(self.cfg.acquire_timeout_ms);
        let permit = match tokio::time::timeout(wait, pool.permits.clone().acquire_owned()).await
        {
            Err(_) => {
                return Err(CoordError::PoolExhausted {
                    shard_id,
                    waited_ms: self.cfg.acquire_timeout_ms,
                })
            }
            Ok(Err(_)) => return Err(CoordError::ShardGone { shard_id }),
            Ok(Ok(permit)) => permit,
        };
        if pool.is_closed() {
            return Err(CoordError::ShardGone { shard_id });
        }

        let reused = pool.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self
                .connector
                .connect(&pool.endpoint)
                .await
                .map_err(|e| CoordError::ShardUnreachable {
                    shard_id,
                    reason: e.to_string(),
                })?,
        };

        Ok(PooledConnection {
            shard_id,
            conn: Some(conn),
            pool,
            discarded: false,
            _permit: permit,
        })
    }

    /// Return a connection to its pool. Equivalent to dropping the guard;
    /// named for symmetry with `acquire`.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Apply a topology diff: create pools for new shards, drain pools for
    /// vanished ones, and recycle pools whose endpoint moved.
    pub fn reconcile(&self, added: &[(ShardId, String)], removed: &[ShardId]) {
        for shard_id in removed {
            if let Some((_, pool)) = self.pools.remove(shard_id) {
                pool.close();
                tracing::info!(shard_id = shard_id.0, "connection pool drained");
            }
        }
        for (shard_id, endpoint) in added {
            if let Some(existing) = self.pools.get(shard_id) {
                if existing.endpoint == *endpoint {
                    continue;
                }
                existing.close();
                tracing::info!(
                    shard_id = shard_id.0,
                    old = %existing.endpoint,
                    new = %endpoint,
                    "shard endpoint moved, pool recycled"
                );
            }
            self.pools.insert(
                *shard_id,
                Arc::new(ShardPool::new(
                    *shard_id,
                    endpoint.clone(),
                    self.cfg.connections_per_shard,
                )),
            );
            tracing::info!(shard_id = shard_id.0, endpoint = %endpoint, "connection pool created");
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .pools
            .iter()
            .map(|entry| {
                let pool = entry.value();
                let idle = pool.idle.lock().len();
                let available = pool.permits.available_permits();
                PoolStats {
                    shard_id: pool.shard_id,
                    capacity: pool.capacity,
                    idle,
                    in_use: pool.capacity.saturating_sub(available),
                }
            })
            .collect();
        stats.sort_by_key(|s| s.shard_id);
        stats
    }

    pub fn has_pool(&self, shard_id: ShardId) -> bool {
        self.pools.contains_key(&shard_id)
    }
}
