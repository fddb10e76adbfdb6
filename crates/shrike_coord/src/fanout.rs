//! Fanout executor: issues the remote command to every shard in a snapshot
//! concurrently and multiplexes the replies into a single pull-based stream.
//!
//! One task per shard, all spawned up front; replies land on the channel in
//! arrival order — no shard is waited on before another. Dropping the
//! `ReplyStream` cancels the query: pending sends fail, tasks exit, and any
//! connection still in flight returns to its pool when the shard call
//! eventually completes. Work already dispatched to shards is not chased
//! (fire-and-forget once sent).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use shrike_common::config::QueryConfig;
use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::ShardId;

use crate::pool::PoolManager;
use crate::topology::TopologySnapshot;
use crate::transport::{RemoteCommand, ShardReply};

/// One fanout, built once per client query and immutable for its lifetime.
pub struct FanoutRequest {
    /// The snapshot captured when the query started. All ownership
    /// validation downstream happens against this version.
    pub snapshot: Arc<TopologySnapshot>,
    pub command: RemoteCommand,
    /// Cursor continuation: restrict the fanout to these shards, each with
    /// its stored continuation token.
    pub per_shard_tokens: Option<HashMap<ShardId, String>>,
}

impl FanoutRequest {
    pub fn new(snapshot: Arc<TopologySnapshot>, command: RemoteCommand) -> Self {
        Self {
            snapshot,
            command,
            per_shard_tokens: None,
        }
    }
}

/// One shard's outcome, success or per-shard failure.
pub struct FanoutItem {
    pub shard_id: ShardId,
    pub latency_us: u64,
    pub result: CoordResult<ShardReply>,
}

/// Ordering-agnostic reply stream. Finite and single-pass: it yields one
/// item per targeted shard and is not restartable — repeating a query
/// requires a fresh fanout.
pub struct ReplyStream {
    rx: mpsc::Receiver<FanoutItem>,
    expected: usize,
}

impl ReplyStream {
    pub(crate) fn new(rx: mpsc::Receiver<FanoutItem>, expected: usize) -> Self {
        Self { rx, expected }
    }

    /// Await the next shard outcome; `None` once every targeted shard has
    /// reported (or the stream was cancelled).
    pub async fn next(&mut self) -> Option<FanoutItem> {
        self.rx.recv().await
    }

    /// Number of shards targeted by this fanout.
    pub fn expected(&self) -> usize {
        self.expected
    }
}

pub struct FanoutExecutor {
    pools: Arc<PoolManager>,
    timeout: Duration,
}

impl FanoutExecutor {
    pub fn new(pools: Arc<PoolManager>, cfg: &QueryConfig) -> Self {
        Self {
            pools,
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }

    /// Launch the fanout. Returns immediately with the reply stream; shard
    /// calls proceed in the background.
    pub fn execute(&self, request: FanoutRequest) -> CoordResult<ReplyStream> {
        let targets: Vec<ShardId> = match &request.per_shard_tokens {
            Some(tokens) => request
                .snapshot
                .shard_ids()
                .into_iter()
                .filter(|id| tokens.contains_key(id))
                .collect(),
            None => request.snapshot.shard_ids(),
        };
        if targets.is_empty() {
            return Err(CoordError::NoShardsAvailable {
                version: request.snapshot.version,
            });
        }

        let (tx, rx) = mpsc::channel(targets.len());
        for shard_id in &targets {
            let shard_id = *shard_id;
            let mut command = request.command.clone();
            if let Some(tokens) = &request.per_shard_tokens {
                command.cursor_token = tokens.get(&shard_id).cloned();
            }
            let pools = self.pools.clone();
            let timeout = self.timeout;
            let tx = tx.clone();

            tokio::spawn(async move {
                let start = Instant::now();
                let result = call_shard(&pools, shard_id, &command, timeout).await;
                let item = FanoutItem {
                    shard_id,
                    latency_us: start.elapsed().as_micros() as u64,
                    result,
                };
                // A failed send means the consumer dropped the stream
                // (cancellation). The connection is already back in its
                // pool; nothing left to unwind.
                let _ = tx.send(item).await;
            });
        }
        drop(tx);

        Ok(ReplyStream::new(rx, targets.len()))
    }
}

/// Execute the command on one shard. The pooled connection is released on
/// every exit path: parked on success, discarded on timeout or transport
/// error (its stream state is unknown).
async fn call_shard(
    pools: &PoolManager,
    shard_id: ShardId,
    command: &RemoteCommand,
    timeout: Duration,
) -> CoordResult<ShardReply> {
    let mut conn = pools.acquire(shard_id).await?;
    match tokio::time::timeout(timeout, conn.execute(command)).await {
        Err(_) => {
            conn.discard();
            Err(CoordError::ShardTimeout {
                shard_id,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Ok(Err(e)) => {
            conn.discard();
            tracing::warn!(shard_id = shard_id.0, error = %e, "shard call failed");
            Err(e)
        }
        Ok(Ok(reply)) => Ok(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shrike_common::config::PoolConfig;

    use crate::plan::RemotePlan;
    use crate::topology::{ShardDescriptor, SlotRange, TopologyStore};
    use crate::transport::{InProcessConnector, ShardHandler};

    struct DelayedHandler {
        shard_id: ShardId,
        delay_ms: u64,
    }

    #[async_trait]
    impl ShardHandler for DelayedHandler {
        async fn handle(&self, _command: RemoteCommand) -> CoordResult<ShardReply> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(ShardReply {
                shard_id: self.shard_id,
                topology_version: None,
                rows: vec![],
                cursor_token: None,
            })
        }
    }

    fn two_shard_world(
        delays: [u64; 2],
    ) -> (Arc<TopologySnapshot>, Arc<PoolManager>) {
        let connector = InProcessConnector::new();
        for (i, delay_ms) in delays.into_iter().enumerate() {
            connector.register(
                format!("s{}:1", i),
                Arc::new(DelayedHandler {
                    shard_id: ShardId(i as u64),
                    delay_ms,
                }),
            );
        }
        let pools = Arc::new(PoolManager::new(
            Arc::new(connector),
            PoolConfig {
                connections_per_shard: 2,
                acquire_timeout_ms: 100,
            },
        ));
        pools.reconcile(
            &[(ShardId(0), "s0:1".into()), (ShardId(1), "s1:1".into())],
            &[],
        );

        let store = TopologyStore::new();
        let snapshot = store
            .publish(vec![
                ShardDescriptor {
                    shard_id: ShardId(0),
                    slot_ranges: vec![SlotRange::new(0, 8191)],
                    master: "s0:1".into(),
                    replicas: vec![],
                },
                ShardDescriptor {
                    shard_id: ShardId(1),
                    slot_ranges: vec![SlotRange::new(8192, 16383)],
                    master: "s1:1".into(),
                    replicas: vec![],
                },
            ])
            .expect("valid topology");
        (snapshot, pools)
    }

    fn query_cfg(timeout_ms: u64) -> QueryConfig {
        QueryConfig {
            timeout_ms,
            ..QueryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_replies_arrive_in_any_order() {
        let (snapshot, pools) = two_shard_world([40, 5]);
        let exec = FanoutExecutor::new(pools, &query_cfg(1_000));
        let mut stream = exec
            .execute(FanoutRequest::new(
                snapshot,
                RemoteCommand::new(RemotePlan::empty("idx")),
            ))
            .expect("fanout");

        // The faster shard lands first even though it was spawned second.
        let first = stream.next().await.expect("first item");
        assert_eq!(first.shard_id, ShardId(1));
        let second = stream.next().await.expect("second item");
        assert_eq!(second.shard_id, ShardId(0));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_shard_reported_as_timeout() {
        let (snapshot, pools) = two_shard_world([200, 1]);
        let exec = FanoutExecutor::new(pools, &query_cfg(50));
        let mut stream = exec
            .execute(FanoutRequest::new(
                snapshot,
                RemoteCommand::new(RemotePlan::empty("idx")),
            ))
            .expect("fanout");

        let mut outcomes = Vec::new();
        while let Some(item) = stream.next().await {
            outcomes.push((item.shard_id, item.result.is_ok()));
        }
        outcomes.sort();
        assert_eq!(outcomes, vec![(ShardId(0), false), (ShardId(1), true)]);
    }

    #[tokio::test]
    async fn test_cancellation_returns_connections() {
        let (snapshot, pools) = two_shard_world([50, 50]);
        let exec = FanoutExecutor::new(pools.clone(), &query_cfg(1_000));
        let stream = exec
            .execute(FanoutRequest::new(
                snapshot,
                RemoteCommand::new(RemotePlan::empty("idx")),
            ))
            .expect("fanout");

        // Client disconnect: drop the stream while both shards are busy.
        drop(stream);
        tokio::time::sleep(Duration::from_millis(120)).await;

        for s in pools.stats() {
            assert_eq!(s.in_use, 0, "{} still holds a connection", s.shard_id);
        }
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_fatal() {
        let (_, pools) = two_shard_world([1, 1]);
        let exec = FanoutExecutor::new(pools, &query_cfg(100));
        let empty = Arc::new(TopologySnapshot::empty());
        let err = exec
            .execute(FanoutRequest::new(
                empty,
                RemoteCommand::new(RemotePlan::empty("idx")),
            ))
            .unwrap_err();
        assert!(matches!(err, CoordError::NoShardsAvailable { .. }));
    }

    #[tokio::test]
    async fn test_cursor_targets_restrict_fanout() {
        let (snapshot, pools) = two_shard_world([1, 1]);
        let exec = FanoutExecutor::new(pools, &query_cfg(1_000));
        let mut tokens = HashMap::new();
        tokens.insert(ShardId(1), "tok-1".to_string());

        let mut request = FanoutRequest::new(
            snapshot,
            RemoteCommand::new(RemotePlan::empty("idx")),
        );
        request.per_shard_tokens = Some(tokens);

        let mut stream = exec.execute(request).expect("fanout");
        assert_eq!(stream.expected(), 1);
        let item = stream.next().await.expect("one reply");
        assert_eq!(item.shard_id, ShardId(1));
        assert!(stream.next().await.is_none());
    }
}
