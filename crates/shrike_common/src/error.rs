use thiserror::Error;

use crate::types::ShardId;

/// Convenience alias for `Result<T, CoordError>`.
pub type CoordResult<T> = Result<T, CoordError>;

/// Error classification for retry decisions.
///
/// - `PerShard`  — absorbed into partial results; the query still completes
/// - `Transient` — backpressure/timeouts; caller may retry after back-off
/// - `Terminal`  — the query (or cursor) cannot proceed; a fresh request is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PerShard,
    Transient,
    Terminal,
}

/// Top-level error type for the coordinator core.
#[derive(Error, Debug)]
pub enum CoordError {
    /// Local backpressure: no free connection within the acquire timeout.
    #[error("connection pool exhausted for {shard_id} after {waited_ms}ms")]
    PoolExhausted { shard_id: ShardId, waited_ms: u64 },

    /// The shard did not reply within the per-query timeout. Excluded from
    /// that query's results; the query still completes with partial data.
    #[error("{shard_id} timed out after {timeout_ms}ms")]
    ShardTimeout { shard_id: ShardId, timeout_ms: u64 },

    /// The shard could not be reached or the connection broke mid-call.
    #[error("{shard_id} unreachable: {reason}")]
    ShardUnreachable { shard_id: ShardId, reason: String },

    /// Connection acquisition raced with the shard's removal from topology.
    #[error("{shard_id} removed from topology")]
    ShardGone { shard_id: ShardId },

    /// A discovery candidate failed validation. The previous snapshot stays
    /// authoritative; queries are unaffected.
    #[error("topology candidate rejected: {0}")]
    TopologyInvalid(String),

    /// Zero reachable shards — the only topology condition fatal to a query.
    #[error("no shards available in topology version {version}")]
    NoShardsAvailable { version: u64 },

    /// A pagination continuation was invalidated by a topology change.
    #[error("cursor {cursor_id} is stale: {reason}")]
    StaleCursor { cursor_id: u64, reason: String },

    #[error("cursor {0} not found or expired")]
    CursorNotFound(u64),

    /// Malformed distribution request (e.g. a reducer the transformation
    /// table cannot split). Fatal to the query.
    #[error("planner error: {0}")]
    Planner(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The merge phase would buffer more rows than the configured cap.
    #[error("gather aborted: {rows} rows exceeds buffer limit of {limit}")]
    GatherOverflow { rows: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::ShardTimeout { .. }
            | CoordError::ShardUnreachable { .. }
            | CoordError::ShardGone { .. } => ErrorKind::PerShard,
            CoordError::PoolExhausted { .. } | CoordError::GatherOverflow { .. } => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Terminal,
        }
    }

    /// Per-shard failures are absorbed into partial results rather than
    /// aborting the whole query.
    pub fn is_per_shard(&self) -> bool {
        self.kind() == ErrorKind::PerShard
    }
}
