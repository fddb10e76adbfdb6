use serde::{Deserialize, Serialize};

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub cursor: CursorConfig,
}

/// Topology discovery loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Period between polls of the slot-assignment authority, in milliseconds.
    #[serde(default = "default_discovery_interval_ms")]
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_discovery_interval_ms(),
        }
    }
}

/// Per-shard connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Reusable connections held per shard.
    #[serde(default = "default_connections_per_shard")]
    pub connections_per_shard: usize,
    /// How long an `acquire` may wait for a free connection before failing
    /// with `PoolExhausted`, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_shard: default_connections_per_shard(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Query fanout and merge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Bound on the whole fanout of one query, in milliseconds. Shards that
    /// do not reply in time are excluded from that query's results.
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
    /// Result window size when the plan carries no LIMIT stage.
    #[serde(default = "default_result_limit")]
    pub default_limit: usize,
    /// Per-shard sample size for distributed QUANTILE.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Cap on rows buffered during the merge phase. Exceeding it aborts the
    /// query with `GatherOverflow`.
    #[serde(default = "default_max_rows_buffered")]
    pub max_rows_buffered: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_query_timeout_ms(),
            default_limit: default_result_limit(),
            sample_size: default_sample_size(),
            max_rows_buffered: default_max_rows_buffered(),
        }
    }
}

/// Cursor (multi-batch pagination) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Inactivity TTL after which a cursor is reaped, in milliseconds.
    #[serde(default = "default_cursor_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cursor_ttl_ms(),
        }
    }
}

fn default_discovery_interval_ms() -> u64 {
    1_000
}

fn default_connections_per_shard() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    500
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_result_limit() -> usize {
    10
}

fn default_sample_size() -> usize {
    500
}

fn default_max_rows_buffered() -> usize {
    1_000_000
}

fn default_cursor_ttl_ms() -> u64 {
    300_000
}
