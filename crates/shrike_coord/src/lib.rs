//! Distributed query coordinator for the Shrike sharded search engine.
//!
//! The coordinator accepts client queries, splits each aggregation plan
//! into a remote sub-plan (executed identically on every shard) and a
//! local sub-plan (executed once over the merged stream), fans the remote
//! command out to every master in a captured topology snapshot, and merges
//! the replies under strict ordering/top-K guarantees — staying correct
//! while shard membership and slot ownership change under it.
//!
//! Per-shard indexing, document storage, and the slot-assignment protocol
//! itself live elsewhere; this crate talks to them through the
//! `TopologyAuthority` and `ShardConnector` trait seams.

pub mod aggregate;
pub mod coordinator;
pub mod cursor;
pub mod discovery;
pub mod fanout;
pub mod plan;
pub mod planner;
pub mod pool;
pub mod response;
pub mod topology;
pub mod transport;

pub use aggregate::{Aggregator, FailurePolicy, FanoutMetrics, QueryOutcome};
pub use coordinator::{Coordinator, CursorBatch, SearchResult};
pub use cursor::{CursorManager, CursorState};
pub use discovery::{
    descriptors_from_specs, run_discovery_cycle, DiscoveryHandle, DiscoveryLoop, NodeSpec,
    ShardSpec, TopologyAuthority,
};
pub use fanout::{FanoutExecutor, FanoutItem, FanoutRequest, ReplyStream};
pub use plan::{
    AggregationPlan, DistributedPlan, GroupReduce, LocalCombine, LocalPlan, Reducer, RemotePlan,
    SortSpec, Stage, Window,
};
pub use planner::distribute;
pub use pool::{PoolManager, PoolStats, PooledConnection};
pub use response::{flat_format, structured_format};
pub use topology::{ShardDescriptor, SlotRange, TopologySnapshot, TopologyStore};
pub use transport::{
    InProcessConnector, RemoteCommand, ResultRow, ShardConnection, ShardConnector, ShardHandler,
    ShardReply, TcpConnector,
};
