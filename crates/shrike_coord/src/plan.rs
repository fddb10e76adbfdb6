//! Aggregation plan vocabulary shared by the planner, the fanout command,
//! and the aggregator: stages, reducers, and the remote/local split output.
//!
//! The plan arrives already parsed — parsing query strings is outside this
//! crate. A plan is a stage sequence; the planner splits it into a
//! `RemotePlan` executed identically on every shard and a `LocalPlan`
//! executed once over the merged stream.

use serde::{Deserialize, Serialize};

/// Prefix of remote-emitted intermediate aliases. Invisible to clients;
/// chosen so it cannot collide with user field names.
pub const PRIVATE_ALIAS_PREFIX: &str = "__shrike_";

/// An aggregation function inside a GROUPBY stage.
///
/// `RandomSample` and `SumOfSquares` are internal remote forms produced by
/// the distribution table (for QUANTILE and STDDEV); they are rejected when
/// they appear in a client plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reducer {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    ToList(String),
    StdDev(String),
    /// `Quantile(field, p)` with `p` in `[0, 1]`.
    Quantile(String, f64),
    /// Internal: reservoir sample of up to `k` field values per shard.
    RandomSample(String, usize),
    /// Internal: sum of squared field values.
    SumOfSquares(String),
}

impl Reducer {
    pub fn name(&self) -> &'static str {
        match self {
            Reducer::Count => "COUNT",
            Reducer::Sum(_) => "SUM",
            Reducer::Avg(_) => "AVG",
            Reducer::Min(_) => "MIN",
            Reducer::Max(_) => "MAX",
            Reducer::ToList(_) => "TOLIST",
            Reducer::StdDev(_) => "STDDEV",
            Reducer::Quantile(_, _) => "QUANTILE",
            Reducer::RandomSample(_, _) => "RANDOM_SAMPLE",
            Reducer::SumOfSquares(_) => "SUM_OF_SQUARES",
        }
    }

    /// True for the internal forms a client plan may not contain.
    pub fn is_internal(&self) -> bool {
        matches!(self, Reducer::RandomSample(_, _) | Reducer::SumOfSquares(_))
    }
}

/// One reducer with its output alias: `REDUCE f(field) AS alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReduce {
    pub reducer: Reducer,
    pub alias: String,
}

/// Sort key and direction for SORTBY stages and the merge step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: String,
    pub ascending: bool,
}

/// The requested result window: `LIMIT offset count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub offset: usize,
    pub count: usize,
}

impl Window {
    /// Rows a shard must return for a correct global top-K: `offset + count`.
    pub fn remote_bound(&self) -> usize {
        self.offset + self.count
    }
}

/// One stage of a logical aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    /// Filter/selection/intersection over the shard's own documents. The
    /// expression is opaque here — each shard evaluates it locally.
    Filter(String),
    SortBy(SortSpec),
    GroupBy {
        keys: Vec<String>,
        reduces: Vec<GroupReduce>,
    },
    Limit(Window),
}

/// A client query: the index to search plus its stage sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPlan {
    pub index: String,
    pub stages: Vec<Stage>,
}

impl AggregationPlan {
    pub fn new(index: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            index: index.into(),
            stages,
        }
    }
}

/// The sub-plan executed identically on every shard. Stage order is
/// preserved from the client plan; only reducer rewriting and the remote
/// LIMIT bound differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePlan {
    pub index: String,
    pub stages: Vec<Stage>,
}

impl RemotePlan {
    pub fn empty(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            stages: Vec::new(),
        }
    }
}

/// How the coordinator reconstructs one user-visible aggregate from the
/// private remote intermediates. This is the local half of the declarative
/// reducer transformation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalCombine {
    /// COUNT / SUM: sum the per-shard partials.
    SumInto { src: String, out: String },
    MinInto { src: String, out: String },
    MaxInto { src: String, out: String },
    /// TOLIST: concatenate the per-shard lists.
    ConcatInto { src: String, out: String },
    /// AVG: `SUM(sums) / SUM(counts)`.
    AvgOf {
        sum: String,
        count: String,
        out: String,
    },
    /// STDDEV: reconstruct sample variance from SUM, COUNT, SUM_OF_SQUARES.
    StdDevOf {
        sum: String,
        count: String,
        sum_sq: String,
        out: String,
    },
    /// QUANTILE(p) over the concatenated per-shard samples. Approximate.
    QuantileOf { sample: String, q: f64, out: String },
}

impl LocalCombine {
    /// The user-visible output alias this combinator produces.
    pub fn out(&self) -> &str {
        match self {
            LocalCombine::SumInto { out, .. }
            | LocalCombine::MinInto { out, .. }
            | LocalCombine::MaxInto { out, .. }
            | LocalCombine::ConcatInto { out, .. }
            | LocalCombine::AvgOf { out, .. }
            | LocalCombine::StdDevOf { out, .. }
            | LocalCombine::QuantileOf { out, .. } => out,
        }
    }
}

/// The sub-plan executed once on the coordinator over merged remote output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPlan {
    /// Group keys when the plan contains a grouping stage.
    pub group_keys: Vec<String>,
    /// Per-alias combinators, in the client plan's reducer order.
    pub combines: Vec<LocalCombine>,
    /// A SORTBY that followed the grouping stage — global order over the
    /// combined groups.
    pub sort: Option<SortSpec>,
    /// The exact requested window, applied after merge and combination.
    pub window: Window,
}

impl LocalPlan {
    pub fn is_grouped(&self) -> bool {
        !self.group_keys.is_empty() || !self.combines.is_empty()
    }
}

/// Planner output: the remote/local pair plus the pre-group sort key the
/// merge step orders by (when the plan sorts before grouping or does not
/// group at all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedPlan {
    pub remote: RemotePlan,
    pub local: LocalPlan,
    /// Sort driving the shard-stream merge; `None` means arrival order.
    pub merge_sort: Option<SortSpec>,
}
