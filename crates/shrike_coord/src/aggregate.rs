//! Result aggregator: consumes the fanout reply stream, validates slot
//! ownership against the query's originating snapshot, merges (bounded
//! top-K heap when sorted, arrival order otherwise, group-combine when
//! grouped), runs the local sub-plan, and applies the exact window.
//!
//! The pass is lazy, finite, and single-use: repeating a query requires a
//! fresh fanout. Per-shard failures are absorbed into partial results under
//! the default best-effort policy; only zero successful shards is fatal.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use shrike_common::config::QueryConfig;
use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::ShardId;
use shrike_common::value::{add_values, cmp_values, Value};

use crate::fanout::ReplyStream;
use crate::plan::{DistributedPlan, LocalCombine, LocalPlan, SortSpec, Window};
use crate::topology::TopologySnapshot;
use crate::transport::ResultRow;

/// How shard failures affect the query (teacher of the default: degrade
/// gracefully, annotate, keep going).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Any per-shard failure fails the whole query.
    Strict,
    /// Per-shard failures are excluded and reported in `failed_shards`.
    BestEffort,
}

/// Per-query fanout/merge metrics for observability.
#[derive(Debug, Clone, Default)]
pub struct FanoutMetrics {
    pub snapshot_version: u64,
    pub shards_participated: usize,
    pub total_rows_gathered: usize,
    pub rows_dropped_ownership: usize,
    pub merge_latency_us: u64,
    pub total_latency_us: u64,
    pub per_shard_rows: Vec<(u64, usize)>,
    pub per_shard_latency_us: Vec<(u64, u64)>,
    pub failed_shards: Vec<u64>,
}

/// The merged, windowed result of one fanout.
pub struct QueryOutcome {
    pub rows: Vec<ResultRow>,
    /// Merged row (or group) count before window truncation.
    pub total: usize,
    pub failed_shards: Vec<ShardId>,
    /// Continuation tokens from shards that have more data.
    pub cursor_tokens: HashMap<ShardId, String>,
    pub metrics: FanoutMetrics,
}

pub struct Aggregator {
    policy: FailurePolicy,
    max_rows_buffered: usize,
}

impl Aggregator {
    pub fn new(cfg: &QueryConfig) -> Self {
        Self {
            policy: FailurePolicy::BestEffort,
            max_rows_buffered: cfg.max_rows_buffered,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Drain the reply stream and produce the merged outcome.
    pub async fn collect(
        &self,
        mut stream: ReplyStream,
        plan: &DistributedPlan,
        snapshot: &TopologySnapshot,
    ) -> CoordResult<QueryOutcome> {
        let total_start = Instant::now();
        let grouped = plan.local.is_grouped();
        let window = plan.local.window;
        let gather_bound = window.remote_bound().max(1);

        let mut failed: Vec<ShardId> = Vec::new();
        let mut ok_shards = 0usize;
        let mut gathered = 0usize;
        let mut dropped = 0usize;
        let mut per_shard_rows: Vec<(u64, usize)> = Vec::new();
        let mut per_shard_latency: Vec<(u64, u64)> = Vec::new();
        let mut cursor_tokens: HashMap<ShardId, String> = HashMap::new();

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let mut concat: Vec<ResultRow> = Vec::new();
        let mut groups: HashMap<Vec<u8>, Vec<(String, Value)>> = HashMap::new();

        while let Some(item) = stream.next().await {
            let reply = match item.result {
                Ok(reply) => reply,
                Err(e) if e.is_per_shard() && self.policy == FailurePolicy::BestEffort => {
                    tracing::warn!(
                        shard_id = item.shard_id.0,
                        error = %e,
                        "shard excluded from query results"
                    );
                    failed.push(item.shard_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            ok_shards += 1;
            per_shard_rows.push((reply.shard_id.0, reply.rows.len()));
            per_shard_latency.push((reply.shard_id.0, item.latency_us));
            if let Some(shard_version) = reply.topology_version {
                if shard_version != snapshot.version {
                    tracing::debug!(
                        shard_id = reply.shard_id.0,
                        shard_version,
                        coordinator_version = snapshot.version,
                        "shard observed a different topology version"
                    );
                }
            }
            if let Some(token) = reply.cursor_token.clone() {
                cursor_tokens.insert(reply.shard_id, token);
            }

            for row in reply.rows {
                // Migration dedup: a document row must belong to a slot the
                // replying shard owned in this query's snapshot. Mismatches
                // are dropped — the owning shard answers for that slot.
                if !row.key.is_empty() && !snapshot.shard_owns(reply.shard_id, row.slot) {
                    dropped += 1;
                    tracing::debug!(
                        shard_id = reply.shard_id.0,
                        key = %row.key,
                        slot = row.slot,
                        "row dropped: slot not owned in originating snapshot"
                    );
                    continue;
                }

                gathered += 1;
                if gathered > self.max_rows_buffered {
                    return Err(CoordError::GatherOverflow {
                        rows: gathered,
                        limit: self.max_rows_buffered,
                    });
                }

                if grouped {
                    let key = group_key(&plan.local.group_keys, &row.fields);
                    match groups.entry(key) {
                        Entry::Vacant(e) => {
                            e.insert(row.fields);
                        }
                        Entry::Occupied(mut e) => {
                            merge_partials(e.get_mut(), &row.fields, &plan.local.combines);
                        }
                    }
                } else if let Some(sort) = &plan.merge_sort {
                    heap.push(HeapEntry {
                        row,
                        ascending: sort.ascending,
                    });
                    if heap.len() > gather_bound {
                        heap.pop();
                    }
                } else {
                    concat.push(row);
                }
            }
        }

        if ok_shards == 0 {
            return Err(CoordError::NoShardsAvailable {
                version: snapshot.version,
            });
        }

        let merge_start = Instant::now();
        let (rows, total) = if grouped {
            let mut finalized: Vec<ResultRow> = groups
                .into_values()
                .map(|fields| finalize_group(&plan.local, fields))
                .collect();
            match &plan.local.sort {
                Some(sort) => finalized.sort_by(|a, b| group_order(a, b, sort)),
                // No requested order: sort by group key so output is
                // deterministic across reply interleavings.
                None => finalized.sort_by(|a, b| a.key.cmp(&b.key)),
            }
            let total = finalized.len();
            (apply_window(finalized, window), total)
        } else if plan.merge_sort.is_some() {
            let sorted: Vec<ResultRow> = heap.into_sorted_vec().into_iter().map(|e| e.row).collect();
            (apply_window(sorted, window), gathered)
        } else {
            (apply_window(concat, window), gathered)
        };

        let metrics = FanoutMetrics {
            snapshot_version: snapshot.version,
            shards_participated: ok_shards,
            total_rows_gathered: gathered,
            rows_dropped_ownership: dropped,
            merge_latency_us: merge_start.elapsed().as_micros() as u64,
            total_latency_us: total_start.elapsed().as_micros() as u64,
            per_shard_rows,
            per_shard_latency_us: per_shard_latency,
            failed_shards: failed.iter().map(|s| s.0).collect(),
        };

        Ok(QueryOutcome {
            rows,
            total,
            failed_shards: failed,
            cursor_tokens,
            metrics,
        })
    }
}

// ── Sorted merge ─────────────────────────────────────────────────────

/// Heap entry ordered by the query's output order, so the bounded max-heap
/// evicts the row furthest from the window.
struct HeapEntry {
    row: ResultRow,
    ascending: bool,
}

/// Output order: sort key in query direction, ties broken by document key.
fn output_order(a: &ResultRow, b: &ResultRow, ascending: bool) -> Ordering {
    let mut ord = match (&a.sort_key, &b.sort_key) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => cmp_values(x, y),
    };
    if !ascending {
        ord = ord.reverse();
    }
    ord.then_with(|| a.key.cmp(&b.key))
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        output_order(&self.row, &other.row, self.ascending)
    }
}

fn group_order(a: &ResultRow, b: &ResultRow, sort: &SortSpec) -> Ordering {
    let null = Value::Null;
    let va = a.field(&sort.key).unwrap_or(&null);
    let vb = b.field(&sort.key).unwrap_or(&null);
    let mut ord = cmp_values(va, vb);
    if !sort.ascending {
        ord = ord.reverse();
    }
    ord.then_with(|| a.key.cmp(&b.key))
}

fn apply_window(mut rows: Vec<ResultRow>, window: Window) -> Vec<ResultRow> {
    if window.offset >= rows.len() {
        return Vec::new();
    }
    if window.offset > 0 {
        rows = rows.split_off(window.offset);
    }
    rows.truncate(window.count);
    rows
}

// ── Group combine ────────────────────────────────────────────────────

fn field_of<'a>(fields: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
}

/// Deterministic binary group key: type tag byte then value bytes, per
/// group-key field in plan order.
fn group_key(keys: &[String], fields: &[(String, Value)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * 9);
    for name in keys {
        encode_value(&mut out, field_of(fields, name).unwrap_or(&Value::Null));
    }
    out
}

fn encode_value(out: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Null => out.push(0),
        Value::Bool(b) => {
            out.push(1);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            out.push(3);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Str(s) => {
            out.push(4);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            out.push(5);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_value(out, item);
            }
        }
    }
}

/// Merge one shard's group partial into the accumulated entry, combinator
/// by combinator. Null partials act as identities.
fn merge_partials(
    entry: &mut Vec<(String, Value)>,
    incoming: &[(String, Value)],
    combines: &[LocalCombine],
) {
    for combine in combines {
        match combine {
            LocalCombine::SumInto { src, .. } => fold(entry, incoming, src, |cur, inc| {
                add_values(cur, inc)
            }),
            LocalCombine::MinInto { src, .. } => fold(entry, incoming, src, |cur, inc| {
                match (cur.is_null(), inc.is_null()) {
                    (_, true) => cur.clone(),
                    (true, false) => inc.clone(),
                    (false, false) => {
                        if cmp_values(inc, cur) == Ordering::Less {
                            inc.clone()
                        } else {
                            cur.clone()
                        }
                    }
                }
            }),
            LocalCombine::MaxInto { src, .. } => fold(entry, incoming, src, |cur, inc| {
                match (cur.is_null(), inc.is_null()) {
                    (_, true) => cur.clone(),
                    (true, false) => inc.clone(),
                    (false, false) => {
                        if cmp_values(inc, cur) == Ordering::Greater {
                            inc.clone()
                        } else {
                            cur.clone()
                        }
                    }
                }
            }),
            LocalCombine::ConcatInto { src, .. } => concat_field(entry, incoming, src),
            LocalCombine::AvgOf { sum, count, .. } => {
                fold(entry, incoming, sum, |c, i| add_values(c, i));
                fold(entry, incoming, count, |c, i| add_values(c, i));
            }
            LocalCombine::StdDevOf {
                sum,
                count,
                sum_sq,
                ..
            } => {
                fold(entry, incoming, sum, |c, i| add_values(c, i));
                fold(entry, incoming, count, |c, i| add_values(c, i));
                fold(entry, incoming, sum_sq, |c, i| add_values(c, i));
            }
            LocalCombine::QuantileOf { sample, .. } => concat_field(entry, incoming, sample),
        }
    }
}

fn fold(
    entry: &mut Vec<(String, Value)>,
    incoming: &[(String, Value)],
    name: &str,
    f: impl Fn(&Value, &Value) -> Value,
) {
    let inc = field_of(incoming, name).cloned().unwrap_or(Value::Null);
    match entry.iter_mut().find(|(n, _)| n == name) {
        Some((_, cur)) => *cur = f(cur, &inc),
        None => entry.push((name.to_string(), inc)),
    }
}

fn concat_field(entry: &mut Vec<(String, Value)>, incoming: &[(String, Value)], name: &str) {
    let inc = match field_of(incoming, name) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    };
    match entry.iter_mut().find(|(n, _)| n == name) {
        Some((_, Value::Array(items))) => items.extend(inc),
        Some((_, cur)) if cur.is_null() => *cur = Value::Array(inc),
        Some(_) => {}
        None => entry.push((name.to_string(), Value::Array(inc))),
    }
}

/// Turn an accumulated partial entry into the final client-visible group
/// row: group keys first, then each combinator's output alias. Private
/// intermediates do not survive.
fn finalize_group(local: &LocalPlan, fields: Vec<(String, Value)>) -> ResultRow {
    let mut out_fields: Vec<(String, Value)> = Vec::with_capacity(
        local.group_keys.len() + local.combines.len(),
    );
    let mut key_parts: Vec<String> = Vec::with_capacity(local.group_keys.len());
    for k in &local.group_keys {
        let v = field_of(&fields, k).cloned().unwrap_or(Value::Null);
        key_parts.push(v.to_string());
        out_fields.push((k.clone(), v));
    }

    for combine in &local.combines {
        let v = match combine {
            LocalCombine::SumInto { src, .. }
            | LocalCombine::MinInto { src, .. }
            | LocalCombine::MaxInto { src, .. }
            | LocalCombine::ConcatInto { src, .. } => {
                field_of(&fields, src).cloned().unwrap_or(Value::Null)
            }
            LocalCombine::AvgOf { sum, count, .. } => {
                let s = field_of(&fields, sum).and_then(|v| v.as_f64()).unwrap_or(0.0);
                let n = field_of(&fields, count).and_then(|v| v.as_f64()).unwrap_or(0.0);
                if n > 0.0 {
                    Value::Float(s / n)
                } else {
                    Value::Null
                }
            }
            LocalCombine::StdDevOf {
                sum,
                count,
                sum_sq,
                ..
            } => {
                let s = field_of(&fields, sum).and_then(|v| v.as_f64()).unwrap_or(0.0);
                let n = field_of(&fields, count).and_then(|v| v.as_f64()).unwrap_or(0.0);
                let sq = field_of(&fields, sum_sq).and_then(|v| v.as_f64()).unwrap_or(0.0);
                if n < 1.0 {
                    Value::Null
                } else if n < 2.0 {
                    Value::Float(0.0)
                } else {
                    let variance = ((sq - s * s / n) / (n - 1.0)).max(0.0);
                    Value::Float(variance.sqrt())
                }
            }
            LocalCombine::QuantileOf { sample, q, .. } => {
                let mut values: Vec<f64> = match field_of(&fields, sample) {
                    Some(Value::Array(items)) => {
                        items.iter().filter_map(|v| v.as_f64()).collect()
                    }
                    _ => Vec::new(),
                };
                if values.is_empty() {
                    Value::Null
                } else {
                    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                    let idx = ((values.len() - 1) as f64 * q).round() as usize;
                    Value::Float(values[idx])
                }
            }
        };
        out_fields.push((combine.out().to_string(), v));
    }

    ResultRow {
        key: key_parts.join("\u{1f}"),
        slot: 0,
        sort_key: None,
        fields: out_fields,
    }
}
