//! Client-facing response formats.
//!
//! Both formats are pure serializations of the aggregator's final merged,
//! limited row sequence — no core semantics differ between them. The flat
//! format is the total count followed by interleaved key/field-pair
//! entries; the structured format is a total plus named-field objects.

use serde_json::{json, Value as Json};

use shrike_common::types::ShardId;
use shrike_common::value::Value;

use crate::transport::ResultRow;

fn to_json(v: &Value) -> Json {
    match v {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
    }
}

/// `[total, key1, [name1, value1, name2, value2, ...], key2, [...], ...]`
pub fn flat_format(total: usize, rows: &[ResultRow]) -> Json {
    let mut out: Vec<Json> = Vec::with_capacity(1 + rows.len() * 2);
    out.push(json!(total));
    for row in rows {
        out.push(json!(row.key));
        let mut pairs: Vec<Json> = Vec::with_capacity(row.fields.len() * 2);
        for (name, value) in &row.fields {
            pairs.push(json!(name));
            pairs.push(to_json(value));
        }
        out.push(Json::Array(pairs));
    }
    Json::Array(out)
}

/// `{"total": n, "results": [{"key": ..., "fields": {...}}, ...],
///   "failed_shards": [...]}`
pub fn structured_format(total: usize, rows: &[ResultRow], failed_shards: &[ShardId]) -> Json {
    let results: Vec<Json> = rows
        .iter()
        .map(|row| {
            let fields: serde_json::Map<String, Json> = row
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), to_json(value)))
                .collect();
            json!({ "key": row.key, "fields": fields })
        })
        .collect();
    json!({
        "total": total,
        "results": results,
        "failed_shards": failed_shards.iter().map(|s| s.0).collect::<Vec<_>>(),
    })
}
