//! Append-only LLM usage ledger with query and rollup support.
//!
//! One JSONL row per completed model interaction under
//! `storage/usage/llm_usage.jsonl`. Queries filter on a time window and
//! identity fields; `summarize` rolls records up into totals and
//! per-provider / per-provider+model buckets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::jsonl;
use crate::now_ms;

#[derive(Clone, Debug, Default)]
pub struct UsageQuery {
    pub since_hours: u64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub trigger_type: Option<String>,
    pub session_id: Option<String>,
    pub limit: usize,
}

impl UsageQuery {
    pub fn last_day() -> Self {
        Self {
            since_hours: 24,
            limit: 500,
            ..Default::default()
        }
    }
}

pub struct UsageStore {
    records_file: PathBuf,
}

const SUM_FIELDS: [&str; 6] = [
    "input_tokens",
    "input_uncached_tokens",
    "input_cache_read_tokens",
    "output_tokens",
    "reasoning_tokens",
    "total_tokens",
];

impl UsageStore {
    pub fn new(root_dir: &Path) -> Self {
        Self {
            records_file: root_dir.join("storage").join("usage").join("llm_usage.jsonl"),
        }
    }

    /// Append one record, stamping `timestamp_ms` when absent.
    pub fn append_record(&self, payload: &Value) {
        let mut row = payload.clone();
        if let Some(map) = row.as_object_mut() {
            map.entry("timestamp_ms").or_insert(json!(now_ms()));
        }
        if let Err(e) = jsonl::append_record(&self.records_file, &row) {
            tracing::warn!(error = %e, "failed to append usage record");
        }
    }

    fn matches(record: &Value, query: &UsageQuery, cutoff_ms: i64) -> bool {
        if record
            .get("timestamp_ms")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            < cutoff_ms
        {
            return false;
        }
        let field_eq = |key: &str, expected: &Option<String>| match expected {
            Some(want) if !want.is_empty() => {
                record.get(key).and_then(Value::as_str).unwrap_or("") == want
            }
            _ => true,
        };
        field_eq("provider", &query.provider)
            && field_eq("model", &query.model)
            && field_eq("trigger_type", &query.trigger_type)
            && field_eq("session_id", &query.session_id)
    }

    /// Matching records, newest first, capped at `query.limit`.
    pub fn query_records(&self, query: &UsageQuery) -> Vec<Value> {
        let cutoff_ms = now_ms() - (query.since_hours.max(1) as i64) * 3600 * 1000;
        let rows = jsonl::read_tail(&self.records_file, 100_000);
        rows.into_iter()
            .filter(|record| Self::matches(record, query, cutoff_ms))
            .take(query.limit.max(1))
            .collect()
    }

    /// Roll records up into totals, by-provider, and by-provider+model.
    pub fn summarize(&self, records: &[Value]) -> Value {
        let mut totals = Map::new();
        let mut by_provider: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        let mut by_provider_model: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

        let add_into = |bucket: &mut Map<String, Value>, record: &Value| {
            for field in SUM_FIELDS {
                let add = record.get(field).and_then(Value::as_u64).unwrap_or(0);
                let current = bucket.get(field).and_then(Value::as_u64).unwrap_or(0);
                bucket.insert(field.to_string(), json!(current + add));
            }
            let cost = record
                .get("estimated_cost_usd")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let current = bucket
                .get("estimated_cost_usd")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            bucket.insert("estimated_cost_usd".into(), json!(current + cost));
            let count = bucket.get("records").and_then(Value::as_u64).unwrap_or(0);
            bucket.insert("records".into(), json!(count + 1));
        };

        for record in records {
            add_into(&mut totals, record);
            let provider = record
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let model = record
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            add_into(by_provider.entry(provider.clone()).or_default(), record);
            add_into(
                by_provider_model
                    .entry(format!("{provider}/{model}"))
                    .or_default(),
                record,
            );
        }

        json!({
            "totals": totals,
            "by_provider": by_provider,
            "by_provider_model": by_provider_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, model: &str, total: u64) -> Value {
        json!({
            "provider": provider,
            "model": model,
            "trigger_type": "chat",
            "session_id": "s1",
            "input_tokens": total / 2,
            "output_tokens": total / 2,
            "total_tokens": total,
            "estimated_cost_usd": 0.01,
        })
    }

    #[test]
    fn append_and_query_filters_by_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = UsageStore::new(dir.path());
        store.append_record(&record("deepseek", "deepseek-chat", 100));
        store.append_record(&record("openai", "gpt-4o", 50));

        let mut query = UsageQuery::last_day();
        query.provider = Some("openai".into());
        let rows = store.query_records(&query);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["model"], "gpt-4o");
    }

    #[test]
    fn summarize_rolls_up_by_provider_and_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = UsageStore::new(dir.path());
        let records = vec![
            record("deepseek", "deepseek-chat", 100),
            record("deepseek", "deepseek-chat", 60),
            record("openai", "gpt-4o", 40),
        ];
        let summary = store.summarize(&records);
        assert_eq!(summary["totals"]["total_tokens"], 200);
        assert_eq!(summary["totals"]["records"], 3);
        assert_eq!(summary["by_provider"]["deepseek"]["total_tokens"], 160);
        assert_eq!(
            summary["by_provider_model"]["deepseek/deepseek-chat"]["records"],
            2
        );
    }

    #[test]
    fn query_respects_limit_newest_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = UsageStore::new(dir.path());
        for idx in 0..5 {
            let mut row = record("deepseek", "deepseek-chat", idx);
            row["run_id"] = json!(format!("r{idx}"));
            store.append_record(&row);
        }
        let mut query = UsageQuery::last_day();
        query.limit = 2;
        let rows = store.query_records(&query);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["run_id"], "r4");
    }
}
