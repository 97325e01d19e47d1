//! Token usage accounting.
//!
//! Providers report usage repeatedly and inconsistently during a streamed
//! turn: the same snapshot may arrive on several events, different events
//! may carry different field subsets, and some providers only ever report
//! cumulative values. [`UsageSources`] de-duplicates this by tracking the
//! last observed value per *source id* and adding only positive deltas to
//! the running [`UsageState`] — replaying an observation never changes the
//! totals.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric usage fields, in one place so the accumulator can iterate them.
pub const USAGE_FIELDS: [&str; 10] = [
    "input_tokens",
    "input_uncached_tokens",
    "input_cache_read_tokens",
    "input_cache_write_tokens_5m",
    "input_cache_write_tokens_1h",
    "input_cache_write_tokens_unknown",
    "output_tokens",
    "reasoning_tokens",
    "tool_input_tokens",
    "total_tokens",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageNumbers {
    pub input_tokens: u64,
    pub input_uncached_tokens: u64,
    pub input_cache_read_tokens: u64,
    pub input_cache_write_tokens_5m: u64,
    pub input_cache_write_tokens_1h: u64,
    pub input_cache_write_tokens_unknown: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub tool_input_tokens: u64,
    pub total_tokens: u64,
}

impl UsageNumbers {
    pub fn get(&self, field: &str) -> u64 {
        match field {
            "input_tokens" => self.input_tokens,
            "input_uncached_tokens" => self.input_uncached_tokens,
            "input_cache_read_tokens" => self.input_cache_read_tokens,
            "input_cache_write_tokens_5m" => self.input_cache_write_tokens_5m,
            "input_cache_write_tokens_1h" => self.input_cache_write_tokens_1h,
            "input_cache_write_tokens_unknown" => self.input_cache_write_tokens_unknown,
            "output_tokens" => self.output_tokens,
            "reasoning_tokens" => self.reasoning_tokens,
            "tool_input_tokens" => self.tool_input_tokens,
            "total_tokens" => self.total_tokens,
            _ => 0,
        }
    }

    pub fn set(&mut self, field: &str, value: u64) {
        match field {
            "input_tokens" => self.input_tokens = value,
            "input_uncached_tokens" => self.input_uncached_tokens = value,
            "input_cache_read_tokens" => self.input_cache_read_tokens = value,
            "input_cache_write_tokens_5m" => self.input_cache_write_tokens_5m = value,
            "input_cache_write_tokens_1h" => self.input_cache_write_tokens_1h = value,
            "input_cache_write_tokens_unknown" => self.input_cache_write_tokens_unknown = value,
            "output_tokens" => self.output_tokens = value,
            "reasoning_tokens" => self.reasoning_tokens = value,
            "tool_input_tokens" => self.tool_input_tokens = value,
            "total_tokens" => self.total_tokens = value,
            _ => {}
        }
    }

    pub fn cache_write_total(&self) -> u64 {
        self.input_cache_write_tokens_5m
            + self.input_cache_write_tokens_1h
            + self.input_cache_write_tokens_unknown
    }

    pub fn is_zero(&self) -> bool {
        USAGE_FIELDS.iter().all(|f| self.get(f) == 0)
    }
}

/// Who produced the tokens. Conflicting observations collapse to "mixed".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageIdentity {
    pub provider: String,
    pub model: String,
    pub model_source: String,
    pub usage_source: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageState {
    #[serde(flatten)]
    pub numbers: UsageNumbers,
    #[serde(flatten)]
    pub identity: UsageIdentity,
}

impl UsageState {
    /// Enforce the usage invariants and derive missing components:
    /// `input ≥ uncached + cache_read + Σ cache_write`, `uncached ≤ input`,
    /// `total = max(reported, input + output + tool_input)`.
    pub fn normalize(&mut self) {
        let n = &mut self.numbers;
        let component_sum =
            n.input_uncached_tokens + n.input_cache_read_tokens + n.cache_write_total();
        if n.input_tokens < component_sum {
            n.input_tokens = component_sum;
        }
        if n.input_uncached_tokens == 0 && n.input_tokens > 0 {
            n.input_uncached_tokens = n
                .input_tokens
                .saturating_sub(n.input_cache_read_tokens + n.cache_write_total());
        }
        n.input_uncached_tokens = n.input_uncached_tokens.min(n.input_tokens);
        let computed_total = n.input_tokens + n.output_tokens + n.tool_input_tokens;
        n.total_tokens = n.total_tokens.max(computed_total);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-source monotonic accumulation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Last-observed per-field values per source id.
#[derive(Clone, Debug, Default)]
pub struct UsageSources {
    observed: HashMap<String, UsageNumbers>,
}

impl UsageSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a candidate snapshot from `source_id` into `state`.
    ///
    /// For each numeric field only the positive delta over the source's
    /// last observation is added, so re-delivering the same snapshot is a
    /// no-op. Returns `true` when anything (numbers or identity) changed.
    pub fn accumulate(
        &mut self,
        state: &mut UsageState,
        source_id: &str,
        candidate: &UsageState,
    ) -> bool {
        let last = self.observed.entry(source_id.to_string()).or_default();
        let mut changed = false;

        for field in USAGE_FIELDS {
            let observed = candidate.numbers.get(field);
            let prior = last.get(field);
            if observed > prior {
                let delta = observed - prior;
                state.numbers.set(field, state.numbers.get(field) + delta);
                last.set(field, observed);
                changed = true;
            }
        }

        changed |= merge_identity(&mut state.identity, &candidate.identity);
        changed
    }

    pub fn source_count(&self) -> usize {
        self.observed.len()
    }
}

fn take_better(current: &mut String, candidate: &str, collapse_conflict: bool) -> bool {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate == "unknown" {
        return false;
    }
    if current.is_empty() || current == "unknown" {
        *current = candidate.to_string();
        return true;
    }
    if collapse_conflict && current != candidate && current != "mixed" {
        *current = "mixed".to_string();
        return true;
    }
    false
}

fn merge_identity(current: &mut UsageIdentity, candidate: &UsageIdentity) -> bool {
    let mut changed = false;
    changed |= take_better(&mut current.provider, &candidate.provider, true);
    changed |= take_better(&mut current.model, &candidate.model, true);
    changed |= take_better(&mut current.model_source, &candidate.model_source, false);
    changed |= take_better(&mut current.usage_source, &candidate.usage_source, false);
    changed
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction from provider payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn path_u64(payload: &Value, path: &[&str]) -> u64 {
    let mut current = payload;
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return 0,
        }
    }
    match current {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)).unwrap_or(0),
        Value::String(s) => s.trim().replace(',', "").parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

fn read_max(payload: &Value, paths: &[&[&str]]) -> u64 {
    paths.iter().map(|p| path_u64(payload, p)).max().unwrap_or(0)
}

/// Guess the provider from a model name.
pub fn infer_provider(model: &str) -> &'static str {
    let lower = model.to_lowercase();
    if lower.starts_with("claude") {
        "anthropic"
    } else if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
        "openai"
    } else if lower.starts_with("gemini") {
        "google"
    } else if lower.contains("deepseek") {
        "deepseek"
    } else {
        "unknown"
    }
}

/// Parse a raw provider `usage` object into a normalized [`UsageState`].
///
/// Field names vary per provider; each field reads the maximum over its
/// known alias paths. DeepSeek's cache hit/miss pair is folded into
/// cache-read and input when the standard fields are absent.
pub fn extract_usage_payload(payload: &Value, fallback_model: &str) -> UsageState {
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_model);
    let (model, model_source) = if model.is_empty() {
        ("unknown", "fallback_model")
    } else if payload.get("model").is_some() {
        (model, "payload")
    } else {
        (model, "fallback_model")
    };

    let mut numbers = UsageNumbers {
        input_tokens: read_max(payload, &[&["input_tokens"], &["prompt_tokens"]]),
        output_tokens: read_max(payload, &[&["output_tokens"], &["completion_tokens"]]),
        total_tokens: read_max(payload, &[&["total_tokens"]]),
        input_cache_read_tokens: read_max(
            payload,
            &[
                &["cache_read_input_tokens"],
                &["cached_input_tokens"],
                &["prompt_cache_hit_tokens"],
                &["prompt_tokens_details", "cached_tokens"],
                &["input_token_details", "cache_read"],
            ],
        ),
        input_cache_write_tokens_5m: read_max(
            payload,
            &[&["cache_creation", "ephemeral_5m_input_tokens"]],
        ),
        input_cache_write_tokens_1h: read_max(
            payload,
            &[&["cache_creation", "ephemeral_1h_input_tokens"]],
        ),
        reasoning_tokens: read_max(
            payload,
            &[
                &["reasoning_tokens"],
                &["completion_tokens_details", "reasoning_tokens"],
                &["output_token_details", "reasoning"],
            ],
        ),
        tool_input_tokens: read_max(
            payload,
            &[&["tool_use_prompt_tokens"], &["tool_use_prompt_token_count"]],
        ),
        ..Default::default()
    };

    // Aggregate cache-write figures that are not split by TTL.
    let write_agg = read_max(payload, &[&["cache_creation_input_tokens"]]);
    let known_writes = numbers.input_cache_write_tokens_5m + numbers.input_cache_write_tokens_1h;
    if write_agg > known_writes {
        numbers.input_cache_write_tokens_unknown = write_agg - known_writes;
    }

    // DeepSeek reports hit/miss instead of input/cache_read.
    let hit = path_u64(payload, &["prompt_cache_hit_tokens"]);
    let miss = path_u64(payload, &["prompt_cache_miss_tokens"]);
    if numbers.input_tokens == 0 && (hit > 0 || miss > 0) {
        numbers.input_tokens = hit + miss;
        numbers.input_uncached_tokens = miss;
    }

    let mut state = UsageState {
        numbers,
        identity: UsageIdentity {
            provider: infer_provider(model).to_string(),
            model: model.to_string(),
            model_source: model_source.to_string(),
            usage_source: "provider".to_string(),
        },
    };
    state.normalize();
    state
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(input: u64, output: u64, total: u64) -> UsageState {
        UsageState {
            numbers: UsageNumbers {
                input_tokens: input,
                output_tokens: output,
                total_tokens: total,
                ..Default::default()
            },
            identity: UsageIdentity {
                provider: "deepseek".into(),
                model: "deepseek-chat".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn replaying_a_snapshot_does_not_change_totals() {
        let mut state = UsageState::default();
        let mut sources = UsageSources::new();
        let candidate = snapshot(100, 20, 120);

        assert!(sources.accumulate(&mut state, "llm_end:r:1", &candidate));
        let first = state.numbers;
        assert!(!sources.accumulate(&mut state, "llm_end:r:1", &candidate));
        assert_eq!(state.numbers, first);
    }

    #[test]
    fn growing_snapshots_contribute_only_the_delta() {
        let mut state = UsageState::default();
        let mut sources = UsageSources::new();
        sources.accumulate(&mut state, "s", &snapshot(100, 20, 120));
        sources.accumulate(&mut state, "s", &snapshot(150, 30, 180));
        assert_eq!(state.numbers.input_tokens, 150);
        assert_eq!(state.numbers.output_tokens, 30);
        assert_eq!(state.numbers.total_tokens, 180);
    }

    #[test]
    fn independent_sources_sum() {
        let mut state = UsageState::default();
        let mut sources = UsageSources::new();
        sources.accumulate(&mut state, "llm_end:r:1", &snapshot(100, 20, 120));
        sources.accumulate(&mut state, "llm_end:r:2", &snapshot(40, 10, 50));
        assert_eq!(state.numbers.input_tokens, 140);
        assert_eq!(state.numbers.output_tokens, 30);
        assert_eq!(state.numbers.total_tokens, 170);
        assert_eq!(sources.source_count(), 2);
    }

    #[test]
    fn shrinking_observation_adds_nothing() {
        let mut state = UsageState::default();
        let mut sources = UsageSources::new();
        sources.accumulate(&mut state, "s", &snapshot(100, 20, 120));
        sources.accumulate(&mut state, "s", &snapshot(50, 5, 55));
        assert_eq!(state.numbers.input_tokens, 100);
    }

    #[test]
    fn conflicting_models_collapse_to_mixed() {
        let mut state = UsageState::default();
        let mut sources = UsageSources::new();
        sources.accumulate(&mut state, "a", &snapshot(1, 1, 2));
        let mut other = snapshot(1, 1, 2);
        other.identity.model = "gpt-4o".into();
        other.identity.provider = "openai".into();
        sources.accumulate(&mut state, "b", &other);
        assert_eq!(state.identity.model, "mixed");
        assert_eq!(state.identity.provider, "mixed");
    }

    #[test]
    fn normalize_derives_input_from_components() {
        let mut state = UsageState::default();
        state.numbers.input_uncached_tokens = 30;
        state.numbers.input_cache_read_tokens = 60;
        state.numbers.input_cache_write_tokens_5m = 10;
        state.numbers.output_tokens = 5;
        state.normalize();
        assert_eq!(state.numbers.input_tokens, 100);
        assert_eq!(state.numbers.total_tokens, 105);
    }

    #[test]
    fn normalize_clamps_uncached_and_recomputes_total() {
        let mut state = UsageState::default();
        state.numbers.input_tokens = 100;
        state.numbers.output_tokens = 40;
        state.numbers.tool_input_tokens = 10;
        state.numbers.total_tokens = 20; // under-reported
        state.normalize();
        assert_eq!(state.numbers.total_tokens, 150);
        assert!(state.numbers.input_uncached_tokens <= state.numbers.input_tokens);
    }

    #[test]
    fn extract_reads_openai_style_aliases() {
        let payload = json!({
            "prompt_tokens": 120,
            "completion_tokens": 30,
            "total_tokens": 150,
            "prompt_tokens_details": {"cached_tokens": 80},
            "completion_tokens_details": {"reasoning_tokens": 12},
        });
        let state = extract_usage_payload(&payload, "gpt-4o");
        assert_eq!(state.numbers.input_tokens, 120);
        assert_eq!(state.numbers.input_cache_read_tokens, 80);
        assert_eq!(state.numbers.input_uncached_tokens, 40);
        assert_eq!(state.numbers.reasoning_tokens, 12);
        assert_eq!(state.identity.provider, "openai");
    }

    #[test]
    fn extract_folds_deepseek_hit_miss() {
        let payload = json!({
            "prompt_cache_hit_tokens": 70,
            "prompt_cache_miss_tokens": 30,
            "completion_tokens": 10,
        });
        let state = extract_usage_payload(&payload, "deepseek-chat");
        assert_eq!(state.numbers.input_tokens, 100);
        assert_eq!(state.numbers.input_cache_read_tokens, 70);
        assert_eq!(state.numbers.input_uncached_tokens, 30);
        assert_eq!(state.identity.provider, "deepseek");
    }

    #[test]
    fn extract_splits_unknown_cache_writes() {
        let payload = json!({
            "input_tokens": 10,
            "cache_creation_input_tokens": 50,
            "cache_creation": {"ephemeral_5m_input_tokens": 30},
        });
        let state = extract_usage_payload(&payload, "claude-sonnet-4");
        assert_eq!(state.numbers.input_cache_write_tokens_5m, 30);
        assert_eq!(state.numbers.input_cache_write_tokens_unknown, 20);
        // input must cover all cache writes after normalization
        assert!(state.numbers.input_tokens >= 50);
    }
}
