//! Per-model pricing used for the usage event cost breakdown.
//!
//! A compact static catalog: USD per 1M tokens for input, cache reads, and
//! output, keyed by model-name prefix. Unknown models price at zero so the
//! accounting fields still appear in events and records.

use serde_json::{json, Value};

use warren_domain::usage::UsageState;

#[derive(Clone, Copy, Debug)]
struct ModelRates {
    prefix: &'static str,
    input_usd_per_1m: f64,
    cache_read_usd_per_1m: f64,
    output_usd_per_1m: f64,
}

const CATALOG: [ModelRates; 7] = [
    ModelRates {
        prefix: "deepseek-chat",
        input_usd_per_1m: 0.27,
        cache_read_usd_per_1m: 0.07,
        output_usd_per_1m: 1.10,
    },
    ModelRates {
        prefix: "deepseek-reasoner",
        input_usd_per_1m: 0.55,
        cache_read_usd_per_1m: 0.14,
        output_usd_per_1m: 2.19,
    },
    ModelRates {
        prefix: "gpt-4o-mini",
        input_usd_per_1m: 0.15,
        cache_read_usd_per_1m: 0.075,
        output_usd_per_1m: 0.60,
    },
    ModelRates {
        prefix: "gpt-4o",
        input_usd_per_1m: 2.50,
        cache_read_usd_per_1m: 1.25,
        output_usd_per_1m: 10.00,
    },
    ModelRates {
        prefix: "gpt-4.1",
        input_usd_per_1m: 2.00,
        cache_read_usd_per_1m: 0.50,
        output_usd_per_1m: 8.00,
    },
    ModelRates {
        prefix: "claude-sonnet",
        input_usd_per_1m: 3.00,
        cache_read_usd_per_1m: 0.30,
        output_usd_per_1m: 15.00,
    },
    ModelRates {
        prefix: "gemini-2.5-flash",
        input_usd_per_1m: 0.30,
        cache_read_usd_per_1m: 0.075,
        output_usd_per_1m: 2.50,
    },
];

fn rates_for(model: &str) -> Option<&'static ModelRates> {
    let lower = model.to_lowercase();
    CATALOG.iter().find(|rates| lower.starts_with(rates.prefix))
}

/// Cost breakdown for a usage snapshot:
/// `{estimated_cost_usd, input_cost_usd, cached_input_cost_usd, output_cost_usd, pricing_known}`.
pub fn estimate_cost(state: &UsageState) -> Value {
    let numbers = &state.numbers;
    let Some(rates) = rates_for(&state.identity.model) else {
        return json!({
            "estimated_cost_usd": 0.0,
            "input_cost_usd": 0.0,
            "cached_input_cost_usd": 0.0,
            "output_cost_usd": 0.0,
            "pricing_known": false,
        });
    };

    let per_token = |count: u64, usd_per_1m: f64| count as f64 * usd_per_1m / 1_000_000.0;
    let cached = numbers.input_cache_read_tokens.min(numbers.input_tokens);
    let uncached = numbers.input_tokens - cached;
    let input_cost = per_token(uncached, rates.input_usd_per_1m);
    let cached_cost = per_token(cached, rates.cache_read_usd_per_1m);
    let output_cost = per_token(numbers.output_tokens, rates.output_usd_per_1m);

    json!({
        "estimated_cost_usd": input_cost + cached_cost + output_cost,
        "input_cost_usd": input_cost,
        "cached_input_cost_usd": cached_cost,
        "output_cost_usd": output_cost,
        "pricing_known": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_domain::usage::{UsageIdentity, UsageNumbers};

    fn state(model: &str, input: u64, cached: u64, output: u64) -> UsageState {
        UsageState {
            numbers: UsageNumbers {
                input_tokens: input,
                input_cache_read_tokens: cached,
                output_tokens: output,
                total_tokens: input + output,
                ..Default::default()
            },
            identity: UsageIdentity {
                model: model.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn known_model_prices_input_output_and_cache() {
        let cost = estimate_cost(&state("deepseek-chat", 1_000_000, 500_000, 1_000_000));
        assert_eq!(cost["pricing_known"], true);
        let total = cost["estimated_cost_usd"].as_f64().unwrap();
        // 0.5M uncached input + 0.5M cached + 1M output.
        let expected = 0.5 * 0.27 + 0.5 * 0.07 + 1.10;
        assert!((total - expected).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_prices_at_zero() {
        let cost = estimate_cost(&state("homegrown-llm", 1000, 0, 1000));
        assert_eq!(cost["pricing_known"], false);
        assert_eq!(cost["estimated_cost_usd"], 0.0);
    }

    #[test]
    fn longest_prefix_wins_for_mini_variants() {
        let mini = estimate_cost(&state("gpt-4o-mini", 1_000_000, 0, 0));
        let full = estimate_cost(&state("gpt-4o", 1_000_000, 0, 0));
        assert!(mini["estimated_cost_usd"].as_f64().unwrap() < full["estimated_cost_usd"].as_f64().unwrap());
    }
}
