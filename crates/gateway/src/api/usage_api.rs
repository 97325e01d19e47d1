//! Usage reporting: raw records and rollup summaries per agent.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use warren_storage::UsageQuery;

use crate::state::AppState;

use super::errors::{data, ApiResult};

#[derive(Debug, Deserialize)]
pub struct UsageParams {
    #[serde(default)]
    pub since_hours: Option<u64>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl UsageParams {
    fn to_query(&self, limit: usize) -> UsageQuery {
        UsageQuery {
            since_hours: self.since_hours.unwrap_or(24).clamp(1, 24 * 365),
            provider: self.provider.clone(),
            model: self.model.clone(),
            trigger_type: self.trigger_type.clone(),
            session_id: self.session_id.clone(),
            limit,
        }
    }

    fn filters(&self, limit: Option<usize>) -> Value {
        let mut filters = json!({
            "agent_id": self.agent_id.as_deref().unwrap_or("default"),
            "since_hours": self.since_hours.unwrap_or(24),
            "provider": self.provider.as_deref().unwrap_or(""),
            "model": self.model.as_deref().unwrap_or(""),
            "trigger_type": self.trigger_type.as_deref().unwrap_or(""),
            "session_id": self.session_id.as_deref().unwrap_or(""),
        });
        if let Some(limit) = limit {
            filters["limit"] = json!(limit);
        }
        filters
    }
}

pub async fn records(
    State(state): State<AppState>,
    Query(params): Query<UsageParams>,
) -> ApiResult<Json<Value>> {
    let runtime = state
        .registry
        .get_runtime(params.agent_id.as_deref().unwrap_or("default"))?;
    let limit = params.limit.unwrap_or(200).clamp(1, 2000);
    let rows = runtime.usage.query_records(&params.to_query(limit));
    Ok(data(json!({
        "filters": params.filters(Some(limit)),
        "count": rows.len(),
        "records": rows,
    })))
}

pub async fn summary(
    State(state): State<AppState>,
    Query(params): Query<UsageParams>,
) -> ApiResult<Json<Value>> {
    let runtime = state
        .registry
        .get_runtime(params.agent_id.as_deref().unwrap_or("default"))?;
    let rows = runtime.usage.query_records(&params.to_query(100_000));
    let summary = runtime.usage.summarize(&rows);
    Ok(data(json!({
        "filters": params.filters(None),
        "totals": summary["totals"],
        "by_provider_model": summary["by_provider_model"],
        "by_provider": summary["by_provider"],
        "count": rows.len(),
    })))
}
