//! `search_knowledge_base` — hybrid retrieval over the knowledge domain.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use warren_domain::config::{RetrievalDomainConfig, RetrievalStorageConfig};
use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;
use warren_retrieval::{Domain, RetrievalIndex};

use crate::{Tool, ToolContext};

const MAX_TOP_K: usize = 10;
const SNIPPET_CHARS: usize = 300;

pub struct SearchKnowledgeTool {
    retrieval: Arc<RetrievalIndex>,
    settings: RetrievalDomainConfig,
    storage: RetrievalStorageConfig,
}

impl SearchKnowledgeTool {
    pub fn new(
        retrieval: Arc<RetrievalIndex>,
        settings: RetrievalDomainConfig,
        storage: RetrievalStorageConfig,
    ) -> Self {
        Self {
            retrieval,
            settings,
            storage,
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn name(&self) -> &'static str {
        "search_knowledge_base"
    }

    fn description(&self) -> &'static str {
        "Search local knowledge files with hybrid scoring"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L0Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": MAX_TOP_K},
            }
        })
    }

    async fn run(&self, args: &Value, _context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if query.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'query' argument",
                elapsed(&started),
            ));
        }
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.settings.top_k)
            .clamp(1, MAX_TOP_K);

        let hits = self
            .retrieval
            .retrieve(Domain::Knowledge, &query, top_k, &self.settings, &self.storage)
            .await;

        let results: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                let snippet: String = hit
                    .text
                    .chars()
                    .take(SNIPPET_CHARS)
                    .collect::<String>()
                    .replace('\n', " ");
                json!({"text": snippet, "score": hit.score, "source": hit.source})
            })
            .collect();

        let mut data = Map::new();
        data.insert("query".into(), json!(query));
        data.insert("results".into(), Value::Array(results));
        Ok(ToolResult::success(self.name(), data, elapsed(&started), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_domain::tool::TriggerType;
    use warren_retrieval::NoopEmbedder;

    fn tool_in(dir: &std::path::Path) -> SearchKnowledgeTool {
        let retrieval = Arc::new(RetrievalIndex::new(dir, Arc::new(NoopEmbedder)));
        SearchKnowledgeTool::new(
            retrieval,
            RetrievalDomainConfig::default(),
            RetrievalStorageConfig {
                engine: warren_domain::config::RetrievalEngine::Json,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn finds_matching_knowledge_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("knowledge")).unwrap();
        std::fs::write(
            dir.path().join("knowledge/facts.md"),
            "the lighthouse keeper logs every storm",
        )
        .unwrap();
        let tool = tool_in(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let result = tool
            .run(&json!({"query": "lighthouse storm"}), &ctx)
            .await
            .unwrap();
        assert!(result.ok);
        let rows = result.data["results"].as_array().unwrap();
        assert!(!rows.is_empty());
        assert_eq!(rows[0]["source"], "knowledge/facts.md");
    }

    #[tokio::test]
    async fn empty_query_is_invalid_args() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = tool_in(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let result = tool.run(&json!({"query": "  "}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn empty_corpus_yields_empty_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = tool_in(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let result = tool.run(&json!({"query": "anything"}), &ctx).await.unwrap();
        assert!(result.ok);
        assert!(result.data["results"].as_array().unwrap().is_empty());
    }
}
