//! The tool sandbox: a fixed set of tools executed through one policy-,
//! audit-, and retry-guarded runner.
//!
//! Tools implement the [`Tool`] trait and are instantiated only by
//! [`build_all_tools`], so the runner can enumerate capabilities and apply
//! a uniform contract. Partial-success tools (`read_files`) report
//! per-element outcomes with a single `partial` flag instead of failing the
//! whole call.

pub mod apply_patch;
pub mod fetch_url;
pub mod guard;
pub mod path_guard;
pub mod policy;
pub mod python_repl;
pub mod read_file;
pub mod read_files;
pub mod runner;
pub mod search_knowledge;
pub mod terminal;
pub mod web_search;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use warren_domain::config::RuntimeConfig;
use warren_domain::tool::{PermissionLevel, ToolResult, TriggerType};
use warren_domain::Result;
use warren_retrieval::RetrievalIndex;

pub use policy::{PolicyDecision, ToolPolicyEngine};
pub use runner::ToolRunner;

/// Ambient state a tool invocation runs with.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub trigger_type: TriggerType,
    pub explicit_enabled_tools: Vec<String>,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn new(workspace_root: &Path, trigger_type: TriggerType) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            trigger_type,
            explicit_enabled_tools: Vec::new(),
            run_id: None,
            session_id: None,
        }
    }
}

/// One sandboxed tool. The implementation set is closed: every instance is
/// created by [`build_all_tools`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn permission_level(&self) -> PermissionLevel;
    /// JSON Schema for the tool's arguments, shown to the model.
    fn parameters_schema(&self) -> Value;
    /// Execute. `Err` means an unexpected internal failure; expected
    /// failures come back as `Ok(ToolResult::failure(..))`.
    async fn run(&self, args: &Value, context: &ToolContext) -> Result<ToolResult>;
}

/// The explicit-enable list configured for a trigger.
pub fn explicit_enabled_tools(config: &RuntimeConfig, trigger: TriggerType) -> Vec<String> {
    match trigger {
        TriggerType::Chat => config.autonomous_tools.chat_enabled_tools.clone(),
        TriggerType::Heartbeat => config.autonomous_tools.heartbeat_enabled_tools.clone(),
        TriggerType::Cron => config.autonomous_tools.cron_enabled_tools.clone(),
    }
}

/// Instantiate the full tool set for a workspace.
pub fn build_all_tools(
    workspace_root: &Path,
    config: &RuntimeConfig,
    retrieval: Arc<RetrievalIndex>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(read_file::ReadFileTool::new(
            config.tool_output_limits.read_file_chars,
        )),
        Arc::new(read_files::ReadFilesTool::new(
            config.tool_output_limits.read_file_chars,
        )),
        Arc::new(terminal::TerminalTool::new(
            config.tool_timeouts.terminal_seconds,
            config.tool_output_limits.terminal_chars,
        )),
        Arc::new(python_repl::PythonReplTool::new(
            config.tool_timeouts.python_repl_seconds,
            config.tool_output_limits.terminal_chars,
        )),
        Arc::new(fetch_url::FetchUrlTool::new(
            config.tool_timeouts.fetch_url_seconds,
            config.tool_output_limits.fetch_url_chars,
        )),
        Arc::new(web_search::WebSearchTool::new(
            config.tool_timeouts.fetch_url_seconds,
        )),
        Arc::new(search_knowledge::SearchKnowledgeTool::new(
            retrieval,
            config.retrieval.knowledge.clone(),
            config.retrieval.storage.clone(),
        )),
        Arc::new(apply_patch::ApplyPatchTool::new(workspace_root)),
    ]
}

/// The subset of tools the policy admits for a trigger. This is what gets
/// advertised to the model; the runner re-checks on every call.
pub fn enabled_tools(
    tools: &[Arc<dyn Tool>],
    config: &RuntimeConfig,
    trigger: TriggerType,
) -> Vec<Arc<dyn Tool>> {
    let policy = ToolPolicyEngine::new();
    let explicit = explicit_enabled_tools(config, trigger);
    tools
        .iter()
        .filter(|tool| {
            policy
                .is_allowed(tool.name(), tool.permission_level(), trigger, &explicit)
                .allowed
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_retrieval::NoopEmbedder;

    fn tools_for(trigger: TriggerType, config: &RuntimeConfig) -> Vec<String> {
        let dir = tempfile::TempDir::new().unwrap();
        let retrieval = Arc::new(RetrievalIndex::new(dir.path(), Arc::new(NoopEmbedder)));
        let all = build_all_tools(dir.path(), config, retrieval);
        enabled_tools(&all, config, trigger)
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    #[test]
    fn chat_gets_the_full_set() {
        let names = tools_for(TriggerType::Chat, &RuntimeConfig::default());
        assert!(names.contains(&"terminal".to_string()));
        assert!(names.contains(&"fetch_url".to_string()));
        assert!(names.contains(&"apply_patch".to_string()));
    }

    #[test]
    fn heartbeat_defaults_to_read_only() {
        let names = tools_for(TriggerType::Heartbeat, &RuntimeConfig::default());
        assert!(names.contains(&"read_file".to_string()));
        assert!(names.contains(&"search_knowledge_base".to_string()));
        assert!(!names.contains(&"terminal".to_string()));
        assert!(!names.contains(&"fetch_url".to_string()));
    }

    #[test]
    fn explicit_enable_grants_cron_a_system_tool() {
        let mut config = RuntimeConfig::default();
        config.autonomous_tools.cron_enabled_tools = vec!["terminal".into()];
        let names = tools_for(TriggerType::Cron, &config);
        assert!(names.contains(&"terminal".to_string()));
        assert!(!names.contains(&"python_repl".to_string()));
    }

    #[test]
    fn chat_restriction_list_limits_the_set() {
        let mut config = RuntimeConfig::default();
        config.autonomous_tools.chat_enabled_tools = vec!["read_file".into()];
        let names = tools_for(TriggerType::Chat, &config);
        assert_eq!(names, vec!["read_file".to_string()]);
    }
}
