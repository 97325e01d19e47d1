//! Tool invocation contracts shared by the sandbox and the orchestrator.
//!
//! Every tool returns a [`ToolResult`] — either `ok` with structured data or
//! a failure carrying one of the closed set of [`ErrorCode`]s. The runner
//! serializes the whole envelope back to the model, so partial failures stay
//! inside the result instead of becoming exceptions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of tool failure codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_POLICY_DENIED")]
    PolicyDenied,
    #[serde(rename = "E_INVALID_ARGS")]
    InvalidArgs,
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_INVALID_PATH")]
    InvalidPath,
    #[serde(rename = "E_IO")]
    Io,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_HTTP")]
    Http,
    #[serde(rename = "E_EXEC")]
    Exec,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolMeta {
    pub tool_name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub data: Map<String, Value>,
    pub meta: ToolMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn success(
        tool_name: &str,
        data: Map<String, Value>,
        duration_ms: u64,
        truncated: bool,
    ) -> Self {
        Self {
            ok: true,
            data,
            meta: ToolMeta {
                tool_name: tool_name.to_string(),
                duration_ms,
                truncated,
                warnings: Vec::new(),
            },
            error: None,
        }
    }

    pub fn failure(tool_name: &str, code: ErrorCode, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            ok: false,
            data: Map::new(),
            meta: ToolMeta {
                tool_name: tool_name.to_string(),
                duration_ms,
                truncated: false,
                warnings: Vec::new(),
            },
            error: Some(ToolError {
                code,
                message: message.into(),
                retryable: false,
                details: Map::new(),
            }),
        }
    }

    pub fn retryable(mut self) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.retryable = true;
        }
        self
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details.insert(key.to_string(), value);
        }
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission tiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool permission tier. Ordered: read < write < network < system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    L0Read,
    L1Write,
    L2Network,
    L3System,
}

impl PermissionLevel {
    pub fn name(&self) -> &'static str {
        match self {
            PermissionLevel::L0Read => "L0_READ",
            PermissionLevel::L1Write => "L1_WRITE",
            PermissionLevel::L2Network => "L2_NETWORK",
            PermissionLevel::L3System => "L3_SYSTEM",
        }
    }
}

/// The authority class a run executes under. Sets the tool ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Chat,
    Heartbeat,
    Cron,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Chat => "chat",
            TriggerType::Heartbeat => "heartbeat",
            TriggerType::Cron => "cron",
        }
    }

    /// Autonomous triggers run without a human watching.
    pub fn is_autonomous(&self) -> bool {
        matches!(self, TriggerType::Heartbeat | TriggerType::Cron)
    }

    /// Maximum permission tier allowed without an explicit enable.
    pub fn max_permission_level(&self) -> PermissionLevel {
        match self {
            TriggerType::Chat => PermissionLevel::L3System,
            TriggerType::Heartbeat | TriggerType::Cron => PermissionLevel::L0Read,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
