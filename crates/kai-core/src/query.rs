use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AgentDefinition, SandboxConfig};
use crate::ids::{CheckpointId, SessionId};
use crate::messages::SdkMessage;

/// Error surfaced by the agent transport.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SDK not ready")]
    NotReady,
    #[error("SDK query not active")]
    NotActive,
    #[error("stream closed: {0}")]
    Closed(String),
    #[error("transport rejected request: {0}")]
    Rejected(String),
    #[error("transport io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Normalized human-readable message: the error text when present,
    /// `"Unknown error"` otherwise.
    pub fn normalized_message(&self) -> String {
        let msg = self.to_string();
        if msg.is_empty() {
            "Unknown error".to_string()
        } else {
            msg
        }
    }
}

/// System prompt selection for a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemPromptConfig {
    /// Verbatim prompt text.
    Literal { text: String },
    /// Named transport preset with optional appended text.
    Preset {
        preset: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        append: Option<String>,
    },
}

/// Fully composed options handed to the transport when starting a query.
/// Every optional field that resolves to "unset" is omitted from the wire
/// object via `skip_serializing_if`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub model: String,
    /// `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub allow_dangerously_skip_permissions: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<SystemPromptConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub setting_sources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub additional_directories: Vec<String>,
    #[serde(default)]
    pub enable_file_checkpointing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<BTreeMap<String, AgentDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betas: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
}

/// Outcome of `rewind_files` (dry-run or live).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindFilesResult {
    pub can_rewind: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insertions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An opaque in-flight query attached to one session. The agent session is
/// the only writer; the message stream is lazy, potentially infinite, and
/// not restartable; restarting means dropping this query and starting a
/// fresh one.
#[async_trait]
pub trait AgentQuery: Send + Sync {
    /// Whether the transport handshake has completed.
    fn is_ready(&self) -> bool;

    /// Switch the model for subsequent turns without restarting.
    async fn set_model(&self, model: &str) -> Result<(), TransportError>;

    /// Interrupt the current turn. Does not wait for the stream to drain.
    async fn interrupt(&self) -> Result<(), TransportError>;

    /// Rewind workspace files to a checkpoint. `dry_run` previews only.
    async fn rewind_files(
        &self,
        checkpoint_id: &CheckpointId,
        dry_run: bool,
    ) -> Result<RewindFilesResult, TransportError>;

    /// Feed a user message into the query.
    async fn send_user_message(&self, content: &str) -> Result<(), TransportError>;

    /// Next record from the message stream. `None` means the stream ended.
    async fn next_message(&self) -> Option<SdkMessage>;
}

/// Factory for queries. The concrete transport lives outside this crate;
/// tests substitute a scripted mock.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn start_query(
        &self,
        session_id: &SessionId,
        options: QueryOptions,
    ) -> Result<Arc<dyn AgentQuery>, TransportError>;
}
