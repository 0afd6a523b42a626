use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::CheckpointId;

/// Permission discipline requested for a session's queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Prompt,
    BypassPermissions,
}

impl PermissionMode {
    /// The mode actually forwarded to the transport.
    /// `default` is an alias for `bypassPermissions`.
    pub fn effective(self) -> PermissionMode {
        match self {
            Self::Default => Self::BypassPermissions,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Prompt => "prompt",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Requested thinking budget. `Auto` leaves the transport default in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Auto,
    Low,
    Medium,
    High,
    Max,
}

impl ThinkingLevel {
    /// Map to a max-thinking-tokens budget. `Auto` maps to none (unset).
    pub fn max_thinking_tokens(self) -> Option<u32> {
        match self {
            Self::Auto => None,
            Self::Low => Some(4_000),
            Self::Medium => Some(10_000),
            Self::High => Some(32_000),
            Self::Max => Some(63_999),
        }
    }

    /// Parse a level string; anything unrecognized falls back to `Auto`.
    pub fn parse_or_auto(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            "max" => Self::Max,
            _ => Self::Auto,
        }
    }
}

/// Network policy inside the sandbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSandboxConfig {
    pub allowed_domains: Vec<String>,
    pub allow_local_binding: bool,
    pub allow_all_unix_sockets: bool,
}

/// Sandbox profile forwarded to the transport. Enabled by default with a
/// conservative network allowlist; `git` is excluded from sandboxing because
/// worktree plumbing runs it against the main repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub enabled: bool,
    pub auto_allow_bash_if_sandboxed: bool,
    pub excluded_commands: Vec<String>,
    pub network: NetworkSandboxConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_allow_bash_if_sandboxed: true,
            excluded_commands: vec!["git".to_string()],
            network: NetworkSandboxConfig {
                allowed_domains: vec![
                    "api.anthropic.com".to_string(),
                    "console.anthropic.com".to_string(),
                    "statsig.anthropic.com".to_string(),
                    "sentry.io".to_string(),
                ],
                allow_local_binding: true,
                allow_all_unix_sockets: true,
            },
        }
    }
}

/// Explicit provider credentials, passed through to the transport env.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// A named agent definition (user-supplied or coordinator specialist).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Built-in tool toggles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KaiToolsConfig {
    #[serde(default)]
    pub memory: bool,
}

/// Tool discipline knobs that are not part of the transport's own tool set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(default)]
    pub kai_tools: KaiToolsConfig,
    /// `Some(false)` restricts setting sources to `["local"]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_setting_sources: Option<bool>,
}

fn default_model() -> String {
    "default".to_string()
}

/// Per-session configuration. Every field is optional on the wire; unset
/// fields fall back to the documented defaults at query-option build time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<ProviderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<BTreeMap<String, AgentDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betas: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    /// Literal system prompt. Overrides the preset when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// `Some(false)` disables the preset entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_preset: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_file_checkpointing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_tools_preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: None,
            temperature: None,
            provider: None,
            provider_config: None,
            permission_mode: None,
            fallback_model: None,
            agents: None,
            sandbox: None,
            output_format: None,
            betas: None,
            env: None,
            max_budget_usd: None,
            system_prompt: None,
            system_prompt_preset: None,
            mcp_servers: None,
            thinking_level: None,
            coordinator_mode: None,
            enable_file_checkpointing: None,
            sdk_tools_preset: None,
            allowed_tools: None,
            disallowed_tools: None,
            tools: None,
        }
    }
}

impl SessionConfig {
    pub fn coordinator_mode(&self) -> bool {
        self.coordinator_mode.unwrap_or(false)
    }

    pub fn file_checkpointing_enabled(&self) -> bool {
        self.enable_file_checkpointing.unwrap_or(true)
    }

    pub fn memory_tool_enabled(&self) -> bool {
        self.tools
            .as_ref()
            .map(|t| t.kai_tools.memory)
            .unwrap_or(false)
    }
}

/// Worktree binding for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub worktree_path: String,
    pub main_repo_path: String,
    pub branch: String,
}

/// Retry accounting used by error recovery and the session bridge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Token and cost accumulators carried in session metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTotals {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Mutable bookkeeping attached to a session row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub totals: SessionTotals,
    #[serde(default)]
    pub removed_outputs: u64,
    #[serde(default)]
    pub recovery_context: RecoveryContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_draft: Option<String>,
    #[serde(default)]
    pub title_generated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_at: Option<CheckpointId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeInfo>,
    /// Transport-side session id, used for `resume`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
}
