use std::collections::BTreeMap;
use std::path::PathBuf;

use kai_core::config::{AgentDefinition, PermissionMode, WorktreeInfo};
use kai_core::query::{QueryOptions, SystemPromptConfig};
use kai_store::sessions::SessionRow;

/// Daemon-level settings that feed option composition.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    /// Global default permission mode (overridden by session config).
    pub permission_mode: Option<PermissionMode>,
    pub home_dir: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            permission_mode: None,
            home_dir: std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp")),
        }
    }
}

const MEMORY_TOOL: &str = "memory";

fn worktree_prompt_block(worktree: &WorktreeInfo) -> String {
    format!(
        "## Git Worktree Isolation\n\n\
         This session runs inside a dedicated Git worktree.\n\
         - Worktree path: {}\n\
         - Branch: {}\n\
         - Main repository: {}\n\n\
         Keep all changes on this branch inside the worktree. Never run Git \
         commands against the main repository checkout.",
        worktree.worktree_path, worktree.branch, worktree.main_repo_path
    )
}

fn specialist(description: &str, prompt: &str) -> AgentDefinition {
    AgentDefinition {
        description: description.to_string(),
        prompt: prompt.to_string(),
        tools: None,
        model: None,
    }
}

/// The coordinator and its specialist roster. The worktree isolation text is
/// injected into every specialist except the coordinator itself, which only
/// delegates and never touches the tree.
fn coordinator_agents(worktree: Option<&WorktreeInfo>) -> BTreeMap<String, AgentDefinition> {
    let mut agents = BTreeMap::new();
    agents.insert(
        "Coordinator".to_string(),
        specialist(
            "Plans the work and delegates every step to a specialist",
            "You are the coordinator. Break the request into steps and delegate \
             each step to the most suitable specialist agent. Do not edit files \
             or run commands yourself; synthesize specialist results into a \
             final answer.",
        ),
    );

    let roster: [(&str, &str, &str); 7] = [
        (
            "Coder",
            "Writes and edits code",
            "You implement code changes. Keep edits minimal and consistent with \
             the surrounding style.",
        ),
        (
            "Debugger",
            "Diagnoses failures and narrows down root causes",
            "You investigate failures. Reproduce, bisect, and report the root \
             cause with evidence.",
        ),
        (
            "Tester",
            "Writes and runs tests",
            "You write focused tests and run the relevant suites, reporting \
             failures verbatim.",
        ),
        (
            "Reviewer",
            "Reviews diffs for correctness and style",
            "You review changes for correctness, regressions, and style drift. \
             Be specific about required fixes.",
        ),
        (
            "VCS",
            "Handles branches, commits, and history",
            "You handle version control operations: staging, commits, branch \
             management, and history inspection.",
        ),
        (
            "Verifier",
            "Independently verifies claimed results",
            "You independently verify that claimed changes work: build, run, \
             and exercise the affected paths.",
        ),
        (
            "Executor",
            "Runs commands and reports output",
            "You execute commands exactly as specified and report complete \
             output.",
        ),
    ];

    for (name, description, prompt) in roster {
        let mut def = specialist(description, prompt);
        if let Some(wt) = worktree {
            def.prompt = format!("{}\n\n{}", def.prompt, worktree_prompt_block(wt));
        }
        agents.insert(name.to_string(), def);
    }
    agents
}

/// Compose the transport options for a session from its config, metadata,
/// and the daemon settings. Provider concerns (model translation, env) are
/// layered on afterwards by the provider context.
pub fn build_query_options(session: &SessionRow, settings: &AgentSettings) -> QueryOptions {
    let config = &session.config;
    let worktree = session.metadata.worktree.as_ref();

    // Permission mode: session > global settings > bypassPermissions.
    let requested = config
        .permission_mode
        .or(settings.permission_mode)
        .unwrap_or(PermissionMode::BypassPermissions);
    let effective = requested.effective();
    let skip_permissions = effective == PermissionMode::BypassPermissions;

    let cwd = worktree
        .map(|wt| wt.worktree_path.clone())
        .unwrap_or_else(|| session.workspace_path.clone());

    let preset_enabled = config.system_prompt_preset.unwrap_or(true);
    let system_prompt = if let Some(literal) = &config.system_prompt {
        Some(SystemPromptConfig::Literal {
            text: literal.clone(),
        })
    } else if preset_enabled {
        Some(SystemPromptConfig::Preset {
            preset: "claude_code".to_string(),
            append: worktree.map(worktree_prompt_block),
        })
    } else {
        // Preset disabled: fall back to the minimal worktree-only prompt.
        worktree.map(|wt| SystemPromptConfig::Literal {
            text: worktree_prompt_block(wt),
        })
    };

    // Memory tool stays disallowed unless explicitly enabled.
    let mut disallowed_tools = config.disallowed_tools.clone().unwrap_or_default();
    if !config.memory_tool_enabled() && !disallowed_tools.iter().any(|t| t == MEMORY_TOOL) {
        disallowed_tools.push(MEMORY_TOOL.to_string());
    }

    let setting_sources = if config
        .tools
        .as_ref()
        .and_then(|t| t.load_setting_sources)
        == Some(false)
    {
        vec!["local".to_string()]
    } else {
        vec!["project".to_string(), "local".to_string()]
    };

    let mut additional_directories = vec![settings
        .home_dir
        .join(".claude")
        .to_string_lossy()
        .into_owned()];
    if worktree.is_some() {
        additional_directories.push("/tmp/claude".to_string());
        let user = std::env::var("USER").unwrap_or_else(|_| "kai".to_string());
        additional_directories.push(
            std::env::temp_dir()
                .join(format!("claude-{user}"))
                .to_string_lossy()
                .into_owned(),
        );
    }

    let (agent, agents) = if config.coordinator_mode() {
        let mut agents = coordinator_agents(worktree);
        // User-defined agents are preserved and win on name clashes.
        if let Some(user_agents) = &config.agents {
            for (name, def) in user_agents {
                agents.insert(name.clone(), def.clone());
            }
        }
        (Some("Coordinator".to_string()), Some(agents))
    } else {
        (None, config.agents.clone())
    };

    QueryOptions {
        model: config.model.clone(),
        max_turns: None,
        cwd,
        permission_mode: Some(effective.as_str().to_string()),
        allow_dangerously_skip_permissions: skip_permissions,
        system_prompt,
        tools: config.sdk_tools_preset.clone(),
        allowed_tools: config.allowed_tools.clone(),
        disallowed_tools: if disallowed_tools.is_empty() {
            None
        } else {
            Some(disallowed_tools)
        },
        mcp_servers: config.mcp_servers.clone(),
        setting_sources,
        additional_directories,
        enable_file_checkpointing: config.file_checkpointing_enabled(),
        agent,
        agents,
        resume: session.metadata.sdk_session_id.clone(),
        max_thinking_tokens: config
            .thinking_level
            .and_then(|level| level.max_thinking_tokens()),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        fallback_model: config.fallback_model.clone(),
        output_format: config.output_format.clone(),
        betas: config.betas.clone(),
        env: config.env.clone(),
        max_budget_usd: config.max_budget_usd,
        sandbox: Some(config.sandbox.clone().unwrap_or_default()),
    }
}
