use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use kai_agent::{AgentSession, AgentSettings, CacheState, SessionCache};
use kai_core::config::{SandboxConfig, SessionConfig, SessionMetadata, WorktreeInfo};
use kai_core::ids::{MessageId, SessionId};
use kai_core::query::QueryTransport;
use kai_core::topics;
use kai_hub::{HubError, MessageHub};
use kai_providers::ProviderRegistry;
use kai_store::sessions::{SessionRepo, SessionRow, SessionStatus};
use kai_store::Database;
use kai_telemetry::DaemonMetrics;

/// Bus event topics the manager emits for the state broadcaster.
pub const SESSION_CREATED_EVENT: &str = "session.created";
pub const SESSION_ARCHIVED_EVENT: &str = "session.archived";

/// Commit status of a session worktree, used by the archive confirmation
/// flow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStatus {
    pub commits_ahead: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Narrow seam to the Git/worktree plumbing, which lives outside the core.
pub trait WorktreeGateway: Send + Sync {
    fn commit_status(&self, worktree: &WorktreeInfo) -> CommitStatus;
    fn provision(&self, session_id: &SessionId, workspace_path: &str) -> WorktreeInfo;
    fn remove(&self, worktree: &WorktreeInfo);
    fn cleanup(&self, workspace_path: &str) -> Vec<String>;
}

/// Gateway used when no Git integration is wired in: worktrees are plain
/// path conventions with nothing ahead to lose.
pub struct NullWorktreeGateway;

impl WorktreeGateway for NullWorktreeGateway {
    fn commit_status(&self, _worktree: &WorktreeInfo) -> CommitStatus {
        CommitStatus::default()
    }

    fn provision(&self, session_id: &SessionId, workspace_path: &str) -> WorktreeInfo {
        WorktreeInfo {
            worktree_path: format!("{workspace_path}/.worktrees/{session_id}"),
            main_repo_path: workspace_path.to_string(),
            branch: format!("kai/{session_id}"),
        }
    }

    fn remove(&self, worktree: &WorktreeInfo) {
        tracing::debug!(path = %worktree.worktree_path, "worktree removal skipped (no gateway)");
    }

    fn cleanup(&self, _workspace_path: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Reply shape for `session.archive`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_status: Option<CommitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Orchestrator over the store, the cache, the agent sessions, and the hub.
/// Owns the session cache exclusively; every config mutation flows through
/// here so persistence stays consistent.
pub struct SessionManager {
    db: Database,
    hub: Arc<MessageHub>,
    transport: Arc<dyn QueryTransport>,
    registry: Arc<ProviderRegistry>,
    settings: AgentSettings,
    cache: SessionCache<AgentSession>,
    worktrees: Arc<dyn WorktreeGateway>,
    metrics: Arc<DaemonMetrics>,
}

impl SessionManager {
    pub fn new(
        db: Database,
        hub: Arc<MessageHub>,
        transport: Arc<dyn QueryTransport>,
        registry: Arc<ProviderRegistry>,
        settings: AgentSettings,
        cache_capacity: usize,
        worktrees: Arc<dyn WorktreeGateway>,
        metrics: Arc<DaemonMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            hub,
            transport,
            registry,
            settings,
            cache: SessionCache::new(cache_capacity),
            worktrees,
            metrics,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    pub fn worktrees(&self) -> &Arc<dyn WorktreeGateway> {
        &self.worktrees
    }

    pub fn cleanup_state(&self) -> CacheState {
        self.cache.state()
    }

    // ── Lifecycle ──

    /// Create a session: apply the default sandbox profile, persist, and
    /// warm the cache. Rejected once cleanup has started.
    pub fn create(
        &self,
        workspace_path: &str,
        title: Option<&str>,
        config: Option<SessionConfig>,
    ) -> Result<SessionRow, HubError> {
        if self.cache.state() != CacheState::Idle {
            return Err(HubError::Precondition(
                "Session manager is shutting down".to_string(),
            ));
        }

        let mut config = config.unwrap_or_default();
        if config.sandbox.is_none() {
            config.sandbox = Some(SandboxConfig::default());
        }

        let row = SessionRepo::new(self.db.clone())
            .create(workspace_path, title, config)
            .map_err(|e| HubError::Internal(e.to_string()))?;

        self.warm(&row.id);
        self.metrics.record_session_created();
        self.hub.event(
            SESSION_CREATED_EVENT,
            json!({"sessionId": row.id.to_string()}),
        );
        tracing::info!(session_id = %row.id, workspace_path, "session created");
        Ok(row)
    }

    fn construct_agent(&self, session_id: &SessionId) -> Arc<AgentSession> {
        Arc::new(AgentSession::new(
            session_id.clone(),
            self.db.clone(),
            self.hub.clone(),
            self.transport.clone(),
            self.registry.clone(),
            self.settings.clone(),
        ))
    }

    fn warm(&self, session_id: &SessionId) {
        let agent = self.construct_agent(session_id);
        self.cache.set(session_id.clone(), agent);
    }

    /// Cached agent session, or construct one lazily if the session exists
    /// in the store.
    pub fn get(&self, session_id: &SessionId) -> Result<Arc<AgentSession>, HubError> {
        if let Some(agent) = self.cache.get(session_id) {
            return Ok(agent);
        }

        let repo = SessionRepo::new(self.db.clone());
        if !repo
            .exists(session_id)
            .map_err(|e| HubError::Internal(e.to_string()))?
        {
            return Err(HubError::NotFound("Session not found".to_string()));
        }

        let agent = self.construct_agent(session_id);
        // Past the cleanup barrier the instance is handed out uncached.
        self.cache.set(session_id.clone(), agent.clone());
        Ok(agent)
    }

    pub fn get_row(&self, session_id: &SessionId) -> Result<SessionRow, HubError> {
        SessionRepo::new(self.db.clone())
            .get(session_id)
            .map_err(|e| {
                if e.is_not_found() {
                    HubError::NotFound("Session not found".to_string())
                } else {
                    HubError::Internal(e.to_string())
                }
            })
    }

    /// DB order: `last_active_at DESC`.
    pub fn list(&self) -> Result<Vec<SessionRow>, HubError> {
        SessionRepo::new(self.db.clone())
            .list(None, None)
            .map_err(|e| HubError::Internal(e.to_string()))
    }

    /// Write a patch through to the store and publish `session.updated`
    /// with the patch on the session channel.
    pub fn update(
        &self,
        session_id: &SessionId,
        patch: &serde_json::Value,
    ) -> Result<SessionRow, HubError> {
        let repo = SessionRepo::new(self.db.clone());
        let current = self.get_row(session_id)?;

        if let Some(title) = patch.get("title").and_then(|t| t.as_str()) {
            repo.update_title(session_id, title)
                .map_err(|e| HubError::Internal(e.to_string()))?;
        }
        if let Some(config_patch) = patch.get("config") {
            let mut merged = serde_json::to_value(&current.config)
                .map_err(|e| HubError::Internal(e.to_string()))?;
            merge_json(&mut merged, config_patch);
            let config: SessionConfig = serde_json::from_value(merged)
                .map_err(|e| HubError::Validation(format!("invalid config patch: {e}")))?;
            repo.update_config(session_id, &config)
                .map_err(|e| HubError::Internal(e.to_string()))?;
        }
        if let Some(metadata_patch) = patch.get("metadata") {
            let mut merged = serde_json::to_value(&current.metadata)
                .map_err(|e| HubError::Internal(e.to_string()))?;
            merge_json(&mut merged, metadata_patch);
            let metadata: SessionMetadata = serde_json::from_value(merged)
                .map_err(|e| HubError::Validation(format!("invalid metadata patch: {e}")))?;
            repo.update_metadata(session_id, &metadata)
                .map_err(|e| HubError::Internal(e.to_string()))?;
        }

        let mut update = patch.clone();
        if let Some(obj) = update.as_object_mut() {
            obj.insert("sessionId".to_string(), json!(session_id.to_string()));
        }
        self.hub
            .publish(topics::SESSION_UPDATED, update, Some(session_id));

        self.get_row(session_id)
    }

    /// Delete: publish `session.deleted`, tear down the cached agent, then
    /// remove the rows.
    pub fn delete(&self, session_id: &SessionId) -> Result<(), HubError> {
        // Existence check first so deletes of unknown ids fail loudly.
        self.get_row(session_id)?;

        self.hub.publish(
            topics::SESSION_DELETED,
            json!({"sessionId": session_id.to_string()}),
            Some(session_id),
        );
        self.hub.event(
            topics::SESSION_DELETED,
            json!({"sessionId": session_id.to_string()}),
        );

        self.cache.remove(session_id);
        SessionRepo::new(self.db.clone())
            .delete(session_id)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        self.metrics.record_session_deleted();
        tracing::info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    /// Archive flow. A worktree with commits ahead needs explicit
    /// confirmation before anything is removed.
    pub fn archive(&self, session_id: &SessionId, confirmed: bool) -> Result<ArchiveResult, HubError> {
        let row = self.get_row(session_id)?;

        if let Some(worktree) = &row.metadata.worktree {
            let status = self.worktrees.commit_status(worktree);
            if status.commits_ahead > 0 && !confirmed {
                return Ok(ArchiveResult {
                    success: false,
                    requires_confirmation: Some(true),
                    commit_status: Some(status),
                    error: None,
                });
            }
            self.worktrees.remove(worktree);
        }

        let repo = SessionRepo::new(self.db.clone());
        if row.status == SessionStatus::Pending {
            repo.update_status(session_id, SessionStatus::Active)
                .map_err(|e| HubError::Internal(e.to_string()))?;
        }
        repo.update_status(session_id, SessionStatus::Archived)
            .map_err(|e| HubError::Internal(e.to_string()))?;

        let mut metadata = row.metadata.clone();
        metadata.archived_at = Some(chrono::Utc::now().to_rfc3339());
        repo.update_metadata(session_id, &metadata)
            .map_err(|e| HubError::Internal(e.to_string()))?;

        // Archived sessions do not run queries; drop the live instance.
        self.cache.remove(session_id);

        self.hub.publish(
            topics::SESSION_UPDATED,
            json!({"sessionId": session_id.to_string(), "status": "archived"}),
            Some(session_id),
        );
        self.hub.event(
            SESSION_ARCHIVED_EVENT,
            json!({"sessionId": session_id.to_string()}),
        );

        Ok(ArchiveResult {
            success: true,
            ..Default::default()
        })
    }

    // ── Event-bus wiring ──

    /// Subscribe to the internal bus and delegate `message.sendRequest`,
    /// `agent.interruptRequest`, and title generation. Handlers observe the
    /// cleanup barrier and skip work after it trips.
    pub fn spawn_event_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(&self);
        let mut rx = self.hub.subscribe_events();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "manager event loop lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                if manager.cache.state() != CacheState::Idle {
                    continue;
                }

                match event.topic.as_str() {
                    topics::MESSAGE_SEND_REQUEST => {
                        manager.on_send_request(&event.data).await;
                    }
                    topics::AGENT_INTERRUPT_REQUEST => {
                        manager.on_interrupt_request(&event.data).await;
                    }
                    topics::MESSAGE_PERSISTED => {
                        manager.maybe_generate_title(&event.data);
                    }
                    _ => {}
                }
            }
        })
    }

    async fn on_send_request(&self, data: &serde_json::Value) {
        let Some(session_id) = data.get("sessionId").and_then(|s| s.as_str()) else {
            return;
        };
        let session_id = SessionId::from_raw(session_id);
        let message_id = data
            .get("messageId")
            .and_then(|m| m.as_str())
            .map(MessageId::from_raw)
            .unwrap_or_default();
        let content = data
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let images = data.get("images").and_then(|i| i.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });

        match self.get(&session_id) {
            Ok(agent) => {
                if let Err(e) = agent
                    .handle_message_send_with_id(message_id, &content, images)
                    .await
                {
                    tracing::warn!(session_id = %session_id, error = %e, "message send failed");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "send request for unknown session");
            }
        }
    }

    async fn on_interrupt_request(&self, data: &serde_json::Value) {
        let Some(session_id) = data.get("sessionId").and_then(|s| s.as_str()) else {
            return;
        };
        let session_id = SessionId::from_raw(session_id);
        if let Ok(agent) = self.get(&session_id) {
            if let Err(e) = agent.handle_interrupt().await {
                tracing::warn!(session_id = %session_id, error = %e, "interrupt failed");
            }
        }
    }

    /// Derive a title from the first persisted user message. Runs as a
    /// background task that re-checks the barrier before writing.
    fn maybe_generate_title(&self, data: &serde_json::Value) {
        self.metrics.record_message_persisted();

        if data.get("type").and_then(|t| t.as_str()) != Some("user") {
            return;
        }
        let Some(session_id) = data.get("sessionId").and_then(|s| s.as_str()) else {
            return;
        };
        let session_id = SessionId::from_raw(session_id);
        let Some(content) = data.get("content").and_then(|c| c.as_str()) else {
            return;
        };
        let content = content.to_string();

        if self.cache.state() != CacheState::Idle {
            return;
        }
        let db = self.db.clone();
        let hub = self.hub.clone();
        let title = derive_title(&content);
        tokio::spawn(async move {
            let repo = SessionRepo::new(db);
            let Ok(session) = repo.get(&session_id) else {
                return;
            };
            if session.metadata.title_generated || session.title.is_some() {
                return;
            }

            if repo.update_title(&session_id, &title).is_err() {
                return;
            }
            let mut metadata = session.metadata;
            metadata.title_generated = true;
            let _ = repo.update_metadata(&session_id, &metadata);

            hub.publish(
                topics::SESSION_UPDATED,
                json!({"sessionId": session_id.to_string(), "title": title}),
                Some(&session_id),
            );
        });
    }

    /// Cleanup barrier: `Idle → Cleaning → Cleaned`. Coalesces concurrent
    /// calls; afterwards creation is rejected and bus handlers skip work.
    pub fn cleanup(&self) {
        self.cache.cleanup();
    }
}

fn derive_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    let mut title: String = first_line.chars().take(50).collect();
    if first_line.chars().count() > 50 {
        title.push('…');
    }
    if title.is_empty() {
        "New session".to_string()
    } else {
        title
    }
}

/// Shallow-merge `patch` into `base` (objects merge key-by-key, everything
/// else replaces; `null` clears a key).
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    base_map.remove(key);
                } else {
                    merge_json(base_map.entry(key.clone()).or_insert(json!(null)), value);
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}
