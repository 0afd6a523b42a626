use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use kai_core::config::ThinkingLevel;
use kai_core::ids::{CheckpointId, MessageId, SessionId};
use kai_core::messages::{SdkMessage, SdkMessageType};
use kai_core::query::{AgentQuery, QueryTransport};
use kai_core::state::{PendingQuestion, ProcessingPhase, ProcessingState};
use kai_core::timeout::named_timeout;
use kai_core::topics;
use kai_hub::MessageHub;
use kai_providers::{create_context, is_known_model, ProviderRegistry};
use kai_store::checkpoints::CheckpointRepo;
use kai_store::messages::{SdkMessageRepo, UserMessageRepo, UserMessageStatus};
use kai_store::sessions::{SessionRepo, SessionRow, SessionStatus};
use kai_store::Database;

use crate::cache::Teardown;
use crate::context::{ContextInfo, ContextTracker};
use crate::errors::{AgentError, ErrorManager};
use crate::options::{build_query_options, AgentSettings};
use crate::rewind::{RewindEngine, RewindMode, RewindPreview, RewindResult};

const START_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Reply shape for `handleModelSwitch`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSwitchResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelSwitchResult {
    fn ok(model: &str) -> Self {
        Self {
            success: true,
            model: Some(model.to_string()),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            model: None,
            error: Some(error.into()),
        }
    }
}

struct Consumer {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct SessionInner {
    session_id: SessionId,
    db: Database,
    hub: Arc<MessageHub>,
    transport: Arc<dyn QueryTransport>,
    registry: Arc<ProviderRegistry>,
    settings: AgentSettings,
    state: Mutex<ProcessingState>,
    query: Mutex<Option<Arc<dyn AgentQuery>>>,
    consumer: Mutex<Option<Consumer>>,
    tracker: ContextTracker,
    errors: ErrorManager,
}

/// The in-memory runtime for one session. Owns the single in-flight query
/// and is its only writer; operations are serialized per session through
/// `op_lock`, with the stream consumer running as an independent task.
pub struct AgentSession {
    inner: Arc<SessionInner>,
    rewind: RewindEngine,
    op_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("session_id", &self.inner.session_id)
            .finish()
    }
}

impl AgentSession {
    pub fn new(
        session_id: SessionId,
        db: Database,
        hub: Arc<MessageHub>,
        transport: Arc<dyn QueryTransport>,
        registry: Arc<ProviderRegistry>,
        settings: AgentSettings,
    ) -> Self {
        let model = SessionRepo::new(db.clone())
            .get(&session_id)
            .map(|s| s.config.model)
            .unwrap_or_else(|_| "default".to_string());

        let inner = Arc::new(SessionInner {
            session_id: session_id.clone(),
            db: db.clone(),
            hub: hub.clone(),
            transport,
            registry,
            settings,
            state: Mutex::new(ProcessingState::Idle),
            query: Mutex::new(None),
            consumer: Mutex::new(None),
            tracker: ContextTracker::new(&model),
            errors: ErrorManager::new(session_id.clone(), db.clone(), hub.clone()),
        });

        Self {
            inner,
            rewind: RewindEngine::new(session_id, db, hub),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    // ── Reads ──

    pub fn get_processing_state(&self) -> ProcessingState {
        self.inner.state.lock().clone()
    }

    pub fn get_context_info(&self) -> ContextInfo {
        self.inner.tracker.info()
    }

    pub fn get_current_model(&self) -> Result<String, AgentError> {
        Ok(self.session_row()?.config.model)
    }

    pub fn get_session_data(&self) -> Result<SessionRow, AgentError> {
        self.session_row()
    }

    pub fn current_query(&self) -> Option<Arc<dyn AgentQuery>> {
        self.inner.query.lock().clone()
    }

    fn session_row(&self) -> Result<SessionRow, AgentError> {
        Ok(SessionRepo::new(self.inner.db.clone()).get(&self.inner.session_id)?)
    }

    // ── Message send ──

    /// Persist a user message, checkpoint the turn start, and push it into
    /// the query (starting one if needed). Queues behind an active turn.
    pub async fn handle_message_send(
        &self,
        content: &str,
        images: Option<Vec<String>>,
    ) -> Result<MessageId, AgentError> {
        self.handle_message_send_with_id(MessageId::new(), content, images)
            .await
    }

    /// Like `handle_message_send` with a caller-allocated id, so the RPC
    /// layer can reply with the id before delegation completes.
    pub async fn handle_message_send_with_id(
        &self,
        message_id: MessageId,
        content: &str,
        images: Option<Vec<String>>,
    ) -> Result<MessageId, AgentError> {
        let _op = self.op_lock.lock().await;

        let session = self.session_row()?;
        if session.status == SessionStatus::Archived {
            return Err(AgentError::SessionArchived);
        }

        let user_message = UserMessageRepo::new(self.inner.db.clone()).insert_with_id(
            message_id,
            &self.inner.session_id,
            content,
            images,
        )?;

        self.inner.hub.event(
            topics::MESSAGE_PERSISTED,
            json!({
                "sessionId": self.inner.session_id.to_string(),
                "uuid": user_message.id.to_string(),
                "type": "user",
                "content": content,
            }),
        );

        let starts_turn = self.inner.state.lock().is_terminal();
        if starts_turn {
            CheckpointRepo::new(self.inner.db.clone())
                .insert(&self.inner.session_id, &message_preview(content))?;

            self.inner
                .set_state(ProcessingState::Queued {
                    message_id: user_message.id.clone(),
                });

            match self.ensure_query().await {
                Ok(query) => {
                    self.flush_pending(&query).await?;
                }
                Err(e) => {
                    self.inner.errors.report(&e.to_string());
                    return Err(e);
                }
            }
        }
        // Already processing: the message stays pending and is flushed on
        // the next trigger.

        SessionRepo::new(self.inner.db.clone()).touch(&self.inner.session_id)?;
        Ok(user_message.id)
    }

    /// Kick the query: start it if needed and flush every pending user
    /// message. Returns the number flushed.
    pub async fn handle_query_trigger(&self) -> Result<usize, AgentError> {
        let _op = self.op_lock.lock().await;
        let query = self.ensure_query().await?;
        self.flush_pending(&query).await
    }

    async fn flush_pending(&self, query: &Arc<dyn AgentQuery>) -> Result<usize, AgentError> {
        let repo = UserMessageRepo::new(self.inner.db.clone());
        let pending = repo.list_pending(&self.inner.session_id)?;
        let mut flushed = 0;
        let mut last_id = None;

        for message in pending {
            named_timeout(
                "query.send_user_message",
                CALL_TIMEOUT,
                query.send_user_message(&message.content),
            )
            .await??;
            repo.update_status(&message.id, UserMessageStatus::Sent)?;
            last_id = Some(message.id);
            flushed += 1;
        }

        if let Some(message_id) = last_id {
            self.inner.set_state(ProcessingState::Processing {
                message_id,
                phase: ProcessingPhase::Initializing,
                streaming_started_at: None,
            });
        }
        Ok(flushed)
    }

    // ── Query lifecycle ──

    async fn ensure_query(&self) -> Result<Arc<dyn AgentQuery>, AgentError> {
        if let Some(query) = self.inner.query.lock().clone() {
            return Ok(query);
        }
        self.start_query().await
    }

    async fn start_query(&self) -> Result<Arc<dyn AgentQuery>, AgentError> {
        let session = self.session_row()?;
        if session.status == SessionStatus::Archived {
            return Err(AgentError::SessionArchived);
        }

        let base = build_query_options(&session, &self.inner.settings);
        let context = create_context(&self.inner.registry, &session.config)
            .map_err(|e| AgentError::Provider(e.to_string()))?;
        let options = context.build_sdk_options(base, Some(&session.config));

        let query = named_timeout(
            "query.start",
            START_TIMEOUT,
            self.inner.transport.start_query(&self.inner.session_id, options),
        )
        .await??;

        // Swap in the new query and attach a fresh stream consumer; the old
        // consumer (if any) is cancelled first so no half-read stream is
        // ever resumed.
        self.inner.stop_consumer();
        *self.inner.query.lock() = Some(query.clone());
        Arc::clone(&self.inner).spawn_consumer(query.clone());

        let repo = SessionRepo::new(self.inner.db.clone());
        if session.status == SessionStatus::Pending {
            repo.update_status(&self.inner.session_id, SessionStatus::Active)?;
        }
        repo.touch(&self.inner.session_id)?;

        tracing::info!(session_id = %self.inner.session_id, "query started");
        Ok(query)
    }

    /// Tear down the current query. Optionally start a fresh one.
    pub async fn reset_query(&self, restart: bool) -> Result<(), AgentError> {
        let _op = self.op_lock.lock().await;
        self.reset_query_locked(restart).await
    }

    async fn reset_query_locked(&self, restart: bool) -> Result<(), AgentError> {
        self.inner.stop_consumer();
        *self.inner.query.lock() = None;
        self.inner.set_state(ProcessingState::Idle);

        self.inner.hub.publish(
            topics::AGENT_RESET,
            json!({"sessionId": self.inner.session_id.to_string()}),
            Some(&self.inner.session_id),
        );

        if restart {
            self.start_query().await?;
        }
        Ok(())
    }

    // ── Interrupt ──

    /// Interrupt the current turn. A no-op when already idle or
    /// interrupted; does not wait for the stream to drain.
    pub async fn handle_interrupt(&self) -> Result<(), AgentError> {
        let _op = self.op_lock.lock().await;

        if matches!(
            *self.inner.state.lock(),
            ProcessingState::Idle | ProcessingState::Interrupted
        ) {
            return Ok(());
        }

        if let Some(query) = self.current_query() {
            if let Err(e) =
                named_timeout("query.interrupt", CALL_TIMEOUT, query.interrupt()).await
            {
                tracing::warn!(session_id = %self.inner.session_id, error = %e, "interrupt timed out");
            }
        }

        self.inner.set_state(ProcessingState::Interrupted);
        Ok(())
    }

    // ── Model switch ──

    /// Switch the session model. Validation and idempotence first, then the
    /// config write, the channel notifications, and finally the live query
    /// update (restart when the provider changes, `setModel` otherwise).
    pub async fn handle_model_switch(&self, model: &str) -> ModelSwitchResult {
        let _op = self.op_lock.lock().await;

        if !is_known_model(&self.inner.registry, model) {
            return ModelSwitchResult::failed(format!("Invalid model: {model}"));
        }

        let session = match self.session_row() {
            Ok(s) => s,
            Err(e) => {
                self.inner.errors.report(&e.to_string());
                return ModelSwitchResult::failed(e.to_string());
            }
        };

        if session.config.model == model {
            return ModelSwitchResult {
                success: true,
                model: Some(model.to_string()),
                error: Some(format!("Already using {model}")),
            };
        }

        let previous_context = create_context(&self.inner.registry, &session.config).ok();
        let previous_model = session.config.model.clone();

        let mut config = session.config;
        config.model = model.to_string();
        if let Err(e) = SessionRepo::new(self.inner.db.clone())
            .update_config(&self.inner.session_id, &config)
        {
            let err: AgentError = e.into();
            self.inner.errors.report(&err.to_string());
            return ModelSwitchResult::failed(err.to_string());
        }

        let window = self
            .inner
            .registry
            .detect_provider(model)
            .and_then(|p| p.get_models().into_iter().find(|m| m.id == model))
            .map(|m| m.context_window);
        self.inner.tracker.set_model(model, window);

        self.inner.hub.publish(
            topics::SESSION_UPDATED,
            json!({
                "sessionId": self.inner.session_id.to_string(),
                "model": model,
                "source": "model-switch",
            }),
            Some(&self.inner.session_id),
        );
        self.inner.hub.publish(
            topics::SESSION_MODEL_SWITCHING,
            json!({
                "sessionId": self.inner.session_id.to_string(),
                "from": previous_model,
                "to": model,
            }),
            Some(&self.inner.session_id),
        );

        let query = match self.current_query() {
            Some(query) if query.is_ready() => query,
            // No query running (or handshake incomplete): success, and the
            // new model takes effect on the next start.
            _ => return ModelSwitchResult::ok(model),
        };

        let requires_restart = previous_context
            .as_ref()
            .map(|ctx| ctx.requires_query_restart(&self.inner.registry, model))
            .unwrap_or(true);

        let outcome: Result<(), AgentError> = if requires_restart {
            self.reset_query_locked(true).await
        } else {
            let sdk_model = create_context(&self.inner.registry, &config)
                .map(|ctx| ctx.sdk_model_id())
                .unwrap_or_else(|_| model.to_string());
            match named_timeout("query.set_model", CALL_TIMEOUT, query.set_model(&sdk_model)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            }
        };

        if let Err(e) = outcome {
            self.inner.errors.report(&e.to_string());
            return ModelSwitchResult::failed(e.to_string());
        }

        self.inner.hub.publish(
            topics::SESSION_MODEL_SWITCHED,
            json!({
                "sessionId": self.inner.session_id.to_string(),
                "model": model,
            }),
            Some(&self.inner.session_id),
        );

        ModelSwitchResult::ok(model)
    }

    // ── Thinking & coordinator ──

    /// Persist a thinking level. Returns whether a restart was needed (and
    /// performed) because a query was live.
    pub async fn set_thinking_level(&self, level: ThinkingLevel) -> Result<bool, AgentError> {
        let _op = self.op_lock.lock().await;

        let mut config = self.session_row()?.config;
        config.thinking_level = Some(level);
        SessionRepo::new(self.inner.db.clone()).update_config(&self.inner.session_id, &config)?;

        if self.current_query().is_some() {
            self.reset_query_locked(true).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Toggle coordinator mode. Returns false when nothing changed.
    pub async fn set_coordinator_mode(&self, enabled: bool) -> Result<bool, AgentError> {
        let _op = self.op_lock.lock().await;

        let mut config = self.session_row()?.config;
        if config.coordinator_mode() == enabled {
            return Ok(false);
        }
        config.coordinator_mode = Some(enabled);
        SessionRepo::new(self.inner.db.clone()).update_config(&self.inner.session_id, &config)?;

        if self.current_query().is_some() {
            self.reset_query_locked(true).await?;
        }
        Ok(true)
    }

    // ── Rewind ──

    pub fn get_rewind_points(&self) -> Result<Vec<kai_store::checkpoints::CheckpointRow>, AgentError> {
        Ok(self.rewind.get_rewind_points()?)
    }

    pub async fn preview_rewind(&self, checkpoint_id: &CheckpointId) -> RewindPreview {
        let query = self.current_query();
        self.rewind.preview_rewind(query.as_ref(), checkpoint_id).await
    }

    pub async fn execute_rewind(
        &self,
        checkpoint_id: &CheckpointId,
        mode: RewindMode,
    ) -> RewindResult {
        match mode {
            RewindMode::Files => {
                let query = self.current_query();
                self.rewind
                    .execute_files_rewind(query.as_ref(), checkpoint_id, mode)
                    .await
            }
            RewindMode::Conversation => match self.rewind.execute_conversation_rewind(checkpoint_id)
            {
                Ok(deleted) => {
                    self.restart_after_rewind().await;
                    RewindResult {
                        success: true,
                        conversation_rewound: Some(true),
                        messages_deleted: Some(deleted),
                        ..Default::default()
                    }
                }
                Err(error) => RewindResult {
                    success: false,
                    error: Some(error),
                    ..Default::default()
                },
            },
            RewindMode::Both => {
                let query = self.current_query();
                let files = self
                    .rewind
                    .execute_files_rewind(query.as_ref(), checkpoint_id, mode)
                    .await;
                if !files.success {
                    // File rewind failed: the conversation is left untouched.
                    return files;
                }
                match self.rewind.execute_conversation_rewind(checkpoint_id) {
                    Ok(deleted) => {
                        self.restart_after_rewind().await;
                        RewindResult {
                            success: true,
                            files_changed: files.files_changed,
                            insertions: files.insertions,
                            deletions: files.deletions,
                            conversation_rewound: Some(true),
                            messages_deleted: Some(deleted),
                            ..Default::default()
                        }
                    }
                    Err(error) => RewindResult {
                        success: false,
                        error: Some(error),
                        ..Default::default()
                    },
                }
            }
        }
    }

    pub fn preview_selective_rewind(&self, message_ids: &[MessageId]) -> RewindPreview {
        self.rewind.preview_selective_rewind(message_ids)
    }

    pub async fn execute_selective_rewind(&self, message_ids: &[MessageId]) -> RewindResult {
        let result = self.rewind.execute_selective_rewind(message_ids);
        if result.success {
            self.restart_after_rewind().await;
        }
        result
    }

    async fn restart_after_rewind(&self) {
        let _op = self.op_lock.lock().await;
        if let Err(e) = self.reset_query_locked(true).await {
            tracing::warn!(session_id = %self.inner.session_id, error = %e, "query restart after rewind failed");
            self.inner.errors.report(&e.to_string());
        }
    }
}

impl Teardown for AgentSession {
    fn teardown(&self) {
        self.inner.stop_consumer();
        *self.inner.query.lock() = None;
        tracing::debug!(session_id = %self.inner.session_id, "agent session torn down");
    }
}

fn message_preview(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("");
    let mut preview: String = first_line.chars().take(80).collect();
    if first_line.chars().count() > 80 {
        preview.push('…');
    }
    preview
}

impl SessionInner {
    fn set_state(&self, next: ProcessingState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.state.lock().clone();
        let error = SessionRepo::new(self.db.clone())
            .get(&self.session_id)
            .ok()
            .and_then(|s| {
                if s.metadata.recovery_context.retry_count > 0 {
                    s.metadata.recovery_context.last_error
                } else {
                    None
                }
            });

        self.hub.publish(
            topics::STATE_SESSION,
            json!({
                "sessionId": self.session_id.to_string(),
                "state": state,
                "error": error,
            }),
            Some(&self.session_id),
        );
    }

    fn stop_consumer(&self) {
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.cancel.cancel();
            consumer.task.abort();
        }
    }

    fn spawn_consumer(self: Arc<Self>, query: Arc<dyn AgentQuery>) {
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = query.next_message() => message,
                };
                match message {
                    Some(message) => inner.process_message(message),
                    None => {
                        // Stream ended. Interrupted and waiting states are
                        // resting points and survive the stream closing.
                        let terminal_hold = matches!(
                            *inner.state.lock(),
                            ProcessingState::Interrupted
                                | ProcessingState::WaitingForInput { .. }
                        );
                        if !terminal_hold {
                            inner.set_state(ProcessingState::Idle);
                        }
                        break;
                    }
                }
            }
        });
        *self.consumer.lock() = Some(Consumer { cancel, task });
    }

    /// Handle one record from the stream: persist, broadcast, and advance
    /// the state machine and trackers.
    fn process_message(&self, message: SdkMessage) {
        if message.session_id != self.session_id {
            tracing::warn!(
                session_id = %self.session_id,
                other = %message.session_id,
                "dropping message for foreign session"
            );
            return;
        }

        match SdkMessageRepo::new(self.db.clone()).insert(&message) {
            Ok(_) => {}
            Err(e) if matches!(e, kai_store::StoreError::Conflict(_)) => {
                tracing::debug!(uuid = %message.uuid, "duplicate message skipped");
                return;
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "failed to persist message");
                return;
            }
        }

        self.hub.publish(
            topics::STATE_SDK_MESSAGES_DELTA,
            json!({
                "sessionId": self.session_id.to_string(),
                "added": [message],
            }),
            Some(&self.session_id),
        );
        self.hub.event(
            topics::MESSAGE_PERSISTED,
            json!({
                "sessionId": self.session_id.to_string(),
                "uuid": message.uuid.to_string(),
                "type": message.message_type.to_string(),
            }),
        );

        match message.message_type {
            SdkMessageType::System => self.on_system_message(&message),
            SdkMessageType::StreamEvent => self.on_stream_event(&message),
            SdkMessageType::Assistant => {
                self.tracker.record_message();
                self.bump_message_count();
                self.on_assistant_message(&message);
            }
            SdkMessageType::User => {
                self.tracker.record_message();
                self.bump_message_count();
                // A user record while waiting means the prompt was answered.
                let waiting =
                    matches!(*self.state.lock(), ProcessingState::WaitingForInput { .. });
                if waiting {
                    self.advance_phase(ProcessingPhase::Streaming);
                }
            }
            SdkMessageType::Result => self.on_result_message(&message),
            SdkMessageType::ToolProgress => {}
        }
    }

    fn on_system_message(&self, message: &SdkMessage) {
        let is_init = message.content.get("subtype").and_then(|s| s.as_str()) == Some("init");
        let sdk_session_id = message
            .content
            .get("sessionId")
            .or_else(|| message.content.get("session_id"))
            .and_then(|s| s.as_str());
        if let (true, Some(sdk_id)) = (is_init, sdk_session_id) {
            let repo = SessionRepo::new(self.db.clone());
            if let Ok(session) = repo.get(&self.session_id) {
                let mut metadata = session.metadata;
                metadata.sdk_session_id = Some(sdk_id.to_string());
                if let Err(e) = repo.update_metadata(&self.session_id, &metadata) {
                    tracing::error!(session_id = %self.session_id, error = %e, "failed to record sdk session id");
                }
            }
        }
    }

    fn on_stream_event(&self, message: &SdkMessage) {
        let event = message.content.get("event").unwrap_or(&message.content);
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "content_block_start" => {
                let block_type = event
                    .get("content_block")
                    .and_then(|b| b.get("type"))
                    .and_then(|t| t.as_str());
                if block_type == Some("thinking") {
                    self.advance_phase(ProcessingPhase::Thinking);
                }
            }
            "content_block_delta" => {
                let delta_type = event
                    .get("delta")
                    .and_then(|d| d.get("type"))
                    .and_then(|t| t.as_str());
                if delta_type == Some("text_delta") {
                    self.advance_phase(ProcessingPhase::Streaming);
                }
            }
            _ => {}
        }
    }

    fn on_assistant_message(&self, message: &SdkMessage) {
        // A tool-use block asking the user a question parks the session in
        // waiting_for_input until the answer comes back.
        let Some(blocks) = message.content.get("content").and_then(|c| c.as_array()) else {
            return;
        };
        let question = blocks.iter().find(|b| {
            b.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                && b.get("name").and_then(|n| n.as_str()) == Some("AskUserQuestion")
        });

        if let Some(block) = question {
            let tool_use_id = block
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string();
            let questions = block
                .get("input")
                .and_then(|i| i.get("questions"))
                .and_then(|q| q.as_array())
                .cloned()
                .unwrap_or_default();

            self.set_state(ProcessingState::WaitingForInput {
                pending_question: PendingQuestion {
                    tool_use_id,
                    questions,
                    asked_at: chrono::Utc::now().to_rfc3339(),
                },
            });
        }
    }

    fn on_result_message(&self, message: &SdkMessage) {
        if let Some(usage) = message.content.get("usage") {
            let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = usage
                .get("output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.tracker.record_usage(input, output);
        }

        let is_error = message
            .content
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if is_error {
            let error = message
                .content
                .get("error")
                .and_then(|e| e.as_str())
                .or_else(|| message.content.get("subtype").and_then(|s| s.as_str()))
                .unwrap_or("Unknown error");
            self.errors.report(error);
        } else {
            self.errors.reset();
        }

        self.advance_phase(ProcessingPhase::Finalizing);
        self.set_state(ProcessingState::Idle);
    }

    /// Move an active turn to a new phase. Queued turns pick up a phase;
    /// resting states are left alone (stream noise after interrupt).
    fn advance_phase(&self, phase: ProcessingPhase) {
        let next = {
            let state = self.state.lock();
            match &*state {
                ProcessingState::Queued { message_id } => Some(ProcessingState::Processing {
                    message_id: message_id.clone(),
                    phase,
                    streaming_started_at: if phase == ProcessingPhase::Streaming {
                        Some(chrono::Utc::now().to_rfc3339())
                    } else {
                        None
                    },
                }),
                ProcessingState::Processing {
                    message_id,
                    streaming_started_at,
                    ..
                } => {
                    let started = match (phase, streaming_started_at) {
                        (ProcessingPhase::Streaming, None) => {
                            Some(chrono::Utc::now().to_rfc3339())
                        }
                        (_, existing) => existing.clone(),
                    };
                    Some(ProcessingState::Processing {
                        message_id: message_id.clone(),
                        phase,
                        streaming_started_at: started,
                    })
                }
                ProcessingState::WaitingForInput { .. } if phase == ProcessingPhase::Streaming => {
                    Some(ProcessingState::Processing {
                        message_id: MessageId::new(),
                        phase,
                        streaming_started_at: Some(chrono::Utc::now().to_rfc3339()),
                    })
                }
                _ => None,
            }
        };
        if let Some(next) = next {
            self.set_state(next);
        }
    }

    fn bump_message_count(&self) {
        let repo = SessionRepo::new(self.db.clone());
        if let Ok(session) = repo.get(&self.session_id) {
            let mut metadata = session.metadata;
            metadata.message_count += 1;
            let _ = repo.update_metadata(&self.session_id, &metadata);
        }
    }
}
