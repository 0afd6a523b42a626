use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use kai_core::ids::{MessageId, PairId, RoomId, SessionId};
use kai_core::topics;
use kai_hub::MessageHub;
use kai_store::rooms::{
    GoalRepo, RoomAgentStateRepo, RoomAgentStateRow, RoomLifecycleState, RoomRepo, TaskRepo,
};
use kai_store::{Database, StoreError};

use crate::manager::SessionManager;
use crate::rooms::bridge::BridgeManager;
use crate::rooms::pairs::PairManager;

#[derive(Clone, Debug)]
pub struct RoomAgentConfig {
    pub max_concurrent_pairs: usize,
    pub max_error_count: u32,
}

impl Default for RoomAgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pairs: 2,
            max_error_count: 3,
        }
    }
}

struct RoomAgentInner {
    room_id: RoomId,
    db: Database,
    hub: Arc<MessageHub>,
    manager: Arc<SessionManager>,
    bridges: Arc<BridgeManager>,
    pairs: PairManager,
    config: RoomAgentConfig,
    /// The room's own conversation session, created on start.
    room_session_id: Mutex<Option<SessionId>>,
}

/// The per-room controller. All transitions run on one task per room, so
/// room state is never raced; every transition is persisted atomically so a
/// restarted instance resumes exactly where the last one stopped.
pub struct RoomAgent {
    inner: Arc<RoomAgentInner>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RoomAgent {
    pub fn new(
        room_id: RoomId,
        db: Database,
        hub: Arc<MessageHub>,
        manager: Arc<SessionManager>,
        bridges: Arc<BridgeManager>,
        config: RoomAgentConfig,
    ) -> Self {
        let pairs = PairManager::new(db.clone());
        Self {
            inner: Arc::new(RoomAgentInner {
                room_id,
                db,
                hub,
                manager,
                bridges,
                pairs,
                config,
                room_session_id: Mutex::new(None),
            }),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Restore persisted state (clearing a latched `error`) and begin
    /// consuming room events. Idempotent: a second start is a no-op.
    pub fn start(&self) -> Result<(), StoreError> {
        if self.cancel.lock().is_some() {
            return Ok(());
        }

        let repo = RoomAgentStateRepo::new(self.inner.db.clone());
        let mut state = repo.get_or_create(&self.inner.room_id)?;
        if state.lifecycle_state == RoomLifecycleState::Error {
            state.lifecycle_state = RoomLifecycleState::Idle;
            state.error_count = 0;
            state.last_error = None;
            repo.save(&state)?;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let mut rx = self.inner.hub.subscribe_events();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(room_id = %inner.room_id, skipped = n, "room agent lagged");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                };

                match event.topic.as_str() {
                    topics::ROOM_MESSAGE => inner.on_room_message(&event.data).await,
                    topics::PAIR_TASK_COMPLETED => inner.on_pair_task_completed(&event.data).await,
                    _ => {}
                }
            }
        });

        *self.cancel.lock() = Some(cancel);
        *self.task.lock() = Some(task);
        tracing::info!(room_id = %self.inner.room_id, "room agent started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn state(&self) -> Result<RoomAgentStateRow, StoreError> {
        RoomAgentStateRepo::new(self.inner.db.clone()).get_or_create(&self.inner.room_id)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }
}

impl Drop for RoomAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RoomAgentInner {
    async fn on_room_message(&self, data: &serde_json::Value) {
        // Messages for other rooms, and our own replies, are ignored.
        if data.get("roomId").and_then(|r| r.as_str()) != Some(self.room_id.as_str()) {
            return;
        }
        if data.get("from").and_then(|f| f.as_str()) == Some("agent") {
            return;
        }
        let Some(content) = data.get("content").and_then(|c| c.as_str()) else {
            return;
        };

        let repo = RoomAgentStateRepo::new(self.db.clone());
        let state = match repo.get_or_create(&self.room_id) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(room_id = %self.room_id, error = %e, "failed to load room state");
                return;
            }
        };

        // Paused rooms drop everything: no state change, no reply.
        if state.lifecycle_state == RoomLifecycleState::Paused && content != "/resume" {
            return;
        }

        if let Some(command) = content.strip_prefix('/') {
            self.on_command(command).await;
            return;
        }

        if state.lifecycle_state == RoomLifecycleState::Error {
            tracing::warn!(room_id = %self.room_id, "dropping message while in error state");
            return;
        }

        self.transition(|s| {
            s.lifecycle_state = RoomLifecycleState::Planning;
        });

        match self.spawn_worker(content).await {
            Ok(Some(pair_id)) => {
                self.transition(|s| {
                    s.lifecycle_state = RoomLifecycleState::Executing;
                    s.active_session_pair_ids.push(pair_id.clone());
                });
            }
            Ok(None) => {
                // At capacity: the work is parked and the agent stays in
                // planning until a pair frees up.
                self.transition(|s| {
                    s.pending_actions
                        .push(json!({"type": "spawn", "content": content}));
                });
            }
            Err(error) => self.record_error(&error),
        }
    }

    async fn on_command(&self, command: &str) {
        match command.trim() {
            "pause" => {
                self.transition(|s| s.lifecycle_state = RoomLifecycleState::Paused);
            }
            "resume" => {
                self.transition(|s| s.lifecycle_state = RoomLifecycleState::Idle);
            }
            "status" => {
                let state = match RoomAgentStateRepo::new(self.db.clone())
                    .get_or_create(&self.room_id)
                {
                    Ok(state) => state,
                    Err(_) => return,
                };
                self.reply(format!(
                    "State: {} | active pairs: {} | errors: {}",
                    state.lifecycle_state,
                    state.active_session_pair_ids.len(),
                    state.error_count,
                ));
            }
            "goals" => {
                let goals = GoalRepo::new(self.db.clone())
                    .list_for_room(&self.room_id)
                    .unwrap_or_default();
                let listing = if goals.is_empty() {
                    "No goals set".to_string()
                } else {
                    goals
                        .iter()
                        .map(|g| format!("- [{}] {}", g.status, g.description))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                self.reply(listing);
            }
            other => {
                tracing::debug!(room_id = %self.room_id, command = other, "unrecognized command ignored");
            }
        }
    }

    /// Create the worker/manager sessions and a pair for a task. Returns
    /// `None` when the room is at pair capacity.
    async fn spawn_worker(&self, content: &str) -> Result<Option<PairId>, String> {
        let active = self
            .pairs
            .active_pairs(&self.room_id)
            .map_err(|e| e.to_string())?;
        if active.len() >= self.config.max_concurrent_pairs {
            tracing::info!(room_id = %self.room_id, "pair capacity reached, declining spawn");
            return Ok(None);
        }

        let room = RoomRepo::new(self.db.clone())
            .get(&self.room_id)
            .map_err(|e| e.to_string())?;
        let workspace = room
            .default_path
            .clone()
            .or_else(|| room.allowed_paths.first().cloned())
            .unwrap_or_else(|| "/tmp".to_string());

        let room_session_id = self.room_session(&workspace)?;
        let manager_session = self
            .manager
            .create(&workspace, Some("Manager"), None)
            .map_err(|e| e.to_string())?;
        let worker_session = self
            .manager
            .create(&workspace, Some("Worker"), None)
            .map_err(|e| e.to_string())?;

        let pair = self
            .pairs
            .create(
                &self.room_id,
                &room_session_id,
                &manager_session.id,
                &worker_session.id,
            )
            .map_err(|e| e.to_string())?;

        let task = TaskRepo::new(self.db.clone())
            .create(&self.room_id, None, content)
            .map_err(|e| e.to_string())?;
        self.pairs
            .assign_task(&pair.id, &task.id)
            .map_err(|e| e.to_string())?;

        if let Err(e) = self.bridges.clone().start_bridge(&pair.id).await {
            tracing::warn!(pair_id = %pair.id, error = %e, "bridge start failed");
        }

        // Hand the task to the worker through the normal send path.
        self.hub.event(
            topics::MESSAGE_SEND_REQUEST,
            json!({
                "sessionId": worker_session.id.to_string(),
                "messageId": MessageId::new().to_string(),
                "content": content,
            }),
        );

        tracing::info!(room_id = %self.room_id, pair_id = %pair.id, "worker pair spawned");
        Ok(Some(pair.id))
    }

    fn room_session(&self, workspace: &str) -> Result<SessionId, String> {
        let mut slot = self.room_session_id.lock();
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }
        let session = self
            .manager
            .create(workspace, Some("Room"), None)
            .map_err(|e| e.to_string())?;
        *slot = Some(session.id.clone());
        Ok(session.id)
    }

    async fn on_pair_task_completed(&self, data: &serde_json::Value) {
        let Some(pair_id) = data.get("pairId").and_then(|p| p.as_str()) else {
            return;
        };
        let pair_id = PairId::from_raw(pair_id);

        let pair = match self.pairs.get(&pair_id) {
            Ok(pair) if pair.room_id == self.room_id => pair,
            _ => return,
        };

        if let Some(task_id) = &pair.current_task_id {
            if let Err(e) = TaskRepo::new(self.db.clone()).update_status(task_id, "completed") {
                tracing::warn!(task_id = %task_id, error = %e, "failed to complete task");
            }
        }
        if let Err(e) = self.pairs.complete(&pair_id) {
            tracing::warn!(pair_id = %pair_id, error = %e, "failed to complete pair");
        }
        self.bridges.stop_bridge(&pair_id);

        self.transition(|s| {
            s.active_session_pair_ids.retain(|p| p != &pair_id);
            s.lifecycle_state = if s.active_session_pair_ids.is_empty() {
                RoomLifecycleState::Idle
            } else {
                RoomLifecycleState::Executing
            };
        });
    }

    /// Persist a transition atomically and announce it.
    fn transition(&self, mutate: impl FnOnce(&mut RoomAgentStateRow)) {
        let repo = RoomAgentStateRepo::new(self.db.clone());
        let mut state = match repo.get_or_create(&self.room_id) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(room_id = %self.room_id, error = %e, "failed to load room state");
                return;
            }
        };

        mutate(&mut state);
        state.last_activity_at = chrono::Utc::now().to_rfc3339();
        if let Err(e) = repo.save(&state) {
            tracing::error!(room_id = %self.room_id, error = %e, "failed to persist room state");
            return;
        }

        self.hub.event(
            topics::ROOM_AGENT_STATE_CHANGED,
            json!({
                "roomId": self.room_id.to_string(),
                "lifecycleState": state.lifecycle_state.to_string(),
                "activeSessionPairIds": state.active_session_pair_ids,
                "errorCount": state.error_count,
            }),
        );
    }

    /// Spawn-path failures are recoverable: count them, and latch into
    /// `error` only after the threshold.
    fn record_error(&self, error: &str) {
        tracing::warn!(room_id = %self.room_id, error, "room agent operation failed");
        let max = self.config.max_error_count;
        self.transition(|s| {
            s.error_count += 1;
            s.last_error = Some(error.to_string());
            s.lifecycle_state = if s.error_count >= max {
                RoomLifecycleState::Error
            } else {
                RoomLifecycleState::Idle
            };
        });
    }

    fn reply(&self, content: String) {
        self.hub.event(
            topics::ROOM_MESSAGE,
            json!({
                "roomId": self.room_id.to_string(),
                "from": "agent",
                "content": content,
            }),
        );
    }
}
