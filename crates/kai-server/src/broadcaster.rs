use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use kai_core::ids::SessionId;
use kai_core::topics;
use kai_hub::{HubError, MessageHub};
use kai_store::sessions::{SessionRepo, SessionStatus};
use kai_store::Database;

use crate::manager::{SessionManager, SESSION_ARCHIVED_EVENT, SESSION_CREATED_EVENT};

/// Derives the snapshot and delta views for every state channel: the
/// `global` channel's system/session state and each session's unified
/// state. Snapshot handlers report the same per-channel version the deltas
/// carry, which is what lets a reconnecting client drop stale deltas.
pub struct StateBroadcaster {
    db: Database,
    hub: Arc<MessageHub>,
    manager: Arc<SessionManager>,
    default_model: String,
    show_archived: AtomicBool,
    has_archived: AtomicBool,
}

impl StateBroadcaster {
    pub fn new(
        db: Database,
        hub: Arc<MessageHub>,
        manager: Arc<SessionManager>,
        default_model: &str,
    ) -> Arc<Self> {
        let has_archived = SessionRepo::new(db.clone())
            .count_archived()
            .map(|n| n > 0)
            .unwrap_or(false);

        Arc::new(Self {
            db,
            hub,
            manager,
            default_model: default_model.to_string(),
            show_archived: AtomicBool::new(false),
            has_archived: AtomicBool::new(has_archived),
        })
    }

    pub fn set_show_archived(&self, show: bool) {
        self.show_archived.store(show, Ordering::SeqCst);
    }

    pub fn show_archived(&self) -> bool {
        self.show_archived.load(Ordering::SeqCst)
    }

    // ── Snapshot request handlers ──

    /// Register the snapshot request methods on the hub.
    pub fn register(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.hub.on_request("global.system", move |_data, _ctx| {
            let this = Arc::clone(&this);
            async move { Ok(this.system_snapshot()) }
        });

        let this = Arc::clone(&self);
        self.hub.on_request("global.sessions", move |_data, _ctx| {
            let this = Arc::clone(&this);
            async move { this.sessions_snapshot() }
        });

        let this = Arc::clone(&self);
        self.hub.on_request("global.snapshot", move |_data, _ctx| {
            let this = Arc::clone(&this);
            async move {
                let sessions = this.sessions_snapshot()?;
                Ok(json!({
                    "system": this.system_snapshot(),
                    "sessions": sessions["sessions"],
                    "hasArchivedSessions": this.has_archived.load(Ordering::SeqCst),
                    "version": this.hub.channel_version(topics::GLOBAL_CHANNEL),
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }
        });

        let this = Arc::clone(&self);
        self.hub.on_request(topics::STATE_SESSION, move |data, _ctx| {
            let this = Arc::clone(&this);
            async move { this.unified_session_state(&data) }
        });

        let this = Arc::clone(&self);
        self.hub.on_request("session.snapshot", move |data, _ctx| {
            let this = Arc::clone(&this);
            async move {
                let session_id = session_id_param(&data)?;
                let row = this.manager.get_row(&session_id)?;
                Ok(json!({
                    "session": row,
                    "version": this.hub.channel_version(&topics::session_channel(&session_id)),
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }
        });

        let this = Arc::clone(&self);
        self.hub.on_request("session.sdkMessages", move |data, _ctx| {
            let this = Arc::clone(&this);
            async move {
                let session_id = session_id_param(&data)?;
                // Unknown session ids are an error, same as the other
                // snapshot handlers.
                this.manager.get_row(&session_id)?;
                let messages = kai_store::messages::SdkMessageRepo::new(this.db.clone())
                    .list(&session_id, None)
                    .map_err(|e| HubError::Internal(e.to_string()))?;
                Ok(json!({
                    "messages": messages,
                    "version": this.hub.channel_version(&topics::session_channel(&session_id)),
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }
        });
    }

    fn system_snapshot(&self) -> serde_json::Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "defaultModel": self.default_model,
            "authState": "authenticated",
            "health": "healthy",
        })
    }

    fn sessions_snapshot(&self) -> Result<serde_json::Value, HubError> {
        let mut sessions = self.manager.list()?;
        if !self.show_archived() {
            sessions.retain(|s| s.status != SessionStatus::Archived);
        }
        Ok(json!({
            "sessions": sessions,
            "version": self.hub.channel_version(topics::GLOBAL_CHANNEL),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    fn unified_session_state(&self, data: &serde_json::Value) -> Result<serde_json::Value, HubError> {
        let session_id = session_id_param(data)?;
        let row = self.manager.get_row(&session_id)?;
        let agent = self.manager.get(&session_id)?;

        let error = if row.metadata.recovery_context.retry_count > 0 {
            row.metadata.recovery_context.last_error.clone()
        } else {
            None
        };

        Ok(json!({
            "sessionInfo": row,
            "agentState": agent.get_processing_state(),
            "commandsData": {"commands": []},
            "contextInfo": agent.get_context_info(),
            "error": error,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    // ── Change fan-out ──

    /// Re-derive and publish a session's unified state. A silent no-op for
    /// unknown or deleted sessions.
    pub fn broadcast_session_state_change(&self, session_id: &SessionId) {
        let payload = match self.unified_session_state(&json!({
            "sessionId": session_id.to_string()
        })) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        self.hub
            .publish(topics::STATE_SESSION, payload, Some(session_id));
    }

    /// Subscribe to the internal bus and publish `global.sessions.delta`
    /// events for session lifecycle changes.
    pub fn spawn_event_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(&self);
        let mut rx = self.hub.subscribe_events();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "broadcaster event loop lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let Some(session_id) = event.data.get("sessionId").and_then(|s| s.as_str()) else {
                    continue;
                };
                let session_id = SessionId::from_raw(session_id);

                match event.topic.as_str() {
                    SESSION_CREATED_EVENT => this.on_session_created(&session_id),
                    topics::SESSION_DELETED => this.on_session_deleted(&session_id),
                    SESSION_ARCHIVED_EVENT => this.on_session_archived(&session_id),
                    _ => {}
                }
            }
        })
    }

    fn publish_sessions_delta(&self, delta: serde_json::Value) {
        self.hub.publish_to_channel(
            topics::GLOBAL_CHANNEL,
            topics::GLOBAL_SESSIONS_DELTA,
            delta,
        );
    }

    fn on_session_created(&self, session_id: &SessionId) {
        let Ok(row) = self.manager.get_row(session_id) else {
            return;
        };
        self.publish_sessions_delta(json!({
            "added": [row],
            "updated": [],
            "removed": [],
            "timestamp": Utc::now().to_rfc3339(),
        }));
    }

    fn on_session_deleted(&self, session_id: &SessionId) {
        self.publish_sessions_delta(json!({
            "added": [],
            "updated": [],
            "removed": [session_id.to_string()],
            "timestamp": Utc::now().to_rfc3339(),
        }));
    }

    /// Archived sessions vanish from clients that hide archives and show as
    /// updated rows otherwise. Either way the archive flag latches.
    fn on_session_archived(&self, session_id: &SessionId) {
        self.has_archived.store(true, Ordering::SeqCst);

        if self.show_archived() {
            let Ok(row) = self.manager.get_row(session_id) else {
                return;
            };
            self.publish_sessions_delta(json!({
                "added": [],
                "updated": [row],
                "removed": [],
                "timestamp": Utc::now().to_rfc3339(),
            }));
        } else {
            self.publish_sessions_delta(json!({
                "added": [],
                "updated": [],
                "removed": [session_id.to_string()],
                "timestamp": Utc::now().to_rfc3339(),
            }));
        }
    }
}

fn session_id_param(data: &serde_json::Value) -> Result<SessionId, HubError> {
    data.get("sessionId")
        .and_then(|s| s.as_str())
        .map(SessionId::from_raw)
        .ok_or_else(|| HubError::Validation("Missing required parameter: sessionId".to_string()))
}
