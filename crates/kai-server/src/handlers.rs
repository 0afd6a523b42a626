//! The daemon's RPC surface, registered on the hub as request/reply
//! handlers. Read-shaped methods reject with typed errors; command-shaped
//! methods fold failures into `{success:false, error}` payloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use kai_core::config::{SessionConfig, ThinkingLevel};
use kai_core::ids::{CheckpointId, MemoryId, MessageId, RoomId, SessionId, TaskId};
use kai_core::topics;
use kai_hub::{HubError, MessageHub};
use kai_providers::{collect_models, models_cache, ProviderRegistry};
use kai_store::memories::{MemoryImportance, MemoryRepo, MemoryType, RecallFilter};
use kai_store::messages::UserMessageRepo;
use kai_store::rooms::RoomRepo;
use kai_store::Database;
use kai_telemetry::DaemonMetrics;

use crate::broadcaster::StateBroadcaster;
use crate::manager::SessionManager;
use crate::rpc::{optional_bool, optional_str, optional_str_vec, optional_u32, require_str};

/// Everything the handlers reach for.
pub struct HandlerDeps {
    pub db: Database,
    pub hub: Arc<MessageHub>,
    pub manager: Arc<SessionManager>,
    pub broadcaster: Arc<StateBroadcaster>,
    pub registry: Arc<ProviderRegistry>,
    pub metrics: Arc<DaemonMetrics>,
    /// Where the transport keeps its session files.
    pub sdk_dir: PathBuf,
}

macro_rules! handler {
    ($hub:expr, $deps:expr, $method:expr, |$d:ident, $params:ident| $body:expr) => {{
        let $d = Arc::clone(&$deps);
        $hub.on_request($method, move |$params, _ctx| {
            let $d = Arc::clone(&$d);
            async move { $body }
        });
    }};
}

/// Register the full RPC surface.
pub fn register_handlers(deps: Arc<HandlerDeps>) {
    let hub = deps.hub.clone();

    // ── Sessions ──

    handler!(hub, deps, "session.create", |d, params| {
        let workspace_path = require_str(&params, "workspacePath")?;
        let title = optional_str(&params, "title");
        let config = match params.get("config") {
            Some(raw) => Some(
                serde_json::from_value::<SessionConfig>(raw.clone())
                    .map_err(|e| HubError::Validation(format!("invalid config: {e}")))?,
            ),
            None => None,
        };
        let session = d.manager.create(workspace_path, title, config)?;
        Ok(json!({"sessionId": session.id.to_string(), "session": session}))
    });

    handler!(hub, deps, "session.list", |d, _params| {
        Ok(json!({"sessions": d.manager.list()?}))
    });

    handler!(hub, deps, "session.get", |d, params| {
        let session_id = session_id_param(&params)?;
        let session = d.manager.get_row(&session_id)?;
        let context_info = d.manager.get(&session_id).ok().map(|a| a.get_context_info());
        Ok(json!({"session": session, "contextInfo": context_info}))
    });

    handler!(hub, deps, "session.validate", |d, params| {
        let session_id = session_id_param(&params)?;
        match d.manager.get_row(&session_id) {
            Ok(_) => Ok(json!({"valid": true})),
            Err(e) => Ok(json!({"valid": false, "error": e.to_string()})),
        }
    });

    handler!(hub, deps, "session.update", |d, params| {
        let session_id = session_id_param(&params)?;
        let mut patch = params.clone();
        if let Some(obj) = patch.as_object_mut() {
            obj.remove("sessionId");
        }
        let session = d.manager.update(&session_id, &patch)?;
        Ok(json!({"success": true, "session": session}))
    });

    handler!(hub, deps, "session.delete", |d, params| {
        let session_id = session_id_param(&params)?;
        d.manager.delete(&session_id)?;
        Ok(json!({"success": true}))
    });

    handler!(hub, deps, "session.archive", |d, params| {
        let session_id = session_id_param(&params)?;
        let confirmed = optional_bool(&params, "confirmed").unwrap_or(false);
        let result = d.manager.archive(&session_id, confirmed)?;
        Ok(serde_json::to_value(result).unwrap_or_default())
    });

    handler!(hub, deps, "session.setWorktreeMode", |d, params| {
        let (session_id, mode) = match (
            optional_str(&params, "sessionId"),
            optional_str(&params, "mode"),
        ) {
            (Some(s), Some(m)) => (SessionId::from_raw(s), m.to_string()),
            _ => {
                return Err(HubError::Validation(
                    "Missing required fields: sessionId and mode".to_string(),
                ))
            }
        };
        if mode != "worktree" && mode != "direct" {
            return Err(HubError::Validation(format!(
                "Invalid mode: {mode}. Must be 'worktree' or 'direct'"
            )));
        }

        let row = d.manager.get_row(&session_id)?;
        let worktree_patch = if mode == "worktree" {
            let worktree = d
                .manager
                .worktrees()
                .provision(&session_id, &row.workspace_path);
            json!({"worktree": worktree})
        } else {
            json!({"worktree": null})
        };
        d.manager
            .update(&session_id, &json!({"metadata": worktree_patch}))?;
        Ok(json!({"success": true, "mode": mode}))
    });

    // ── Messaging ──

    handler!(hub, deps, "message.send", |d, params| {
        let session_id = session_id_param(&params)?;
        let content = require_str(&params, "content")?;
        d.manager.get_row(&session_id)?;

        let message_id = MessageId::new();
        let mut event = json!({
            "sessionId": session_id.to_string(),
            "messageId": message_id.to_string(),
            "content": content,
        });
        if let Some(images) = params.get("images") {
            event["images"] = images.clone();
        }
        d.hub.event(topics::MESSAGE_SEND_REQUEST, event);
        Ok(json!({"messageId": message_id.to_string()}))
    });

    handler!(hub, deps, "client.interrupt", |d, params| {
        let session_id = session_id_param(&params)?;
        d.hub.event(
            topics::AGENT_INTERRUPT_REQUEST,
            json!({"sessionId": session_id.to_string()}),
        );
        Ok(json!({"accepted": true}))
    });

    // ── Models ──

    handler!(hub, deps, "session.model.get", |d, params| {
        let session_id = session_id_param(&params)?;
        let row = d.manager.get_row(&session_id)?;
        let model = row.config.model.clone();
        let model_info = d.registry.detect_provider(&model).and_then(|p| {
            p.get_models()
                .into_iter()
                .find(|m| m.id == model || m.aliases.iter().any(|a| a == &model))
        });
        Ok(json!({"currentModel": model, "modelInfo": model_info}))
    });

    handler!(hub, deps, "session.model.switch", |d, params| {
        let session_id = session_id_param(&params)?;
        let model = require_str(&params, "model")?;
        let agent = d.manager.get(&session_id)?;
        let result = agent.handle_model_switch(model).await;
        Ok(serde_json::to_value(result).unwrap_or_default())
    });

    handler!(hub, deps, "session.thinking.set", |d, params| {
        let session_id = session_id_param(&params)?;
        // Invalid levels fall back to auto rather than failing.
        let level = ThinkingLevel::parse_or_auto(optional_str(&params, "level").unwrap_or(""));
        let agent = d.manager.get(&session_id)?;
        match agent.set_thinking_level(level).await {
            Ok(restarted) => Ok(json!({"success": true, "level": level, "restarted": restarted})),
            Err(e) => Ok(json!({"success": false, "error": e.to_string()})),
        }
    });

    handler!(hub, deps, "session.coordinator.switch", |d, params| {
        let session_id = session_id_param(&params)?;
        let enabled = optional_bool(&params, "coordinatorMode").unwrap_or(false);
        let agent = d.manager.get(&session_id)?;
        match agent.set_coordinator_mode(enabled).await {
            Ok(changed) => {
                if changed {
                    d.hub.publish(
                        topics::SESSION_UPDATED,
                        json!({
                            "sessionId": session_id.to_string(),
                            "coordinatorMode": enabled,
                        }),
                        Some(&session_id),
                    );
                }
                Ok(json!({"success": true, "changed": changed}))
            }
            Err(e) => Ok(json!({"success": false, "error": e.to_string()})),
        }
    });

    handler!(hub, deps, "session.resetQuery", |d, params| {
        let session_id = session_id_param(&params)?;
        let agent = d.manager.get(&session_id)?;
        match agent.reset_query(false).await {
            Ok(()) => Ok(json!({"success": true})),
            Err(e) => Ok(json!({"success": false, "error": e.to_string()})),
        }
    });

    handler!(hub, deps, "session.query.trigger", |d, params| {
        let session_id = session_id_param(&params)?;
        let agent = d.manager.get(&session_id)?;
        match agent.handle_query_trigger().await {
            Ok(count) => Ok(json!({"success": true, "messageCount": count})),
            Err(e) => Ok(json!({"success": false, "error": e.to_string()})),
        }
    });

    handler!(hub, deps, "session.messages.countByStatus", |d, params| {
        let session_id = session_id_param(&params)?;
        let status = require_str(&params, "status")?
            .parse()
            .map_err(HubError::Validation)?;
        let count = UserMessageRepo::new(d.db.clone())
            .count_by_status(&session_id, status)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"count": count}))
    });

    handler!(hub, deps, "models.list", |d, _params| {
        Ok(json!({"models": collect_models(&d.registry, models_cache())}))
    });

    handler!(hub, deps, "models.clearCache", |_d, _params| {
        models_cache().clear();
        Ok(json!({"success": true}))
    });

    handler!(hub, deps, "agent.getState", |d, params| {
        let session_id = session_id_param(&params)?;
        let agent = d.manager.get(&session_id)?;
        Ok(json!({"state": agent.get_processing_state()}))
    });

    // ── Maintenance ──

    handler!(hub, deps, "worktree.cleanup", |d, params| {
        let workspace_path = require_str(&params, "workspacePath")?;
        let cleaned = d.manager.worktrees().cleanup(workspace_path);
        Ok(json!({
            "cleanedPaths": cleaned,
            "message": format!("Cleaned {} worktree(s)", cleaned.len()),
        }))
    });

    handler!(hub, deps, "sdk.scan", |d, _params| {
        Ok(json!({"files": scan_sdk_files(&d.sdk_dir)}))
    });

    handler!(hub, deps, "sdk.cleanup", |d, _params| {
        let files = scan_sdk_files(&d.sdk_dir);
        let mut removed = 0;
        for file in &files {
            let path = file["path"].as_str().unwrap_or_default();
            if std::fs::remove_file(path).is_ok() {
                removed += 1;
            }
        }
        Ok(json!({"removed": removed}))
    });

    // ── Files ──

    handler!(hub, deps, "file.read", |d, params| {
        let session_id = session_id_param(&params)?;
        let row = d.manager.get_row(&session_id)?;
        let path = resolve_path(&row.workspace_path, require_str(&params, "path")?)?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| HubError::Internal(format!("read {}: {e}", path.display())))?;
        Ok(json!({"path": path.to_string_lossy(), "content": content}))
    });

    handler!(hub, deps, "file.list", |d, params| {
        let session_id = session_id_param(&params)?;
        let row = d.manager.get_row(&session_id)?;
        let path = resolve_path(&row.workspace_path, optional_str(&params, "path").unwrap_or("."))?;
        let mut entries = Vec::new();
        let dir = std::fs::read_dir(&path)
            .map_err(|e| HubError::Internal(format!("list {}: {e}", path.display())))?;
        for entry in dir.flatten() {
            let kind = if entry.path().is_dir() { "directory" } else { "file" };
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "type": kind,
            }));
        }
        Ok(json!({"entries": entries}))
    });

    handler!(hub, deps, "file.tree", |d, params| {
        let session_id = session_id_param(&params)?;
        let row = d.manager.get_row(&session_id)?;
        let path = resolve_path(&row.workspace_path, optional_str(&params, "path").unwrap_or("."))?;
        let depth = optional_u32(&params, "depth").unwrap_or(3) as usize;
        Ok(json!({"tree": build_tree(&path, depth)}))
    });

    // ── Memory ──

    handler!(hub, deps, "memory.add", |d, params| {
        let room_id = room_id_param(&params)?;
        let content = params
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HubError::Validation("Memory content is required".to_string()))?;
        room_exists(&d.db, &room_id)?;

        // Type defaults to `note` when unspecified.
        let memory_type: MemoryType = match optional_str(&params, "type") {
            Some(raw) => raw.parse().map_err(HubError::Validation)?,
            None => MemoryType::Note,
        };
        let importance: MemoryImportance = match optional_str(&params, "importance") {
            Some(raw) => raw.parse().map_err(HubError::Validation)?,
            None => MemoryImportance::Normal,
        };
        let tags = optional_str_vec(&params, "tags").unwrap_or_default();
        let session_id = optional_str(&params, "sessionId").map(SessionId::from_raw);
        let task_id = optional_str(&params, "taskId").map(TaskId::from_raw);

        let memory = MemoryRepo::new(d.db.clone())
            .add(
                &room_id,
                memory_type,
                content,
                &tags,
                importance,
                session_id.as_ref(),
                task_id.as_ref(),
            )
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"memory": memory}))
    });

    handler!(hub, deps, "memory.list", |d, params| {
        let room_id = room_id_param(&params)?;
        let memory_type = match optional_str(&params, "type") {
            Some(raw) => Some(raw.parse::<MemoryType>().map_err(HubError::Validation)?),
            None => None,
        };
        let memories = MemoryRepo::new(d.db.clone())
            .list(&room_id, memory_type)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"memories": memories}))
    });

    handler!(hub, deps, "memory.search", |d, params| {
        let room_id = room_id_param(&params)?;
        let query = require_str(&params, "query")?;
        let limit = optional_u32(&params, "limit");
        let memories = MemoryRepo::new(d.db.clone())
            .search(&room_id, query, limit)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"memories": memories}))
    });

    handler!(hub, deps, "memory.recall", |d, params| {
        let room_id = room_id_param(&params)?;
        let filter = RecallFilter {
            memory_type: match optional_str(&params, "type") {
                Some(raw) => Some(raw.parse::<MemoryType>().map_err(HubError::Validation)?),
                None => None,
            },
            tags: optional_str_vec(&params, "tags"),
            limit: optional_u32(&params, "limit"),
        };
        let memories = MemoryRepo::new(d.db.clone())
            .recall(&room_id, &filter)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"memories": memories}))
    });

    handler!(hub, deps, "memory.delete", |d, params| {
        let room_id = room_id_param(&params)?;
        let memory_id = MemoryId::from_raw(require_str(&params, "memoryId")?);
        let deleted = MemoryRepo::new(d.db.clone())
            .delete(&room_id, &memory_id)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"success": deleted}))
    });

    // ── Rewind ──

    handler!(hub, deps, "rewind.checkpoints", |d, params| {
        let session_id = session_id_param(&params)?;
        let agent = d.manager.get(&session_id)?;
        let checkpoints = agent
            .get_rewind_points()
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok(json!({"checkpoints": checkpoints}))
    });

    handler!(hub, deps, "rewind.preview", |d, params| {
        let session_id = session_id_param(&params)?;
        let checkpoint_id = CheckpointId::from_raw(require_str(&params, "checkpointId")?);
        let agent = d.manager.get(&session_id)?;
        let preview = agent.preview_rewind(&checkpoint_id).await;
        Ok(serde_json::to_value(preview).unwrap_or_default())
    });

    handler!(hub, deps, "rewind.execute", |d, params| {
        let session_id = session_id_param(&params)?;
        let checkpoint_id = CheckpointId::from_raw(require_str(&params, "checkpointId")?);
        let mode = require_str(&params, "mode")?
            .parse()
            .map_err(HubError::Validation)?;
        let agent = d.manager.get(&session_id)?;
        let result = agent.execute_rewind(&checkpoint_id, mode).await;
        Ok(json!({"result": result}))
    });

    handler!(hub, deps, "rewind.previewSelective", |d, params| {
        let session_id = session_id_param(&params)?;
        let message_ids = message_ids_param(&params);
        let agent = d.manager.get(&session_id)?;
        let preview = agent.preview_selective_rewind(&message_ids);
        Ok(serde_json::to_value(preview).unwrap_or_default())
    });

    handler!(hub, deps, "rewind.executeSelective", |d, params| {
        let session_id = session_id_param(&params)?;
        let message_ids = message_ids_param(&params);
        let agent = d.manager.get(&session_id)?;
        let result = agent.execute_selective_rewind(&message_ids).await;
        Ok(json!({"result": result}))
    });

    // ── System ──

    handler!(hub, deps, "health", |d, _params| {
        Ok(json!({
            "status": "healthy",
            "metrics": d.metrics.snapshot(),
            "dbPath": d.db.path().to_string_lossy(),
        }))
    });
}

fn session_id_param(params: &serde_json::Value) -> Result<SessionId, HubError> {
    Ok(SessionId::from_raw(require_str(params, "sessionId")?))
}

fn room_id_param(params: &serde_json::Value) -> Result<RoomId, HubError> {
    params
        .get("roomId")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .map(RoomId::from_raw)
        .ok_or_else(|| HubError::Validation("Room ID is required".to_string()))
}

fn room_exists(db: &Database, room_id: &RoomId) -> Result<(), HubError> {
    RoomRepo::new(db.clone())
        .get(room_id)
        .map(|_| ())
        .map_err(|_| HubError::NotFound("Room not found".to_string()))
}

fn message_ids_param(params: &serde_json::Value) -> Vec<MessageId> {
    params
        .get("messageIds")
        .and_then(|m| m.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(MessageId::from_raw))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve a session-relative path, rejecting escapes from the workspace.
fn resolve_path(workspace: &str, relative: &str) -> Result<PathBuf, HubError> {
    let candidate = Path::new(relative);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(HubError::Validation(format!("Invalid path: {relative}")));
    }
    Ok(Path::new(workspace).join(candidate))
}

fn scan_sdk_files(dir: &Path) -> Vec<serde_json::Value> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_file())
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            json!({"path": e.path().to_string_lossy(), "size": size})
        })
        .collect()
}

fn build_tree(path: &Path, depth: usize) -> serde_json::Value {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    if path.is_dir() {
        let children = if depth == 0 {
            Vec::new()
        } else {
            std::fs::read_dir(path)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|e| build_tree(&e.path(), depth - 1))
                        .collect()
                })
                .unwrap_or_default()
        };
        json!({"name": name, "type": "directory", "children": children})
    } else {
        json!({"name": name, "type": "file"})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::NullWorktreeGateway;
    use kai_agent::mock::MockTransport;
    use kai_agent::AgentSettings;
    use kai_core::ids::ClientId;
    use kai_providers::mock::MockProvider;
    use kai_providers::ProviderRegistry;

    struct Fixture {
        hub: Arc<MessageHub>,
        db: Database,
        manager: Arc<SessionManager>,
        _loop: tokio::task::JoinHandle<()>,
    }

    async fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let hub = Arc::new(MessageHub::new());
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(
            MockProvider::new("mock", &["default", "opus", "sonnet"]),
        ));

        let metrics = Arc::new(DaemonMetrics::new());
        let manager = SessionManager::new(
            db.clone(),
            hub.clone(),
            Arc::new(MockTransport::new()),
            registry.clone(),
            AgentSettings::default(),
            16,
            Arc::new(NullWorktreeGateway),
            metrics.clone(),
        );
        let event_loop = manager.clone().spawn_event_loop();
        let broadcaster =
            StateBroadcaster::new(db.clone(), hub.clone(), manager.clone(), "default");
        broadcaster.clone().register();

        register_handlers(Arc::new(HandlerDeps {
            db: db.clone(),
            hub: hub.clone(),
            manager: manager.clone(),
            broadcaster,
            registry,
            metrics,
            sdk_dir: std::env::temp_dir().join("kai-sdk-test-none"),
        }));

        Fixture {
            hub,
            db,
            manager,
            _loop: event_loop,
        }
    }

    async fn call(fx: &Fixture, method: &str, params: serde_json::Value) -> Result<serde_json::Value, HubError> {
        fx.hub.request(method, params, None).await
    }

    fn room(fx: &Fixture) -> RoomId {
        RoomRepo::new(fx.db.clone()).create("r", &[], None).unwrap().id
    }

    #[tokio::test]
    async fn create_switch_send_flow() {
        let fx = setup().await;

        // session.create
        let created = call(&fx, "session.create", json!({"workspacePath": "/w"}))
            .await
            .unwrap();
        let session_id = created["sessionId"].as_str().unwrap().to_string();
        assert_eq!(created["session"]["config"]["model"], "default");

        // Subscribe to the session channel before switching
        let sid = SessionId::from_raw(&session_id);
        let mut sub = fx
            .hub
            .join_channel(&topics::session_channel(&sid), &ClientId::new());

        // session.model.switch with no query running
        let switched = call(
            &fx,
            "session.model.switch",
            json!({"sessionId": session_id, "model": "opus"}),
        )
        .await
        .unwrap();
        assert_eq!(switched["success"], true);
        assert_eq!(switched["model"], "opus");

        let mut saw_updated = false;
        while let Some(event) = sub.try_recv() {
            if event.topic == topics::SESSION_UPDATED && event.data["model"] == "opus" {
                saw_updated = true;
            }
        }
        assert!(saw_updated, "expected session.updated {{model: opus}}");

        // message.send
        let sent = call(
            &fx,
            "message.send",
            json!({"sessionId": session_id, "content": "hi"}),
        )
        .await
        .unwrap();
        assert!(sent["messageId"].as_str().unwrap().starts_with("msg_"));
    }

    #[tokio::test]
    async fn session_get_unknown_fails_with_literal() {
        let fx = setup().await;
        let err = call(&fx, "session.get", json!({"sessionId": "sess_missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Session not found");
    }

    #[tokio::test]
    async fn session_validate_shapes() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();

        let valid = call(&fx, "session.validate", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap();
        assert_eq!(valid["valid"], true);

        let invalid = call(&fx, "session.validate", json!({"sessionId": "sess_nope"}))
            .await
            .unwrap();
        assert_eq!(invalid["valid"], false);
        assert_eq!(invalid["error"], "Session not found");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let fx = setup().await;
        let err = call(&fx, "session.bogus", json!({})).await.unwrap_err();
        assert!(matches!(err, HubError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn set_worktree_mode_validation_literals() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();

        let err = call(&fx, "session.setWorktreeMode", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields: sessionId and mode");

        let err = call(
            &fx,
            "session.setWorktreeMode",
            json!({"sessionId": row.id.to_string(), "mode": "x"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid mode: x. Must be 'worktree' or 'direct'");
    }

    #[tokio::test]
    async fn set_worktree_mode_provisions_and_clears() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();

        let ok = call(
            &fx,
            "session.setWorktreeMode",
            json!({"sessionId": row.id.to_string(), "mode": "worktree"}),
        )
        .await
        .unwrap();
        assert_eq!(ok["success"], true);
        let updated = fx.manager.get_row(&row.id).unwrap();
        assert!(updated.metadata.worktree.is_some());

        call(
            &fx,
            "session.setWorktreeMode",
            json!({"sessionId": row.id.to_string(), "mode": "direct"}),
        )
        .await
        .unwrap();
        let updated = fx.manager.get_row(&row.id).unwrap();
        assert!(updated.metadata.worktree.is_none());
    }

    #[tokio::test]
    async fn message_send_unknown_session_fails() {
        let fx = setup().await;
        let err = call(
            &fx,
            "message.send",
            json!({"sessionId": "sess_nope", "content": "hi"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Session not found");
    }

    #[tokio::test]
    async fn client_interrupt_accepts() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();
        let accepted = call(&fx, "client.interrupt", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap();
        assert_eq!(accepted["accepted"], true);
    }

    #[tokio::test]
    async fn model_get_and_list() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();

        let got = call(&fx, "session.model.get", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap();
        assert_eq!(got["currentModel"], "default");

        let models = call(&fx, "models.list", json!({})).await.unwrap();
        let ids: Vec<&str> = models["models"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        // No duplicate canonical ids
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());

        let cleared = call(&fx, "models.clearCache", json!({})).await.unwrap();
        assert_eq!(cleared["success"], true);
    }

    #[tokio::test]
    async fn thinking_set_invalid_defaults_to_auto() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();
        let result = call(
            &fx,
            "session.thinking.set",
            json!({"sessionId": row.id.to_string(), "level": "galactic"}),
        )
        .await
        .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["level"], "auto");
    }

    #[tokio::test]
    async fn agent_get_state() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();
        let state = call(&fx, "agent.getState", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap();
        assert_eq!(state["state"]["status"], "idle");
    }

    #[tokio::test]
    async fn query_trigger_counts_pending() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();
        UserMessageRepo::new(fx.db.clone())
            .insert(&row.id, "queued up", None)
            .unwrap();

        let result = call(
            &fx,
            "session.query.trigger",
            json!({"sessionId": row.id.to_string()}),
        )
        .await
        .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["messageCount"], 1);

        let count = call(
            &fx,
            "session.messages.countByStatus",
            json!({"sessionId": row.id.to_string(), "status": "sent"}),
        )
        .await
        .unwrap();
        assert_eq!(count["count"], 1);
    }

    #[tokio::test]
    async fn memory_validation_literals() {
        let fx = setup().await;
        let room_id = room(&fx);

        let err = call(&fx, "memory.add", json!({"content": "x"})).await.unwrap_err();
        assert_eq!(err.to_string(), "Room ID is required");

        let err = call(&fx, "memory.add", json!({"roomId": room_id.to_string()}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Memory content is required");
    }

    #[tokio::test]
    async fn memory_add_defaults_type_to_note() {
        let fx = setup().await;
        let room_id = room(&fx);

        let added = call(
            &fx,
            "memory.add",
            json!({"roomId": room_id.to_string(), "content": "remember me"}),
        )
        .await
        .unwrap();
        assert_eq!(added["memory"]["type"], "note");
        assert_eq!(added["memory"]["importance"], "normal");
    }

    #[tokio::test]
    async fn memory_search_and_delete() {
        let fx = setup().await;
        let room_id = room(&fx);
        let other_room = room(&fx);

        let added = call(
            &fx,
            "memory.add",
            json!({"roomId": room_id.to_string(), "content": "File with % in name"}),
        )
        .await
        .unwrap();
        let memory_id = added["memory"]["id"].as_str().unwrap().to_string();
        call(
            &fx,
            "memory.add",
            json!({"roomId": room_id.to_string(), "content": "File with _ in name"}),
        )
        .await
        .unwrap();

        let found = call(
            &fx,
            "memory.search",
            json!({"roomId": room_id.to_string(), "query": "%"}),
        )
        .await
        .unwrap();
        let memories = found["memories"].as_array().unwrap();
        assert_eq!(memories.len(), 1);
        assert!(memories[0]["content"].as_str().unwrap().contains('%'));

        // Foreign-room delete is a no-op returning false
        let denied = call(
            &fx,
            "memory.delete",
            json!({"roomId": other_room.to_string(), "memoryId": memory_id}),
        )
        .await
        .unwrap();
        assert_eq!(denied["success"], false);

        let deleted = call(
            &fx,
            "memory.delete",
            json!({"roomId": room_id.to_string(), "memoryId": added["memory"]["id"]}),
        )
        .await
        .unwrap();
        assert_eq!(deleted["success"], true);
    }

    #[tokio::test]
    async fn rewind_execute_wraps_result() {
        let fx = setup().await;
        let created = call(&fx, "session.create", json!({"workspacePath": "/w"}))
            .await
            .unwrap();
        let session_id = created["sessionId"].as_str().unwrap().to_string();

        // Start a turn so a checkpoint and query exist
        call(
            &fx,
            "message.send",
            json!({"sessionId": session_id, "content": "do work"}),
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let checkpoints = call(&fx, "rewind.checkpoints", json!({"sessionId": session_id}))
            .await
            .unwrap();
        let checkpoint_id = checkpoints["checkpoints"][0]["id"].as_str().unwrap().to_string();

        let result = call(
            &fx,
            "rewind.execute",
            json!({"sessionId": session_id, "checkpointId": checkpoint_id, "mode": "files"}),
        )
        .await
        .unwrap();
        assert_eq!(result["result"]["success"], true);

        // Unknown checkpoint comes back as a failed result, not an error
        let result = call(
            &fx,
            "rewind.execute",
            json!({"sessionId": session_id, "checkpointId": "ckpt_missing", "mode": "files"}),
        )
        .await
        .unwrap();
        assert_eq!(result["result"]["success"], false);
        assert_eq!(result["result"]["error"], "Checkpoint not found");
    }

    #[tokio::test]
    async fn rewind_selective_empty_set() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();

        let preview = call(
            &fx,
            "rewind.previewSelective",
            json!({"sessionId": row.id.to_string(), "messageIds": []}),
        )
        .await
        .unwrap();
        assert_eq!(preview["canRewind"], false);
        assert_eq!(preview["error"], "No messages selected");
    }

    #[tokio::test]
    async fn file_ops_require_valid_session() {
        let fx = setup().await;
        let err = call(&fx, "file.list", json!({"sessionId": "sess_nope"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Session not found");
    }

    #[tokio::test]
    async fn file_read_rejects_escaping_paths() {
        let fx = setup().await;
        let row = fx.manager.create("/w", None, None).unwrap();
        let err = call(
            &fx,
            "file.read",
            json!({"sessionId": row.id.to_string(), "path": "../etc/passwd"}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Invalid path"));
    }

    #[tokio::test]
    async fn file_list_and_tree() {
        let fx = setup().await;
        let dir = std::env::temp_dir().join(format!("kai-files-{}", uuid_suffix()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.txt"), "hello").unwrap();

        let row = fx
            .manager
            .create(dir.to_str().unwrap(), None, None)
            .unwrap();

        let listed = call(&fx, "file.list", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap();
        let names: Vec<&str> = listed["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"sub"));

        let read = call(
            &fx,
            "file.read",
            json!({"sessionId": row.id.to_string(), "path": "a.txt"}),
        )
        .await
        .unwrap();
        assert_eq!(read["content"], "hello");

        let tree = call(&fx, "file.tree", json!({"sessionId": row.id.to_string()}))
            .await
            .unwrap();
        assert_eq!(tree["tree"]["type"], "directory");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn health_reports_metrics() {
        let fx = setup().await;
        fx.manager.create("/w", None, None).unwrap();
        let health = call(&fx, "health", json!({})).await.unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["metrics"]["sessionsCreated"], 1);
    }

    fn uuid_suffix() -> String {
        kai_core::ids::SessionId::new().as_str().to_string()
    }
}
