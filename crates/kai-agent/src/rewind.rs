use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use kai_core::config::SessionMetadata;
use kai_core::ids::{CheckpointId, MessageId, SessionId};
use kai_core::query::AgentQuery;
use kai_core::topics;
use kai_hub::MessageHub;
use kai_store::checkpoints::{CheckpointRepo, CheckpointRow};
use kai_store::messages::SdkMessageRepo;
use kai_store::{Database, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewindMode {
    Files,
    Conversation,
    Both,
}

impl RewindMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Conversation => "conversation",
            Self::Both => "both",
        }
    }
}

impl std::str::FromStr for RewindMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files" => Ok(Self::Files),
            "conversation" => Ok(Self::Conversation),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown rewind mode: {other}")),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindPreview {
    pub can_rewind: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insertions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_selected: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RewindPreview {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            can_rewind: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insertions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_rewound: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_deleted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RewindResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

fn normalize_error(message: String) -> String {
    if message.is_empty() {
        "Unknown error".to_string()
    } else {
        message
    }
}

/// Checkpoint enumeration, previews, and the three rewind modes. Query
/// restarts after a conversation rewind are the agent session's job; the
/// engine only mutates stored state and talks to the query's file rewind.
pub struct RewindEngine {
    session_id: SessionId,
    db: Database,
    hub: Arc<MessageHub>,
}

impl RewindEngine {
    pub fn new(session_id: SessionId, db: Database, hub: Arc<MessageHub>) -> Self {
        Self {
            session_id,
            db,
            hub,
        }
    }

    /// All checkpoints, newest turn first.
    pub fn get_rewind_points(&self) -> Result<Vec<CheckpointRow>, StoreError> {
        CheckpointRepo::new(self.db.clone()).list(&self.session_id)
    }

    fn checkpoint(&self, id: &CheckpointId) -> Result<Option<CheckpointRow>, StoreError> {
        CheckpointRepo::new(self.db.clone()).get(&self.session_id, id)
    }

    /// Dry-run a file rewind against the running query.
    pub async fn preview_rewind(
        &self,
        query: Option<&Arc<dyn AgentQuery>>,
        checkpoint_id: &CheckpointId,
    ) -> RewindPreview {
        let checkpoint = match self.checkpoint(checkpoint_id) {
            Ok(Some(c)) => c,
            Ok(None) => return RewindPreview::failed("Checkpoint not found"),
            Err(e) => return RewindPreview::failed(normalize_error(e.to_string())),
        };

        let Some(query) = query else {
            return RewindPreview::failed("SDK query not active");
        };
        if !query.is_ready() {
            return RewindPreview::failed("SDK not ready");
        }

        match query.rewind_files(&checkpoint.id, true).await {
            Ok(result) => RewindPreview {
                can_rewind: result.can_rewind,
                files_changed: result.files_changed,
                insertions: result.insertions,
                deletions: result.deletions,
                messages_selected: None,
                error: result.error,
            },
            Err(e) => RewindPreview::failed(normalize_error(e.normalized_message())),
        }
    }

    /// Rewind workspace files to a checkpoint, emitting the rewind events.
    pub async fn execute_files_rewind(
        &self,
        query: Option<&Arc<dyn AgentQuery>>,
        checkpoint_id: &CheckpointId,
        mode: RewindMode,
    ) -> RewindResult {
        self.hub.publish(
            topics::REWIND_STARTED,
            json!({
                "sessionId": self.session_id.to_string(),
                "checkpointId": checkpoint_id.to_string(),
                "mode": mode.as_str(),
            }),
            Some(&self.session_id),
        );

        let default_error = match mode {
            RewindMode::Both => "File rewind failed",
            _ => "Rewind failed",
        };

        let failure = |error: String| {
            self.hub.publish(
                topics::REWIND_FAILED,
                json!({
                    "sessionId": self.session_id.to_string(),
                    "checkpointId": checkpoint_id.to_string(),
                    "mode": mode.as_str(),
                    "error": error.clone(),
                }),
                Some(&self.session_id),
            );
            RewindResult::failed(error)
        };

        let checkpoint = match self.checkpoint(checkpoint_id) {
            Ok(Some(c)) => c,
            Ok(None) => return failure("Checkpoint not found".to_string()),
            Err(e) => return failure(normalize_error(e.to_string())),
        };

        let Some(query) = query else {
            return failure("SDK query not active".to_string());
        };
        if !query.is_ready() {
            return failure("SDK not ready".to_string());
        }

        let result = match query.rewind_files(&checkpoint.id, false).await {
            Ok(result) => result,
            Err(e) => return failure(normalize_error(e.normalized_message())),
        };

        if !result.can_rewind {
            let error = result
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| default_error.to_string());
            return failure(error);
        }

        self.hub.publish(
            topics::REWIND_COMPLETED,
            json!({
                "sessionId": self.session_id.to_string(),
                "checkpointId": checkpoint_id.to_string(),
                "mode": mode.as_str(),
                "filesChanged": result.files_changed,
                "insertions": result.insertions,
                "deletions": result.deletions,
            }),
            Some(&self.session_id),
        );

        RewindResult {
            success: true,
            files_changed: result.files_changed,
            insertions: result.insertions,
            deletions: result.deletions,
            ..Default::default()
        }
    }

    /// Rewind the conversation: atomically delete every message strictly
    /// after the checkpoint, point `resumeSessionAt` at it, and drop later
    /// checkpoints. The caller restarts the query afterwards.
    pub fn execute_conversation_rewind(
        &self,
        checkpoint_id: &CheckpointId,
    ) -> Result<usize, String> {
        let checkpoint = match self.checkpoint(checkpoint_id) {
            Ok(Some(c)) => c,
            Ok(None) => return Err("Checkpoint not found".to_string()),
            Err(e) => return Err(normalize_error(e.to_string())),
        };

        let session_id = self.session_id.clone();
        let deleted = self
            .db
            .with_tx(|tx| {
                let deleted = tx.execute(
                    "DELETE FROM sdk_messages WHERE session_id = ?1 AND timestamp > ?2",
                    rusqlite::params![session_id.as_str(), checkpoint.timestamp],
                )?;
                tx.execute(
                    "DELETE FROM checkpoints WHERE session_id = ?1 AND turn_number > ?2",
                    rusqlite::params![session_id.as_str(), checkpoint.turn_number],
                )?;

                let metadata_str: String = tx.query_row(
                    "SELECT metadata FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )?;
                let mut metadata: SessionMetadata = serde_json::from_str(&metadata_str)?;
                metadata.resume_session_at = Some(checkpoint.id.clone());
                tx.execute(
                    "UPDATE sessions SET metadata = ?1 WHERE id = ?2",
                    rusqlite::params![serde_json::to_string(&metadata)?, session_id.as_str()],
                )?;
                Ok(deleted)
            })
            .map_err(|e| normalize_error(e.to_string()))?;

        Ok(deleted)
    }

    /// Preview a selective rewind over explicit message ids.
    pub fn preview_selective_rewind(&self, message_ids: &[MessageId]) -> RewindPreview {
        if message_ids.is_empty() {
            return RewindPreview::failed("No messages selected");
        }

        let repo = SdkMessageRepo::new(self.db.clone());
        let mut found = 0;
        for id in message_ids {
            match repo.get_by_uuid(&self.session_id, id) {
                Ok(Some(_)) => found += 1,
                Ok(None) => {}
                Err(e) => return RewindPreview::failed(normalize_error(e.to_string())),
            }
        }

        RewindPreview {
            can_rewind: found > 0,
            messages_selected: Some(found),
            ..Default::default()
        }
    }

    /// Delete an explicit set of messages. The caller restarts the query.
    pub fn execute_selective_rewind(&self, message_ids: &[MessageId]) -> RewindResult {
        if message_ids.is_empty() {
            return RewindResult::failed("No messages selected");
        }

        match SdkMessageRepo::new(self.db.clone()).delete_by_uuids(&self.session_id, message_ids) {
            Ok(deleted) => RewindResult {
                success: true,
                conversation_rewound: Some(true),
                messages_deleted: Some(deleted),
                ..Default::default()
            },
            Err(e) => RewindResult::failed(normalize_error(e.to_string())),
        }
    }
}
