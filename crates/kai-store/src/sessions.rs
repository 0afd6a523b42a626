use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use kai_core::config::{SessionConfig, SessionMetadata};
use kai_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Archived,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

impl SessionStatus {
    /// Legal transitions: pending → active, active → archived.
    /// Same-status writes are allowed (idempotent updates).
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        self == next
            || matches!(
                (self, next),
                (Self::Pending, Self::Active) | (Self::Active, Self::Archived)
            )
    }
}

/// Ordering hint for session listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionOrder {
    #[default]
    LastActiveDesc,
    CreatedAtDesc,
    CreatedAtAsc,
}

impl SessionOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::LastActiveDesc => "last_active_at DESC",
            Self::CreatedAtDesc => "created_at DESC",
            Self::CreatedAtAsc => "created_at ASC",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub workspace_path: String,
    pub status: SessionStatus,
    pub config: SessionConfig,
    pub metadata: SessionMetadata,
    pub created_at: String,
    pub last_active_at: String,
}

const SELECT_COLS: &str =
    "id, title, workspace_path, status, config, metadata, created_at, last_active_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in `pending` status.
    #[instrument(skip(self, config), fields(workspace_path))]
    pub fn create(
        &self,
        workspace_path: &str,
        title: Option<&str>,
        config: SessionConfig,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        let metadata = SessionMetadata::default();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, workspace_path, status, config, metadata, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    title,
                    workspace_path,
                    serde_json::to_string(&config)?,
                    serde_json::to_string(&metadata)?,
                    now,
                    now,
                ],
            )?;

            Ok(SessionRow {
                id,
                title: title.map(str::to_string),
                workspace_path: workspace_path.to_string(),
                status: SessionStatus::Pending,
                config,
                metadata,
                created_at: now.clone(),
                last_active_at: now,
            })
        })
    }

    /// Get a session by ID.
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    pub fn exists(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// List sessions. Default order is `last_active_at DESC`.
    pub fn list(
        &self,
        status: Option<SessionStatus>,
        order: Option<SessionOrder>,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let order = order.unwrap_or_default();
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLS} FROM sessions WHERE status = ?1 ORDER BY {}",
                        order.sql()
                    ))?;
                    let mut rows = stmt.query([s.to_string()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_session(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLS} FROM sessions ORDER BY {}",
                        order.sql()
                    ))?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_session(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Count sessions with archived status.
    pub fn count_archived(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = 'archived'",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// Update session status, enforcing the legal transitions
    /// (pending → active, active → archived).
    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let current = self.get(id)?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "illegal status transition: {} -> {}",
                current.status, status
            )));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.to_string(), id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn update_title(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2",
                rusqlite::params![title, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn update_config(&self, id: &SessionId, config: &SessionConfig) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET config = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(config)?, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn update_metadata(
        &self,
        id: &SessionId,
        metadata: &SessionMetadata,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET metadata = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(metadata)?, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Advance `last_active_at` to now. Monotonic: an older timestamp never
    /// overwrites a newer one.
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_active_at = MAX(last_active_at, ?1) WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Explicitly reset `last_active_at` (the one allowed non-monotonic write).
    pub fn reset_last_active(&self, id: &SessionId, timestamp: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
                rusqlite::params![timestamp, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Delete a session and everything hanging off it.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM sdk_messages WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM user_messages WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM checkpoints WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row.get(3)?;
    let status = status_str
        .parse()
        .map_err(|detail| StoreError::CorruptRow {
            table: "sessions",
            column: "status",
            detail,
        })?;
    let config_str: String = row.get(4)?;
    let metadata_str: String = row.get(5)?;

    Ok(SessionRow {
        id: SessionId::from_raw(row.get::<_, String>(0)?),
        title: row.get(1)?,
        workspace_path: row.get(2)?,
        status,
        config: serde_json::from_str(&config_str)?,
        metadata: serde_json::from_str(&metadata_str)?,
        created_at: row.get(6)?,
        last_active_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_session() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.config.model, "default");
        assert!(session.title.is_none());
    }

    #[test]
    fn get_session() {
        let repo = setup();
        let session = repo
            .create("/w", Some("My Session"), SessionConfig::default())
            .unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.title.as_deref(), Some("My Session"));
        assert_eq!(fetched.workspace_path, "/w");
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_orders_by_last_active_desc() {
        let repo = setup();
        let a = repo.create("/a", None, SessionConfig::default()).unwrap();
        let b = repo.create("/b", None, SessionConfig::default()).unwrap();

        // Touch a so it becomes most recent
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.touch(&a.id).unwrap();

        let all = repo.list(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a.id);
        assert_eq!(all[1].id, b.id);
    }

    #[test]
    fn list_with_status_filter() {
        let repo = setup();
        let a = repo.create("/a", None, SessionConfig::default()).unwrap();
        repo.create("/b", None, SessionConfig::default()).unwrap();
        repo.update_status(&a.id, SessionStatus::Active).unwrap();

        let pending = repo.list(Some(SessionStatus::Pending), None).unwrap();
        assert_eq!(pending.len(), 1);
        let active = repo.list(Some(SessionStatus::Active), None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[test]
    fn status_transitions_enforced() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();

        // pending -> archived is illegal
        let result = repo.update_status(&session.id, SessionStatus::Archived);
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // pending -> active -> archived is the legal path
        repo.update_status(&session.id, SessionStatus::Active).unwrap();
        repo.update_status(&session.id, SessionStatus::Archived).unwrap();

        // archived -> active is illegal
        let result = repo.update_status(&session.id, SessionStatus::Active);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn same_status_write_is_idempotent() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();
        repo.update_status(&session.id, SessionStatus::Pending).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().status, SessionStatus::Pending);
    }

    #[test]
    fn touch_is_monotonic() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();

        // Push last_active_at into the future, then touch; it must not go back
        let future = "2999-01-01T00:00:00+00:00";
        repo.reset_last_active(&session.id, future).unwrap();
        repo.touch(&session.id).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().last_active_at, future);
    }

    #[test]
    fn reset_last_active_is_explicit_override() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();
        repo.reset_last_active(&session.id, "2020-01-01T00:00:00+00:00").unwrap();
        assert_eq!(
            repo.get(&session.id).unwrap().last_active_at,
            "2020-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn update_config_roundtrip() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();

        let mut config = session.config.clone();
        config.model = "opus".into();
        config.coordinator_mode = Some(true);
        repo.update_config(&session.id, &config).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.config.model, "opus");
        assert!(fetched.config.coordinator_mode());
    }

    #[test]
    fn update_metadata_roundtrip() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();

        let mut metadata = session.metadata.clone();
        metadata.message_count = 7;
        metadata.recovery_context.retry_count = 2;
        repo.update_metadata(&session.id, &metadata).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.metadata.message_count, 7);
        assert_eq!(fetched.metadata.recovery_context.retry_count, 2);
    }

    #[test]
    fn update_on_missing_session_fails() {
        let repo = setup();
        let missing = SessionId::from_raw("sess_missing");
        assert!(repo.update_title(&missing, "t").is_err());
        assert!(repo
            .update_config(&missing, &SessionConfig::default())
            .is_err());
    }

    #[test]
    fn delete_session() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();
        repo.delete(&session.id).unwrap();
        assert!(repo.get(&session.id).is_err());
    }

    #[test]
    fn count_archived() {
        let repo = setup();
        assert_eq!(repo.count_archived().unwrap(), 0);
        let a = repo.create("/a", None, SessionConfig::default()).unwrap();
        repo.update_status(&a.id, SessionStatus::Active).unwrap();
        repo.update_status(&a.id, SessionStatus::Archived).unwrap();
        assert_eq!(repo.count_archived().unwrap(), 1);
    }

    #[test]
    fn invalid_status_returns_corrupt_row() {
        let repo = setup();
        let session = repo.create("/w", None, SessionConfig::default()).unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'INVALID' WHERE id = ?1",
                    [session.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let result = repo.get(&session.id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
