use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kai_core::ids::{MessageId, SessionId};
use kai_core::messages::{SdkMessage, SdkMessageType};

use crate::database::Database;
use crate::error::StoreError;

/// Per-session append lock so sequence numbers are assigned atomically.
struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Store for transport-emitted SDK messages. `(session_id, uuid)` is unique;
/// listing order is server timestamp with the insertion sequence breaking
/// ties.
pub struct SdkMessageRepo {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

impl SdkMessageRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks::new()),
        }
    }

    /// Insert a message, assigning the next per-session sequence number.
    /// A duplicate `(session_id, uuid)` is a conflict.
    pub fn insert(&self, message: &SdkMessage) -> Result<i64, StoreError> {
        let lock = self.session_locks.lock().get(message.session_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), -1) FROM sdk_messages WHERE session_id = ?1",
                [message.session_id.as_str()],
                |row| row.get(0),
            )?;
            let seq = max_seq + 1;

            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sdk_messages (uuid, session_id, seq, type, parent_tool_use_id, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.uuid.as_str(),
                    message.session_id.as_str(),
                    seq,
                    message.message_type.to_string(),
                    message.parent_tool_use_id,
                    serde_json::to_string(&message.content)?,
                    message.timestamp,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!(
                    "duplicate message {} in session {}",
                    message.uuid, message.session_id
                )));
            }
            Ok(seq)
        })
    }

    /// List messages in delivery order (timestamp, then insertion order).
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Vec<SdkMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let limit = limit.unwrap_or(10_000);
            let mut stmt = conn.prepare(
                "SELECT uuid, session_id, type, parent_tool_use_id, content, timestamp
                 FROM sdk_messages WHERE session_id = ?1
                 ORDER BY timestamp ASC, seq ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), limit], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// List messages of one type, in delivery order.
    pub fn list_by_type(
        &self,
        session_id: &SessionId,
        message_type: SdkMessageType,
    ) -> Result<Vec<SdkMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uuid, session_id, type, parent_tool_use_id, content, timestamp
                 FROM sdk_messages WHERE session_id = ?1 AND type = ?2
                 ORDER BY timestamp ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![session_id.as_str(), message_type.to_string()],
                    row_to_message,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_by_uuid(
        &self,
        session_id: &SessionId,
        uuid: &MessageId,
    ) -> Result<Option<SdkMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uuid, session_id, type, parent_tool_use_id, content, timestamp
                 FROM sdk_messages WHERE session_id = ?1 AND uuid = ?2",
            )?;
            let mut rows =
                stmt.query(rusqlite::params![session_id.as_str(), uuid.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_message(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sdk_messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// Delete specific messages by uuid. Returns the number removed.
    pub fn delete_by_uuids(
        &self,
        session_id: &SessionId,
        uuids: &[MessageId],
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let mut removed = 0;
            for uuid in uuids {
                removed += conn.execute(
                    "DELETE FROM sdk_messages WHERE session_id = ?1 AND uuid = ?2",
                    rusqlite::params![session_id.as_str(), uuid.as_str()],
                )?;
            }
            Ok(removed)
        })
    }

    /// Delete messages strictly after the given timestamp.
    /// Returns the number removed.
    pub fn delete_after(
        &self,
        session_id: &SessionId,
        timestamp: &str,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM sdk_messages WHERE session_id = ?1 AND timestamp > ?2",
                rusqlite::params![session_id.as_str(), timestamp],
            )?;
            Ok(removed)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<SdkMessage, rusqlite::Error> {
    let type_str: String = row.get(2)?;
    let content_str: String = row.get(4)?;
    Ok(SdkMessage {
        uuid: MessageId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        message_type: type_str.parse().unwrap_or(SdkMessageType::System),
        parent_tool_use_id: row.get(3)?,
        content: serde_json::from_str(&content_str).unwrap_or(serde_json::Value::Null),
        timestamp: row.get(5)?,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMessageStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for UserMessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for UserMessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown user message status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    pub status: UserMessageStatus,
    pub timestamp: String,
}

/// Store for user-submitted messages awaiting (or already flushed into) a
/// query.
pub struct UserMessageRepo {
    db: Database,
}

impl UserMessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(
        &self,
        session_id: &SessionId,
        content: &str,
        images: Option<Vec<String>>,
    ) -> Result<UserMessageRow, StoreError> {
        self.insert_with_id(MessageId::new(), session_id, content, images)
    }

    pub fn insert_with_id(
        &self,
        id: MessageId,
        session_id: &SessionId,
        content: &str,
        images: Option<Vec<String>>,
    ) -> Result<UserMessageRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_messages (id, session_id, content, images, status, timestamp)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    content,
                    images.as_ref().map(serde_json::to_string).transpose()?,
                    now,
                ],
            )?;
            Ok(UserMessageRow {
                id,
                session_id: session_id.clone(),
                content: content.to_string(),
                images,
                status: UserMessageStatus::Pending,
                timestamp: now,
            })
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<UserMessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, content, images, status, timestamp
                 FROM user_messages WHERE session_id = ?1
                 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([session_id.as_str()], row_to_user_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_pending(&self, session_id: &SessionId) -> Result<Vec<UserMessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, content, images, status, timestamp
                 FROM user_messages WHERE session_id = ?1 AND status = 'pending'
                 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([session_id.as_str()], row_to_user_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_by_status(
        &self,
        session_id: &SessionId,
        status: UserMessageStatus,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM user_messages WHERE session_id = ?1 AND status = ?2",
                rusqlite::params![session_id.as_str(), status.to_string()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    pub fn update_status(
        &self,
        id: &MessageId,
        status: UserMessageStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE user_messages SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.to_string(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user message {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_user_message(row: &rusqlite::Row<'_>) -> Result<UserMessageRow, rusqlite::Error> {
    let status_str: String = row.get(4)?;
    let images_str: Option<String> = row.get(3)?;
    Ok(UserMessageRow {
        id: MessageId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        content: row.get(2)?,
        images: images_str.and_then(|s| serde_json::from_str(&s).ok()),
        status: status_str.parse().unwrap_or(UserMessageStatus::Pending),
        timestamp: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use kai_core::config::SessionConfig;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let sess_repo = SessionRepo::new(db.clone());
        let session = sess_repo.create("/w", None, SessionConfig::default()).unwrap();
        (db, session.id)
    }

    #[test]
    fn insert_assigns_sequences() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        let s0 = repo.insert(&SdkMessage::user_text(sid.clone(), "a")).unwrap();
        let s1 = repo.insert(&SdkMessage::assistant_text(sid.clone(), "b")).unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
    }

    #[test]
    fn duplicate_uuid_conflicts() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        let msg = SdkMessage::user_text(sid, "hello");
        repo.insert(&msg).unwrap();
        let result = repo.insert(&msg);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn same_uuid_in_other_session_is_fine() {
        let (db, sid) = setup();
        let sess_repo = SessionRepo::new(db.clone());
        let other = sess_repo.create("/w2", None, SessionConfig::default()).unwrap();
        let repo = SdkMessageRepo::new(db);

        let msg = SdkMessage::user_text(sid, "hello");
        repo.insert(&msg).unwrap();

        let mut cloned = msg.clone();
        cloned.session_id = other.id;
        repo.insert(&cloned).unwrap();
    }

    #[test]
    fn list_orders_by_timestamp_then_insertion() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        // Same timestamp for all three, so insertion order must hold
        let ts = "2026-01-01T00:00:00+00:00".to_string();
        for text in ["first", "second", "third"] {
            let mut msg = SdkMessage::user_text(sid.clone(), text);
            msg.timestamp = ts.clone();
            repo.insert(&msg).unwrap();
        }

        let listed = repo.list(&sid, None).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].text(), "first");
        assert_eq!(listed[1].text(), "second");
        assert_eq!(listed[2].text(), "third");
    }

    #[test]
    fn list_by_type_filters() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        repo.insert(&SdkMessage::user_text(sid.clone(), "u1")).unwrap();
        repo.insert(&SdkMessage::assistant_text(sid.clone(), "a1")).unwrap();
        repo.insert(&SdkMessage::assistant_text(sid.clone(), "a2")).unwrap();

        let assistants = repo.list_by_type(&sid, SdkMessageType::Assistant).unwrap();
        assert_eq!(assistants.len(), 2);
        assert_eq!(assistants[0].text(), "a1");
        assert_eq!(assistants[1].text(), "a2");
    }

    #[test]
    fn get_by_uuid() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        let msg = SdkMessage::user_text(sid.clone(), "find me");
        repo.insert(&msg).unwrap();

        let found = repo.get_by_uuid(&sid, &msg.uuid).unwrap().unwrap();
        assert_eq!(found.text(), "find me");

        let missing = repo.get_by_uuid(&sid, &MessageId::new()).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn delete_after_is_strict() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        let stamps = [
            "2026-01-01T00:00:01+00:00",
            "2026-01-01T00:00:02+00:00",
            "2026-01-01T00:00:03+00:00",
        ];
        for ts in stamps {
            let mut msg = SdkMessage::user_text(sid.clone(), ts);
            msg.timestamp = ts.to_string();
            repo.insert(&msg).unwrap();
        }

        // Strictly after :02, so only :03 goes
        let removed = repo.delete_after(&sid, "2026-01-01T00:00:02+00:00").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.count(&sid).unwrap(), 2);
    }

    #[test]
    fn delete_by_uuids_counts_found_only() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);

        let a = SdkMessage::user_text(sid.clone(), "a");
        let b = SdkMessage::user_text(sid.clone(), "b");
        repo.insert(&a).unwrap();
        repo.insert(&b).unwrap();

        let removed = repo
            .delete_by_uuids(&sid, &[a.uuid.clone(), MessageId::new()])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.count(&sid).unwrap(), 1);
    }

    #[test]
    fn count_messages() {
        let (db, sid) = setup();
        let repo = SdkMessageRepo::new(db);
        assert_eq!(repo.count(&sid).unwrap(), 0);
        repo.insert(&SdkMessage::user_text(sid.clone(), "x")).unwrap();
        assert_eq!(repo.count(&sid).unwrap(), 1);
    }

    #[test]
    fn concurrent_inserts_get_unique_sequences() {
        let (db, sid) = setup();
        let repo = Arc::new(SdkMessageRepo::new(db));

        let mut handles = vec![];
        for i in 0..10 {
            let repo = repo.clone();
            let sid = sid.clone();
            handles.push(std::thread::spawn(move || {
                repo.insert(&SdkMessage::user_text(sid, format!("m{i}"))).unwrap()
            }));
        }
        let mut seqs: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        seqs.sort();
        seqs.dedup();
        assert_eq!(seqs.len(), 10);
    }

    // ── user messages ──

    #[test]
    fn user_message_lifecycle() {
        let (db, sid) = setup();
        let repo = UserMessageRepo::new(db);

        let msg = repo.insert(&sid, "run the tests", None).unwrap();
        assert_eq!(msg.status, UserMessageStatus::Pending);
        assert_eq!(repo.count_by_status(&sid, UserMessageStatus::Pending).unwrap(), 1);

        repo.update_status(&msg.id, UserMessageStatus::Sent).unwrap();
        assert_eq!(repo.count_by_status(&sid, UserMessageStatus::Pending).unwrap(), 0);
        assert_eq!(repo.count_by_status(&sid, UserMessageStatus::Sent).unwrap(), 1);
    }

    #[test]
    fn list_pending_in_order() {
        let (db, sid) = setup();
        let repo = UserMessageRepo::new(db);

        let a = repo.insert(&sid, "first", None).unwrap();
        repo.insert(&sid, "second", None).unwrap();
        repo.update_status(&a.id, UserMessageStatus::Sent).unwrap();

        let pending = repo.list_pending(&sid).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "second");
    }

    #[test]
    fn user_message_images_roundtrip() {
        let (db, sid) = setup();
        let repo = UserMessageRepo::new(db);

        repo.insert(&sid, "see this", Some(vec!["data:image/png;base64,AAAA".into()]))
            .unwrap();
        let listed = repo.list(&sid).unwrap();
        assert_eq!(listed[0].images.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn update_missing_user_message_fails() {
        let (db, _) = setup();
        let repo = UserMessageRepo::new(db);
        let result = repo.update_status(&MessageId::new(), UserMessageStatus::Sent);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
