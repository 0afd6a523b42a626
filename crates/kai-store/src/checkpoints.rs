use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kai_core::ids::{CheckpointId, SessionId};

use crate::database::Database;
use crate::error::StoreError;

/// An immutable rewind point. `turn_number` is 1-based and strictly
/// increasing within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRow {
    pub id: CheckpointId,
    pub session_id: SessionId,
    pub message_preview: String,
    pub turn_number: i64,
    pub timestamp: String,
}

struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct CheckpointRepo {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

impl CheckpointRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks {
                locks: HashMap::new(),
            }),
        }
    }

    /// Insert a checkpoint, assigning the next turn number under the
    /// per-session lock.
    pub fn insert(
        &self,
        session_id: &SessionId,
        message_preview: &str,
    ) -> Result<CheckpointRow, StoreError> {
        let lock = self.session_locks.lock().get(session_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let max_turn: i64 = conn.query_row(
                "SELECT COALESCE(MAX(turn_number), 0) FROM checkpoints WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;

            let id = CheckpointId::new();
            let now = Utc::now().to_rfc3339();
            let turn_number = max_turn + 1;

            conn.execute(
                "INSERT INTO checkpoints (id, session_id, message_preview, turn_number, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    message_preview,
                    turn_number,
                    now,
                ],
            )?;

            Ok(CheckpointRow {
                id,
                session_id: session_id.clone(),
                message_preview: message_preview.to_string(),
                turn_number,
                timestamp: now,
            })
        })
    }

    /// List checkpoints, newest turn first.
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<CheckpointRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, message_preview, turn_number, timestamp
                 FROM checkpoints WHERE session_id = ?1
                 ORDER BY turn_number DESC",
            )?;
            let rows = stmt
                .query_map([session_id.as_str()], row_to_checkpoint)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get(
        &self,
        session_id: &SessionId,
        id: &CheckpointId,
    ) -> Result<Option<CheckpointRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, message_preview, turn_number, timestamp
                 FROM checkpoints WHERE session_id = ?1 AND id = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_checkpoint(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Remove checkpoints with a turn number greater than the given one.
    /// Used by the rewind engine after a conversation rewind.
    pub fn delete_after_turn(
        &self,
        session_id: &SessionId,
        turn_number: i64,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM checkpoints WHERE session_id = ?1 AND turn_number > ?2",
                rusqlite::params![session_id.as_str(), turn_number],
            )?;
            Ok(removed)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<CheckpointRow, rusqlite::Error> {
    Ok(CheckpointRow {
        id: CheckpointId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        message_preview: row.get(2)?,
        turn_number: row.get(3)?,
        timestamp: row.get(4)?,
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
    fn turn_numbers_start_at_one_and_increase() {
        let (db, sid) = setup();
        let repo = CheckpointRepo::new(db);

        let c1 = repo.insert(&sid, "fix the bug").unwrap();
        let c2 = repo.insert(&sid, "add a test").unwrap();
        let c3 = repo.insert(&sid, "refactor").unwrap();

        assert_eq!(c1.turn_number, 1);
        assert_eq!(c2.turn_number, 2);
        assert_eq!(c3.turn_number, 3);
    }

    #[test]
    fn list_newest_turn_first() {
        let (db, sid) = setup();
        let repo = CheckpointRepo::new(db);

        repo.insert(&sid, "one").unwrap();
        repo.insert(&sid, "two").unwrap();

        let listed = repo.list(&sid).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].turn_number, 2);
        assert_eq!(listed[1].turn_number, 1);
    }

    #[test]
    fn get_by_id_scoped_to_session() {
        let (db, sid) = setup();
        let sess_repo = SessionRepo::new(db.clone());
        let other = sess_repo.create("/w2", None, SessionConfig::default()).unwrap();
        let repo = CheckpointRepo::new(db);

        let ckpt = repo.insert(&sid, "hello").unwrap();
        assert!(repo.get(&sid, &ckpt.id).unwrap().is_some());
        // Foreign session cannot see it
        assert!(repo.get(&other.id, &ckpt.id).unwrap().is_none());
    }

    #[test]
    fn delete_after_turn() {
        let (db, sid) = setup();
        let repo = CheckpointRepo::new(db);

        repo.insert(&sid, "one").unwrap();
        repo.insert(&sid, "two").unwrap();
        repo.insert(&sid, "three").unwrap();

        let removed = repo.delete_after_turn(&sid, 1).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.count(&sid).unwrap(), 1);

        // Next insert continues past the highest surviving turn
        let next = repo.insert(&sid, "four").unwrap();
        assert_eq!(next.turn_number, 2);
    }

    #[test]
    fn timestamps_monotonic() {
        let (db, sid) = setup();
        let repo = CheckpointRepo::new(db);

        let c1 = repo.insert(&sid, "a").unwrap();
        let c2 = repo.insert(&sid, "b").unwrap();
        assert!(c2.timestamp >= c1.timestamp);
    }

    #[test]
    fn concurrent_inserts_unique_turns() {
        let (db, sid) = setup();
        let repo = Arc::new(CheckpointRepo::new(db));

        let mut handles = vec![];
        for i in 0..10 {
            let repo = repo.clone();
            let sid = sid.clone();
            handles.push(std::thread::spawn(move || {
                repo.insert(&sid, &format!("turn {i}")).unwrap().turn_number
            }));
        }
        let mut turns: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        turns.sort();
        turns.dedup();
        assert_eq!(turns.len(), 10);
    }
}
