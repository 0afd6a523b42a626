use chrono::Utc;
use serde::{Deserialize, Serialize};

use kai_core::ids::{MemoryId, RoomId, SessionId, TaskId};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Conversation,
    TaskResult,
    Preference,
    Pattern,
    Note,
    Decision,
    Error,
    Success,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Conversation => "conversation",
            Self::TaskResult => "task_result",
            Self::Preference => "preference",
            Self::Pattern => "pattern",
            Self::Note => "note",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::Success => "success",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "task_result" => Ok(Self::TaskResult),
            "preference" => Ok(Self::Preference),
            "pattern" => Ok(Self::Pattern),
            "note" => Ok(Self::Note),
            "decision" => Ok(Self::Decision),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryImportance {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for MemoryImportance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for MemoryImportance {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown importance: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRow {
    pub id: MemoryId,
    pub room_id: RoomId,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    pub tags: Vec<String>,
    pub importance: MemoryImportance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub created_at: String,
    pub last_accessed_at: String,
    pub access_count: u32,
}

/// Filters for `recall`. Tags require ALL listed tags to be present.
#[derive(Clone, Debug, Default)]
pub struct RecallFilter {
    pub memory_type: Option<MemoryType>,
    pub tags: Option<Vec<String>>,
    pub limit: Option<u32>,
}

/// Escape LIKE metacharacters so the query matches them literally.
fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

const MEMORY_COLS: &str = "id, room_id, type, content, tags, importance, session_id, task_id, created_at, last_accessed_at, access_count";

/// Per-room memory records. All operations are scoped by room: foreign reads
/// come back empty, foreign writes and deletes are no-ops returning `false`.
///
/// Recall orders by `(importance DESC, created_at DESC)` and search by
/// `(importance DESC, last_accessed_at DESC)`, where importance compares as
/// the stored string ("normal" > "low" > "high"). That lexicographic order is
/// long-standing observed behavior; callers depend on it, so it stays.
pub struct MemoryRepo {
    db: Database,
}

impl MemoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        room_id: &RoomId,
        memory_type: MemoryType,
        content: &str,
        tags: &[String],
        importance: MemoryImportance,
        session_id: Option<&SessionId>,
        task_id: Option<&TaskId>,
    ) -> Result<MemoryRow, StoreError> {
        let id = MemoryId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories
                   (id, room_id, type, content, tags, importance, session_id, task_id,
                    created_at, last_accessed_at, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
                rusqlite::params![
                    id.as_str(),
                    room_id.as_str(),
                    memory_type.to_string(),
                    content,
                    serde_json::to_string(tags)?,
                    importance.to_string(),
                    session_id.map(|s| s.as_str().to_string()),
                    task_id.map(|t| t.as_str().to_string()),
                    now,
                    now,
                ],
            )?;
            Ok(MemoryRow {
                id,
                room_id: room_id.clone(),
                memory_type,
                content: content.to_string(),
                tags: tags.to_vec(),
                importance,
                session_id: session_id.cloned(),
                task_id: task_id.cloned(),
                created_at: now.clone(),
                last_accessed_at: now,
                access_count: 0,
            })
        })
    }

    /// Get a memory by id within a room. Foreign rooms see nothing.
    pub fn get(&self, room_id: &RoomId, id: &MemoryId) -> Result<Option<MemoryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMORY_COLS} FROM memories WHERE room_id = ?1 AND id = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![room_id.as_str(), id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_memory(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Filtered recall. Tags filter requires every listed tag; records access
    /// for each returned record.
    pub fn recall(
        &self,
        room_id: &RoomId,
        filter: &RecallFilter,
    ) -> Result<Vec<MemoryRow>, StoreError> {
        let candidates = self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match filter.memory_type {
                Some(t) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MEMORY_COLS} FROM memories
                         WHERE room_id = ?1 AND type = ?2
                         ORDER BY importance DESC, created_at DESC"
                    ))?;
                    let mut rows =
                        stmt.query(rusqlite::params![room_id.as_str(), t.to_string()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_memory(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MEMORY_COLS} FROM memories
                         WHERE room_id = ?1
                         ORDER BY importance DESC, created_at DESC"
                    ))?;
                    let mut rows = stmt.query([room_id.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_memory(row)?);
                    }
                }
            }
            Ok(results)
        })?;

        let mut matched: Vec<MemoryRow> = candidates
            .into_iter()
            .filter(|m| match &filter.tags {
                Some(required) => required.iter().all(|t| m.tags.contains(t)),
                None => true,
            })
            .collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit as usize);
        }

        self.record_access_all(&mut matched)?;
        Ok(matched)
    }

    /// Case-insensitive substring search on content. LIKE metacharacters in
    /// the query match literally. Records access for each returned record.
    pub fn search(
        &self,
        room_id: &RoomId,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<MemoryRow>, StoreError> {
        let pattern = format!("%{}%", escape_like(query));
        let limit = limit.unwrap_or(50);
        let mut matched = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMORY_COLS} FROM memories
                 WHERE room_id = ?1 AND content LIKE ?2 ESCAPE '\\'
                 ORDER BY importance DESC, last_accessed_at DESC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![room_id.as_str(), pattern, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_memory(row)?);
            }
            Ok(results)
        })?;

        self.record_access_all(&mut matched)?;
        Ok(matched)
    }

    /// Bump the access count and refresh `last_accessed_at`.
    pub fn record_access(&self, id: &MemoryId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    fn record_access_all(&self, records: &mut [MemoryRow]) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        for record in records.iter_mut() {
            self.record_access(&record.id)?;
            record.access_count += 1;
            record.last_accessed_at = now.clone();
        }
        Ok(())
    }

    /// Delete a memory owned by the room. Returns `false` when the id is
    /// unknown or owned by another room.
    pub fn delete(&self, room_id: &RoomId, id: &MemoryId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM memories WHERE room_id = ?1 AND id = ?2",
                rusqlite::params![room_id.as_str(), id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn count(&self, room_id: &RoomId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE room_id = ?1",
                [room_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// List memories, optionally by type, newest first. Does not record
    /// access.
    pub fn list(
        &self,
        room_id: &RoomId,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<MemoryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match memory_type {
                Some(t) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MEMORY_COLS} FROM memories
                         WHERE room_id = ?1 AND type = ?2 ORDER BY created_at DESC"
                    ))?;
                    let mut rows =
                        stmt.query(rusqlite::params![room_id.as_str(), t.to_string()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_memory(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MEMORY_COLS} FROM memories
                         WHERE room_id = ?1 ORDER BY created_at DESC"
                    ))?;
                    let mut rows = stmt.query([room_id.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_memory(row)?);
                    }
                }
            }
            Ok(results)
        })
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> Result<MemoryRow, StoreError> {
    let type_str: String = row.get(2)?;
    let tags_str: String = row.get(4)?;
    let importance_str: String = row.get(5)?;
    Ok(MemoryRow {
        id: MemoryId::from_raw(row.get::<_, String>(0)?),
        room_id: RoomId::from_raw(row.get::<_, String>(1)?),
        memory_type: type_str.parse().map_err(|detail| StoreError::CorruptRow {
            table: "memories",
            column: "type",
            detail,
        })?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags_str)?,
        importance: importance_str
            .parse()
            .map_err(|detail| StoreError::CorruptRow {
                table: "memories",
                column: "importance",
                detail,
            })?,
        session_id: row.get::<_, Option<String>>(6)?.map(SessionId::from_raw),
        task_id: row.get::<_, Option<String>>(7)?.map(TaskId::from_raw),
        created_at: row.get(8)?,
        last_accessed_at: row.get(9)?,
        access_count: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomRepo;

    fn setup() -> (MemoryRepo, RoomId, RoomId) {
        let db = Database::in_memory().unwrap();
        let rooms = RoomRepo::new(db.clone());
        let a = rooms.create("room a", &[], None).unwrap();
        let b = rooms.create("room b", &[], None).unwrap();
        (MemoryRepo::new(db), a.id, b.id)
    }

    fn add_simple(repo: &MemoryRepo, room: &RoomId, content: &str) -> MemoryRow {
        repo.add(
            room,
            MemoryType::Note,
            content,
            &[],
            MemoryImportance::Normal,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn add_and_get() {
        let (repo, room, _) = setup();
        let mem = add_simple(&repo, &room, "remember this");
        let fetched = repo.get(&room, &mem.id).unwrap().unwrap();
        assert_eq!(fetched.content, "remember this");
        assert_eq!(fetched.memory_type, MemoryType::Note);
        assert_eq!(fetched.access_count, 0);
    }

    #[test]
    fn foreign_room_get_returns_none() {
        let (repo, room, other) = setup();
        let mem = add_simple(&repo, &room, "private");
        assert!(repo.get(&other, &mem.id).unwrap().is_none());
    }

    #[test]
    fn foreign_room_delete_returns_false() {
        let (repo, room, other) = setup();
        let mem = add_simple(&repo, &room, "private");

        assert!(!repo.delete(&other, &mem.id).unwrap());
        assert!(!repo.delete(&room, &MemoryId::new()).unwrap());
        assert!(repo.delete(&room, &mem.id).unwrap());
        // Already gone
        assert!(!repo.delete(&room, &mem.id).unwrap());
    }

    #[test]
    fn recall_requires_all_tags() {
        let (repo, room, _) = setup();
        repo.add(
            &room,
            MemoryType::Pattern,
            "tagged both",
            &["rust".into(), "async".into()],
            MemoryImportance::Normal,
            None,
            None,
        )
        .unwrap();
        repo.add(
            &room,
            MemoryType::Pattern,
            "tagged one",
            &["rust".into()],
            MemoryImportance::Normal,
            None,
            None,
        )
        .unwrap();

        let filter = RecallFilter {
            tags: Some(vec!["rust".into(), "async".into()]),
            ..Default::default()
        };
        let results = repo.recall(&room, &filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "tagged both");
    }

    #[test]
    fn recall_filters_by_type_and_limit() {
        let (repo, room, _) = setup();
        for i in 0..3 {
            repo.add(
                &room,
                MemoryType::Decision,
                &format!("decision {i}"),
                &[],
                MemoryImportance::Normal,
                None,
                None,
            )
            .unwrap();
        }
        add_simple(&repo, &room, "a note");

        let filter = RecallFilter {
            memory_type: Some(MemoryType::Decision),
            limit: Some(2),
            ..Default::default()
        };
        let results = repo.recall(&room, &filter).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|m| m.memory_type == MemoryType::Decision));
    }

    #[test]
    fn recall_importance_order_is_lexicographic() {
        // The stored strings sort "normal" > "low" > "high". Pinned: callers
        // rely on this exact order.
        let (repo, room, _) = setup();
        for (content, importance) in [
            ("high one", MemoryImportance::High),
            ("low one", MemoryImportance::Low),
            ("normal one", MemoryImportance::Normal),
        ] {
            repo.add(&room, MemoryType::Note, content, &[], importance, None, None)
                .unwrap();
        }

        let results = repo.recall(&room, &RecallFilter::default()).unwrap();
        let order: Vec<&str> = results.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["normal one", "low one", "high one"]);
    }

    #[test]
    fn recall_records_access() {
        let (repo, room, _) = setup();
        let mem = add_simple(&repo, &room, "count me");

        let results = repo.recall(&room, &RecallFilter::default()).unwrap();
        assert_eq!(results[0].access_count, 1);

        repo.recall(&room, &RecallFilter::default()).unwrap();
        let fetched = repo.get(&room, &mem.id).unwrap().unwrap();
        assert_eq!(fetched.access_count, 2);
    }

    #[test]
    fn search_substring_case_insensitive() {
        let (repo, room, _) = setup();
        add_simple(&repo, &room, "Use Tokio for async work");
        add_simple(&repo, &room, "unrelated");

        let results = repo.search(&room, "tokio", None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("Tokio"));
    }

    #[test]
    fn search_escapes_like_metacharacters() {
        let (repo, room, _) = setup();
        add_simple(&repo, &room, "File with % in name");
        add_simple(&repo, &room, "File with _ in name");
        add_simple(&repo, &room, "File with \\ in path");

        let percent = repo.search(&room, "%", None).unwrap();
        assert_eq!(percent.len(), 1);
        assert!(percent[0].content.contains('%'));

        let underscore = repo.search(&room, "_", None).unwrap();
        assert_eq!(underscore.len(), 1);
        assert!(underscore[0].content.contains('_'));

        let backslash = repo.search(&room, "\\", None).unwrap();
        assert_eq!(backslash.len(), 1);
        assert!(backslash[0].content.contains('\\'));
    }

    #[test]
    fn search_scoped_to_room() {
        let (repo, room, other) = setup();
        add_simple(&repo, &room, "findable text");
        assert!(repo.search(&other, "findable", None).unwrap().is_empty());
    }

    #[test]
    fn search_records_access() {
        let (repo, room, _) = setup();
        let mem = add_simple(&repo, &room, "searched often");
        repo.search(&room, "searched", None).unwrap();
        repo.search(&room, "searched", None).unwrap();
        let fetched = repo.get(&room, &mem.id).unwrap().unwrap();
        assert_eq!(fetched.access_count, 2);
    }

    #[test]
    fn record_access_updates_timestamp() {
        let (repo, room, _) = setup();
        let mem = add_simple(&repo, &room, "x");
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.record_access(&mem.id).unwrap();
        let fetched = repo.get(&room, &mem.id).unwrap().unwrap();
        assert_eq!(fetched.access_count, 1);
        assert!(fetched.last_accessed_at >= mem.last_accessed_at);
    }

    #[test]
    fn count_and_list() {
        let (repo, room, other) = setup();
        add_simple(&repo, &room, "a");
        repo.add(
            &room,
            MemoryType::Preference,
            "b",
            &[],
            MemoryImportance::High,
            None,
            None,
        )
        .unwrap();

        assert_eq!(repo.count(&room).unwrap(), 2);
        assert_eq!(repo.count(&other).unwrap(), 0);

        let all = repo.list(&room, None).unwrap();
        assert_eq!(all.len(), 2);
        let prefs = repo.list(&room, Some(MemoryType::Preference)).unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].content, "b");
    }

    #[test]
    fn memory_type_roundtrip() {
        for t in [
            MemoryType::Conversation,
            MemoryType::TaskResult,
            MemoryType::Preference,
            MemoryType::Pattern,
            MemoryType::Note,
            MemoryType::Decision,
            MemoryType::Error,
            MemoryType::Success,
        ] {
            let parsed: MemoryType = t.to_string().parse().unwrap();
            assert_eq!(t, parsed);
        }
    }
}
