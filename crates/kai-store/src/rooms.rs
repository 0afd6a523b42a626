use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use kai_core::ids::{GoalId, PairId, RoomId, SessionId, TaskId};

use crate::database::Database;
use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRow {
    pub id: RoomId,
    pub name: String,
    pub allowed_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_path: Option<String>,
    pub created_at: String,
}

pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        name: &str,
        allowed_paths: &[String],
        default_path: Option<&str>,
    ) -> Result<RoomRow, StoreError> {
        let id = RoomId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, name, allowed_paths, default_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    name,
                    serde_json::to_string(allowed_paths)?,
                    default_path,
                    now,
                ],
            )?;
            Ok(RoomRow {
                id,
                name: name.to_string(),
                allowed_paths: allowed_paths.to_vec(),
                default_path: default_path.map(str::to_string),
                created_at: now,
            })
        })
    }

    pub fn get(&self, id: &RoomId) -> Result<RoomRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, allowed_paths, default_path, created_at FROM rooms WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_room(row),
                None => Err(StoreError::NotFound(format!("room {id}"))),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<RoomRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, allowed_paths, default_path, created_at
                 FROM rooms ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_room(row)?);
            }
            Ok(results)
        })
    }

    /// Delete a room and everything bound to it.
    #[instrument(skip(self), fields(room_id = %id))]
    pub fn delete(&self, id: &RoomId) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM memories WHERE room_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM tasks WHERE room_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM goals WHERE room_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM session_pairs WHERE room_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM room_agent_states WHERE room_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM rooms WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> Result<RoomRow, StoreError> {
    let paths_str: String = row.get(2)?;
    Ok(RoomRow {
        id: RoomId::from_raw(row.get::<_, String>(0)?),
        name: row.get(1)?,
        allowed_paths: serde_json::from_str(&paths_str)?,
        default_path: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Session pairs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Active,
    Idle,
    Crashed,
    Completed,
}

impl std::fmt::Display for PairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Crashed => write!(f, "crashed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for PairStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "crashed" => Ok(Self::Crashed),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown pair status: {other}")),
        }
    }
}

/// A worker/manager session pair bound to one room.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPairRow {
    pub id: PairId,
    pub room_id: RoomId,
    pub room_session_id: SessionId,
    pub manager_session_id: SessionId,
    pub worker_session_id: SessionId,
    pub status: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct PairRepo {
    db: Database,
}

impl PairRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        room_id: &RoomId,
        room_session_id: &SessionId,
        manager_session_id: &SessionId,
        worker_session_id: &SessionId,
    ) -> Result<SessionPairRow, StoreError> {
        let id = PairId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_pairs
                   (id, room_id, room_session_id, manager_session_id, worker_session_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    room_id.as_str(),
                    room_session_id.as_str(),
                    manager_session_id.as_str(),
                    worker_session_id.as_str(),
                    now,
                    now,
                ],
            )?;
            Ok(SessionPairRow {
                id,
                room_id: room_id.clone(),
                room_session_id: room_session_id.clone(),
                manager_session_id: manager_session_id.clone(),
                worker_session_id: worker_session_id.clone(),
                status: PairStatus::Active,
                current_task_id: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    pub fn get(&self, id: &PairId) -> Result<SessionPairRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PAIR_COLS} FROM session_pairs WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_pair(row),
                None => Err(StoreError::NotFound(format!("pair {id}"))),
            }
        })
    }

    pub fn list_for_room(
        &self,
        room_id: &RoomId,
        status: Option<PairStatus>,
    ) -> Result<Vec<SessionPairRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {PAIR_COLS} FROM session_pairs
                         WHERE room_id = ?1 AND status = ?2 ORDER BY created_at ASC"
                    ))?;
                    let mut rows =
                        stmt.query(rusqlite::params![room_id.as_str(), s.to_string()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_pair(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {PAIR_COLS} FROM session_pairs
                         WHERE room_id = ?1 ORDER BY created_at ASC"
                    ))?;
                    let mut rows = stmt.query([room_id.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_pair(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    pub fn update_status(&self, id: &PairId, status: PairStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE session_pairs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("pair {id}")));
            }
            Ok(())
        })
    }

    pub fn set_current_task(
        &self,
        id: &PairId,
        task_id: Option<&TaskId>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE session_pairs SET current_task_id = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![task_id.map(|t| t.as_str().to_string()), now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("pair {id}")));
            }
            Ok(())
        })
    }
}

const PAIR_COLS: &str = "id, room_id, room_session_id, manager_session_id, worker_session_id, status, current_task_id, created_at, updated_at";

fn row_to_pair(row: &rusqlite::Row<'_>) -> Result<SessionPairRow, StoreError> {
    let status_str: String = row.get(5)?;
    Ok(SessionPairRow {
        id: PairId::from_raw(row.get::<_, String>(0)?),
        room_id: RoomId::from_raw(row.get::<_, String>(1)?),
        room_session_id: SessionId::from_raw(row.get::<_, String>(2)?),
        manager_session_id: SessionId::from_raw(row.get::<_, String>(3)?),
        worker_session_id: SessionId::from_raw(row.get::<_, String>(4)?),
        status: status_str
            .parse()
            .map_err(|detail| StoreError::CorruptRow {
                table: "session_pairs",
                column: "status",
                detail,
            })?,
        current_task_id: row.get::<_, Option<String>>(6)?.map(TaskId::from_raw),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Room agent state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomLifecycleState {
    Idle,
    Planning,
    Executing,
    Waiting,
    Reviewing,
    Error,
    Paused,
}

impl std::fmt::Display for RoomLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Waiting => "waiting",
            Self::Reviewing => "reviewing",
            Self::Error => "error",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RoomLifecycleState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "waiting" => Ok(Self::Waiting),
            "reviewing" => Ok(Self::Reviewing),
            "error" => Ok(Self::Error),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

/// One row per room; written atomically on every agent transition so a new
/// in-process instance restores the exact state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAgentStateRow {
    pub room_id: RoomId,
    pub lifecycle_state: RoomLifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_goal_id: Option<GoalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    pub active_session_pair_ids: Vec<PairId>,
    pub last_activity_at: String,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub pending_actions: Vec<serde_json::Value>,
}

impl RoomAgentStateRow {
    pub fn initial(room_id: RoomId) -> Self {
        Self {
            room_id,
            lifecycle_state: RoomLifecycleState::Idle,
            current_goal_id: None,
            current_task_id: None,
            active_session_pair_ids: Vec::new(),
            last_activity_at: Utc::now().to_rfc3339(),
            error_count: 0,
            last_error: None,
            pending_actions: Vec::new(),
        }
    }
}

pub struct RoomAgentStateRepo {
    db: Database,
}

impl RoomAgentStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load the state row, creating the initial `idle` row if absent.
    pub fn get_or_create(&self, room_id: &RoomId) -> Result<RoomAgentStateRow, StoreError> {
        if let Some(existing) = self.get(room_id)? {
            return Ok(existing);
        }
        let state = RoomAgentStateRow::initial(room_id.clone());
        self.save(&state)?;
        Ok(state)
    }

    pub fn get(&self, room_id: &RoomId) -> Result<Option<RoomAgentStateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id, lifecycle_state, current_goal_id, current_task_id,
                        active_session_pair_ids, last_activity_at, error_count, last_error, pending_actions
                 FROM room_agent_states WHERE room_id = ?1",
            )?;
            let mut rows = stmt.query([room_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_agent_state(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Upsert the whole row in one statement.
    pub fn save(&self, state: &RoomAgentStateRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_agent_states
                   (room_id, lifecycle_state, current_goal_id, current_task_id,
                    active_session_pair_ids, last_activity_at, error_count, last_error, pending_actions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(room_id) DO UPDATE SET
                    lifecycle_state = excluded.lifecycle_state,
                    current_goal_id = excluded.current_goal_id,
                    current_task_id = excluded.current_task_id,
                    active_session_pair_ids = excluded.active_session_pair_ids,
                    last_activity_at = excluded.last_activity_at,
                    error_count = excluded.error_count,
                    last_error = excluded.last_error,
                    pending_actions = excluded.pending_actions",
                rusqlite::params![
                    state.room_id.as_str(),
                    state.lifecycle_state.to_string(),
                    state.current_goal_id.as_ref().map(|g| g.as_str().to_string()),
                    state.current_task_id.as_ref().map(|t| t.as_str().to_string()),
                    serde_json::to_string(&state.active_session_pair_ids)?,
                    state.last_activity_at,
                    state.error_count,
                    state.last_error,
                    serde_json::to_string(&state.pending_actions)?,
                ],
            )?;
            Ok(())
        })
    }
}

fn row_to_agent_state(row: &rusqlite::Row<'_>) -> Result<RoomAgentStateRow, StoreError> {
    let state_str: String = row.get(1)?;
    let pair_ids_str: String = row.get(4)?;
    let pending_str: String = row.get(8)?;
    Ok(RoomAgentStateRow {
        room_id: RoomId::from_raw(row.get::<_, String>(0)?),
        lifecycle_state: state_str
            .parse()
            .map_err(|detail| StoreError::CorruptRow {
                table: "room_agent_states",
                column: "lifecycle_state",
                detail,
            })?,
        current_goal_id: row.get::<_, Option<String>>(2)?.map(GoalId::from_raw),
        current_task_id: row.get::<_, Option<String>>(3)?.map(TaskId::from_raw),
        active_session_pair_ids: serde_json::from_str(&pair_ids_str)?,
        last_activity_at: row.get(5)?,
        error_count: row.get(6)?,
        last_error: row.get(7)?,
        pending_actions: serde_json::from_str(&pending_str)?,
    })
}

// ---------------------------------------------------------------------------
// Goals & tasks
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalRow {
    pub id: GoalId,
    pub room_id: RoomId,
    pub description: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct GoalRepo {
    db: Database,
}

impl GoalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, room_id: &RoomId, description: &str) -> Result<GoalRow, StoreError> {
        let id = GoalId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO goals (id, room_id, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'open', ?4, ?5)",
                rusqlite::params![id.as_str(), room_id.as_str(), description, now, now],
            )?;
            Ok(GoalRow {
                id,
                room_id: room_id.clone(),
                description: description.to_string(),
                status: "open".to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    pub fn list_for_room(&self, room_id: &RoomId) -> Result<Vec<GoalRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, description, status, created_at, updated_at
                 FROM goals WHERE room_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([room_id.as_str()], |row| {
                    Ok(GoalRow {
                        id: GoalId::from_raw(row.get::<_, String>(0)?),
                        room_id: RoomId::from_raw(row.get::<_, String>(1)?),
                        description: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn update_status(&self, id: &GoalId, status: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE goals SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("goal {id}")));
            }
            Ok(())
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: TaskId,
    pub room_id: RoomId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<GoalId>,
    pub description: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        room_id: &RoomId,
        goal_id: Option<&GoalId>,
        description: &str,
    ) -> Result<TaskRow, StoreError> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, room_id, goal_id, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    room_id.as_str(),
                    goal_id.map(|g| g.as_str().to_string()),
                    description,
                    now,
                    now,
                ],
            )?;
            Ok(TaskRow {
                id,
                room_id: room_id.clone(),
                goal_id: goal_id.cloned(),
                description: description.to_string(),
                status: "pending".to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    pub fn get(&self, id: &TaskId) -> Result<TaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, goal_id, description, status, created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(TaskRow {
                    id: TaskId::from_raw(row.get::<_, String>(0)?),
                    room_id: RoomId::from_raw(row.get::<_, String>(1)?),
                    goal_id: row.get::<_, Option<String>>(2)?.map(GoalId::from_raw),
                    description: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                }),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    pub fn update_status(&self, id: &TaskId, status: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("task {id}")));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, RoomRow) {
        let db = Database::in_memory().unwrap();
        let room = RoomRepo::new(db.clone())
            .create("dev room", &["/w".to_string()], Some("/w"))
            .unwrap();
        (db, room)
    }

    fn pair_fixture(db: &Database, room: &RoomRow) -> SessionPairRow {
        PairRepo::new(db.clone())
            .create(&room.id, &SessionId::new(), &SessionId::new(), &SessionId::new())
            .unwrap()
    }

    #[test]
    fn create_and_get_room() {
        let (db, room) = setup();
        let repo = RoomRepo::new(db);
        let fetched = repo.get(&room.id).unwrap();
        assert_eq!(fetched.name, "dev room");
        assert_eq!(fetched.allowed_paths, vec!["/w"]);
        assert_eq!(fetched.default_path.as_deref(), Some("/w"));
    }

    #[test]
    fn get_missing_room_fails() {
        let (db, _) = setup();
        let repo = RoomRepo::new(db);
        assert!(repo.get(&RoomId::new()).is_err());
    }

    #[test]
    fn pair_lifecycle() {
        let (db, room) = setup();
        let repo = PairRepo::new(db.clone());
        let pair = pair_fixture(&db, &room);
        assert_eq!(pair.status, PairStatus::Active);

        repo.update_status(&pair.id, PairStatus::Completed).unwrap();
        let fetched = repo.get(&pair.id).unwrap();
        assert_eq!(fetched.status, PairStatus::Completed);
    }

    #[test]
    fn list_pairs_filtered_by_status() {
        let (db, room) = setup();
        let repo = PairRepo::new(db.clone());
        let a = pair_fixture(&db, &room);
        pair_fixture(&db, &room);
        repo.update_status(&a.id, PairStatus::Crashed).unwrap();

        let active = repo.list_for_room(&room.id, Some(PairStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        let crashed = repo.list_for_room(&room.id, Some(PairStatus::Crashed)).unwrap();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].id, a.id);
        let all = repo.list_for_room(&room.id, None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn pair_current_task() {
        let (db, room) = setup();
        let repo = PairRepo::new(db.clone());
        let pair = pair_fixture(&db, &room);
        let task = TaskRepo::new(db).create(&room.id, None, "do it").unwrap();

        repo.set_current_task(&pair.id, Some(&task.id)).unwrap();
        assert_eq!(repo.get(&pair.id).unwrap().current_task_id.unwrap(), task.id);

        repo.set_current_task(&pair.id, None).unwrap();
        assert!(repo.get(&pair.id).unwrap().current_task_id.is_none());
    }

    #[test]
    fn agent_state_initializes_idle() {
        let (db, room) = setup();
        let repo = RoomAgentStateRepo::new(db);
        let state = repo.get_or_create(&room.id).unwrap();
        assert_eq!(state.lifecycle_state, RoomLifecycleState::Idle);
        assert!(state.active_session_pair_ids.is_empty());
        assert_eq!(state.error_count, 0);
    }

    #[test]
    fn agent_state_save_restores_exactly() {
        let (db, room) = setup();
        let repo = RoomAgentStateRepo::new(db.clone());
        let pair = pair_fixture(&db, &room);

        let mut state = repo.get_or_create(&room.id).unwrap();
        state.lifecycle_state = RoomLifecycleState::Executing;
        state.active_session_pair_ids = vec![pair.id.clone()];
        state.error_count = 2;
        state.last_error = Some("spawn failed".into());
        repo.save(&state).unwrap();

        // A fresh repo sees the exact state
        let restored = RoomAgentStateRepo::new(db).get(&room.id).unwrap().unwrap();
        assert_eq!(restored.lifecycle_state, RoomLifecycleState::Executing);
        assert_eq!(restored.active_session_pair_ids, vec![pair.id]);
        assert_eq!(restored.error_count, 2);
        assert_eq!(restored.last_error.as_deref(), Some("spawn failed"));
    }

    #[test]
    fn agent_state_one_row_per_room() {
        let (db, room) = setup();
        let repo = RoomAgentStateRepo::new(db.clone());
        let mut state = repo.get_or_create(&room.id).unwrap();
        state.lifecycle_state = RoomLifecycleState::Paused;
        repo.save(&state).unwrap();
        state.lifecycle_state = RoomLifecycleState::Planning;
        repo.save(&state).unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM room_agent_states", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            repo.get(&room.id).unwrap().unwrap().lifecycle_state,
            RoomLifecycleState::Planning
        );
    }

    #[test]
    fn goals_and_tasks() {
        let (db, room) = setup();
        let goals = GoalRepo::new(db.clone());
        let tasks = TaskRepo::new(db);

        let goal = goals.create(&room.id, "ship the feature").unwrap();
        assert_eq!(goal.status, "open");
        let listed = goals.list_for_room(&room.id).unwrap();
        assert_eq!(listed.len(), 1);

        let task = tasks.create(&room.id, Some(&goal.id), "write tests").unwrap();
        assert_eq!(task.status, "pending");
        tasks.update_status(&task.id, "completed").unwrap();
        assert_eq!(tasks.get(&task.id).unwrap().status, "completed");

        goals.update_status(&goal.id, "done").unwrap();
    }

    #[test]
    fn room_delete_cascades() {
        let (db, room) = setup();
        pair_fixture(&db, &room);
        RoomAgentStateRepo::new(db.clone()).get_or_create(&room.id).unwrap();
        GoalRepo::new(db.clone()).create(&room.id, "g").unwrap();
        TaskRepo::new(db.clone()).create(&room.id, None, "t").unwrap();

        RoomRepo::new(db.clone()).delete(&room.id).unwrap();

        let counts: Vec<i64> = ["rooms", "session_pairs", "room_agent_states", "goals", "tasks"]
            .iter()
            .map(|table| {
                db.with_conn(|conn| {
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                        .map_err(StoreError::from)
                })
                .unwrap()
            })
            .collect();
        assert_eq!(counts, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn lifecycle_state_roundtrip() {
        for state in [
            RoomLifecycleState::Idle,
            RoomLifecycleState::Planning,
            RoomLifecycleState::Executing,
            RoomLifecycleState::Waiting,
            RoomLifecycleState::Reviewing,
            RoomLifecycleState::Error,
            RoomLifecycleState::Paused,
        ] {
            let parsed: RoomLifecycleState = state.to_string().parse().unwrap();
            assert_eq!(state, parsed);
        }
    }
}
