use kai_core::ids::{PairId, RoomId, SessionId, TaskId};
use kai_store::rooms::{PairRepo, PairStatus, SessionPairRow};
use kai_store::{Database, StoreError};

/// Pair bookkeeping shared between the room agent (writer) and the bridge
/// (reader). Everything is id-based; nobody holds live references to the
/// sessions in a pair.
pub struct PairManager {
    db: Database,
}

impl PairManager {
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
        PairRepo::new(self.db.clone()).create(
            room_id,
            room_session_id,
            manager_session_id,
            worker_session_id,
        )
    }

    pub fn get(&self, pair_id: &PairId) -> Result<SessionPairRow, StoreError> {
        PairRepo::new(self.db.clone()).get(pair_id)
    }

    pub fn active_pairs(&self, room_id: &RoomId) -> Result<Vec<SessionPairRow>, StoreError> {
        PairRepo::new(self.db.clone()).list_for_room(room_id, Some(PairStatus::Active))
    }

    pub fn assign_task(&self, pair_id: &PairId, task_id: &TaskId) -> Result<(), StoreError> {
        PairRepo::new(self.db.clone()).set_current_task(pair_id, Some(task_id))
    }

    /// Mark a pair finished: clears the task and sets `completed`.
    pub fn complete(&self, pair_id: &PairId) -> Result<(), StoreError> {
        let repo = PairRepo::new(self.db.clone());
        repo.set_current_task(pair_id, None)?;
        repo.update_status(pair_id, PairStatus::Completed)
    }

    /// Mark a pair crashed (worker unrecoverable).
    pub fn crash(&self, pair_id: &PairId) -> Result<(), StoreError> {
        PairRepo::new(self.db.clone()).update_status(pair_id, PairStatus::Crashed)
    }
}
