/// SQL DDL for the kai session store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT,
    workspace_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    config TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sdk_messages (
    uuid TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    seq INTEGER NOT NULL,
    type TEXT NOT NULL,
    parent_tool_use_id TEXT,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (session_id, uuid)
);

CREATE TABLE IF NOT EXISTS user_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    content TEXT NOT NULL,
    images TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    message_preview TEXT NOT NULL,
    turn_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    UNIQUE (session_id, turn_number)
);

CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    allowed_paths TEXT NOT NULL,
    default_path TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_pairs (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES rooms(id),
    room_session_id TEXT NOT NULL,
    manager_session_id TEXT NOT NULL,
    worker_session_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    current_task_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_agent_states (
    room_id TEXT PRIMARY KEY REFERENCES rooms(id),
    lifecycle_state TEXT NOT NULL DEFAULT 'idle',
    current_goal_id TEXT,
    current_task_id TEXT,
    active_session_pair_ids TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    pending_actions TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS goals (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES rooms(id),
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES rooms(id),
    goal_id TEXT,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES rooms(id),
    type TEXT NOT NULL,
    content TEXT NOT NULL,
    tags TEXT NOT NULL,
    importance TEXT NOT NULL DEFAULT 'normal',
    session_id TEXT,
    task_id TEXT,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active_at);
CREATE INDEX IF NOT EXISTS idx_sdk_messages_session ON sdk_messages(session_id, timestamp, seq);
CREATE INDEX IF NOT EXISTS idx_user_messages_session ON user_messages(session_id, status);
CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id, turn_number);
CREATE INDEX IF NOT EXISTS idx_pairs_room ON session_pairs(room_id, status);
CREATE INDEX IF NOT EXISTS idx_memories_room ON memories(room_id, type);
CREATE INDEX IF NOT EXISTS idx_tasks_room ON tasks(room_id, status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
