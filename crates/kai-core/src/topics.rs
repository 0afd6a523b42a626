//! Channel names and event topics shared by the hub's publishers and
//! subscribers.

use crate::ids::SessionId;

/// The always-present broadcast channel.
pub const GLOBAL_CHANNEL: &str = "global";

/// Per-session channel name: `session:{id}`.
pub fn session_channel(id: &SessionId) -> String {
    format!("session:{id}")
}

// ── Session lifecycle topics ──
pub const SESSION_UPDATED: &str = "session.updated";
pub const SESSION_DELETED: &str = "session.deleted";
pub const SESSION_MODEL_SWITCHING: &str = "session.model-switching";
pub const SESSION_MODEL_SWITCHED: &str = "session.model-switched";
pub const SESSION_ERROR: &str = "session.error";
pub const AGENT_RESET: &str = "agent.reset";

// ── Rewind topics ──
pub const REWIND_STARTED: &str = "rewind.started";
pub const REWIND_COMPLETED: &str = "rewind.completed";
pub const REWIND_FAILED: &str = "rewind.failed";

// ── Bridge / room topics ──
pub const BRIDGE_WORKER_TERMINAL: &str = "bridge.workerTerminal";
pub const BRIDGE_MANAGER_TERMINAL: &str = "bridge.managerTerminal";
pub const BRIDGE_MESSAGES_FORWARDED: &str = "bridge.messagesForwarded";
pub const ROOM_AGENT_STATE_CHANGED: &str = "roomAgent.stateChanged";
pub const ROOM_MESSAGE: &str = "room.message";
pub const PAIR_TASK_COMPLETED: &str = "pair.task_completed";

// ── State channels ──
pub const STATE_SESSION: &str = "state.session";
pub const STATE_SDK_MESSAGES_DELTA: &str = "state.sdkMessages.delta";
pub const GLOBAL_SESSIONS_DELTA: &str = "global.sessions.delta";

// ── Internal bus topics ──
pub const MESSAGE_SEND_REQUEST: &str = "message.sendRequest";
pub const MESSAGE_PERSISTED: &str = "message.persisted";
pub const AGENT_INTERRUPT_REQUEST: &str = "agent.interruptRequest";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_channel_format() {
        let id = SessionId::from_raw("sess_abc");
        assert_eq!(session_channel(&id), "session:sess_abc");
    }
}
