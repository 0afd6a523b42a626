use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Phase of an active turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    Initializing,
    Thinking,
    Streaming,
    Finalizing,
}

/// An unanswered tool permission prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub tool_use_id: String,
    pub questions: Vec<serde_json::Value>,
    pub asked_at: String,
}

/// Per-session processing state. The terminal states (`idle`,
/// `waiting_for_input`, `interrupted`) mean the session is not actively
/// producing output; they are legal resting points, not failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingState {
    Idle,
    #[serde(rename_all = "camelCase")]
    Queued {
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    Processing {
        message_id: MessageId,
        phase: ProcessingPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        streaming_started_at: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WaitingForInput {
        pending_question: PendingQuestion,
    },
    Interrupted,
}

impl ProcessingState {
    /// Whether this is a resting point: the session is not producing output.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::WaitingForInput { .. } | Self::Interrupted
        )
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued { .. } => "queued",
            Self::Processing { .. } => "processing",
            Self::WaitingForInput { .. } => "waiting_for_input",
            Self::Interrupted => "interrupted",
        }
    }
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_idle() {
        assert_eq!(ProcessingState::default(), ProcessingState::Idle);
    }

    #[test]
    fn terminal_classification() {
        assert!(ProcessingState::Idle.is_terminal());
        assert!(ProcessingState::Interrupted.is_terminal());
        assert!(ProcessingState::WaitingForInput {
            pending_question: PendingQuestion {
                tool_use_id: "toolu_1".into(),
                questions: vec![],
                asked_at: "2026-01-01T00:00:00Z".into(),
            },
        }
        .is_terminal());

        assert!(!ProcessingState::Queued {
            message_id: MessageId::new(),
        }
        .is_terminal());
        assert!(!ProcessingState::Processing {
            message_id: MessageId::new(),
            phase: ProcessingPhase::Streaming,
            streaming_started_at: None,
        }
        .is_terminal());
    }

    #[test]
    fn serde_tag_is_status_with_camel_case_data() {
        let state = ProcessingState::Processing {
            message_id: MessageId::from_raw("msg_1"),
            phase: ProcessingPhase::Thinking,
            streaming_started_at: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["phase"], "thinking");
        assert_eq!(json["messageId"], "msg_1");
        assert!(json.get("streamingStartedAt").is_none());

        let streaming = serde_json::to_value(ProcessingState::Processing {
            message_id: MessageId::from_raw("msg_1"),
            phase: ProcessingPhase::Streaming,
            streaming_started_at: Some("2026-01-01T00:00:01Z".into()),
        })
        .unwrap();
        assert_eq!(streaming["streamingStartedAt"], "2026-01-01T00:00:01Z");

        let queued = serde_json::to_value(ProcessingState::Queued {
            message_id: MessageId::from_raw("msg_2"),
        })
        .unwrap();
        assert_eq!(queued["status"], "queued");
        assert_eq!(queued["messageId"], "msg_2");

        let idle = serde_json::to_value(ProcessingState::Idle).unwrap();
        assert_eq!(idle["status"], "idle");

        let waiting = serde_json::to_value(ProcessingState::WaitingForInput {
            pending_question: PendingQuestion {
                tool_use_id: "toolu_2".into(),
                questions: vec![serde_json::json!({"question": "Allow?"})],
                asked_at: "2026-01-01T00:00:00Z".into(),
            },
        })
        .unwrap();
        assert_eq!(waiting["status"], "waiting_for_input");
        assert_eq!(waiting["pendingQuestion"]["toolUseId"], "toolu_2");
    }

    #[test]
    fn serde_roundtrip() {
        let states = vec![
            ProcessingState::Idle,
            ProcessingState::Queued {
                message_id: MessageId::new(),
            },
            ProcessingState::Processing {
                message_id: MessageId::new(),
                phase: ProcessingPhase::Streaming,
                streaming_started_at: Some("2026-01-01T00:00:01Z".into()),
            },
            ProcessingState::Interrupted,
        ];
        for state in &states {
            let json = serde_json::to_string(state).unwrap();
            let parsed: ProcessingState = serde_json::from_str(&json).unwrap();
            assert_eq!(state, &parsed);
        }
    }

    #[test]
    fn status_strings() {
        assert_eq!(ProcessingState::Idle.status_str(), "idle");
        assert_eq!(ProcessingState::Interrupted.status_str(), "interrupted");
        assert_eq!(
            ProcessingState::Queued { message_id: MessageId::new() }.status_str(),
            "queued"
        );
    }
}
