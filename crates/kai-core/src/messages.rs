use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};

/// Record kind emitted by the agent transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdkMessageType {
    User,
    Assistant,
    System,
    Result,
    ToolProgress,
    StreamEvent,
}

impl std::fmt::Display for SdkMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Result => "result",
            Self::ToolProgress => "tool_progress",
            Self::StreamEvent => "stream_event",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SdkMessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "result" => Ok(Self::Result),
            "tool_progress" => Ok(Self::ToolProgress),
            "stream_event" => Ok(Self::StreamEvent),
            other => Err(format!("unknown sdk message type: {other}")),
        }
    }
}

/// A single record from the transport's message stream.
/// `(uuid, session_id)` is unique; ordering within a session is by server
/// timestamp with insertion order breaking ties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkMessage {
    pub uuid: MessageId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub message_type: SdkMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    pub content: serde_json::Value,
    pub timestamp: String,
}

impl SdkMessage {
    pub fn new(
        session_id: SessionId,
        message_type: SdkMessageType,
        content: serde_json::Value,
    ) -> Self {
        Self {
            uuid: MessageId::new(),
            session_id,
            message_type,
            parent_tool_use_id: None,
            content,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn user_text(session_id: SessionId, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            SdkMessageType::User,
            serde_json::json!({
                "content": [{"type": "text", "text": text.into()}]
            }),
        )
    }

    pub fn assistant_text(session_id: SessionId, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            SdkMessageType::Assistant,
            serde_json::json!({
                "content": [{"type": "text", "text": text.into()}]
            }),
        )
    }

    pub fn result(session_id: SessionId, payload: serde_json::Value) -> Self {
        Self::new(session_id, SdkMessageType::Result, payload)
    }

    /// Concatenated text blocks of this message's content. Non-text blocks
    /// are skipped. Empty string when there is no text at all.
    pub fn text(&self) -> String {
        extract_text_blocks(&self.content)
    }
}

/// Concatenate the `text` fields of all `{"type":"text"}` blocks in a
/// content payload, joined with newlines.
pub fn extract_text_blocks(content: &serde_json::Value) -> String {
    let Some(blocks) = content.get("content").and_then(|c| c.as_array()) else {
        return String::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}
