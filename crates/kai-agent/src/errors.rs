use serde_json::json;
use std::sync::Arc;

use kai_core::ids::SessionId;
use kai_core::query::TransportError;
use kai_core::timeout::TimeoutError;
use kai_core::topics;
use kai_hub::MessageHub;
use kai_store::sessions::SessionRepo;
use kai_store::{Database, StoreError};

/// Retries are attempted while the per-session retry count stays below this.
const MAX_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("Session is archived")]
    SessionArchived,

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("{0}")]
    Provider(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AgentError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            Self::SessionNotFound
        } else {
            Self::Store(err)
        }
    }
}

/// What the caller should do with a reported error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Below the retry threshold: eligible for query recovery.
    Retry,
    /// Threshold reached: surface to the user, do not retry.
    Escalate,
}

/// Routes errors to the session channel and keeps the retry accounting in
/// session metadata.
pub struct ErrorManager {
    session_id: SessionId,
    db: Database,
    hub: Arc<MessageHub>,
}

impl ErrorManager {
    pub fn new(session_id: SessionId, db: Database, hub: Arc<MessageHub>) -> Self {
        Self {
            session_id,
            db,
            hub,
        }
    }

    /// Report an error: publish `session.error`, bump
    /// `recoveryContext.retryCount`, and decide retry vs escalate.
    pub fn report(&self, error: &str) -> RecoveryDecision {
        let repo = SessionRepo::new(self.db.clone());
        let retry_count = match repo.get(&self.session_id) {
            Ok(session) => {
                let mut metadata = session.metadata;
                metadata.recovery_context.retry_count += 1;
                metadata.recovery_context.last_error = Some(error.to_string());
                let count = metadata.recovery_context.retry_count;
                if let Err(e) = repo.update_metadata(&self.session_id, &metadata) {
                    tracing::error!(session_id = %self.session_id, error = %e, "failed to persist retry count");
                }
                count
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "failed to load session for error report");
                MAX_RETRIES
            }
        };

        self.hub.publish(
            topics::SESSION_ERROR,
            json!({
                "sessionId": self.session_id.to_string(),
                "error": error,
                "retryCount": retry_count,
            }),
            Some(&self.session_id),
        );

        if retry_count < MAX_RETRIES {
            RecoveryDecision::Retry
        } else {
            RecoveryDecision::Escalate
        }
    }

    /// Clear retry accounting after a healthy turn.
    pub fn reset(&self) {
        let repo = SessionRepo::new(self.db.clone());
        if let Ok(session) = repo.get(&self.session_id) {
            let mut metadata = session.metadata;
            metadata.recovery_context.retry_count = 0;
            metadata.recovery_context.last_error = None;
            let _ = repo.update_metadata(&self.session_id, &metadata);
        }
    }
}
