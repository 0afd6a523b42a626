/// Errors surfaced through the hub's request/reply path. Command handlers
/// generally fold failures into `{success:false, error}` payloads instead;
/// these variants are for read handlers and routing failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HubError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Provider(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl HubError {
    /// Wire error code for the RPC layer.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MethodNotFound(_) => "METHOD_NOT_FOUND",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "INVALID_PARAMS",
            Self::Precondition(_) => "PRECONDITION_FAILED",
            Self::Provider(_) => "PROVIDER_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
