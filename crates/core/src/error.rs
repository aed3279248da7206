use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Definition validation error: {0}")]
    Validation(String),

    #[error("Transient dispatch error: {0}")]
    TransientDispatch(String),

    #[error("Permanent dispatch error: {0}")]
    PermanentDispatch(String),

    #[error("Branch exhausted: {0}")]
    BranchExhausted(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the retry manager may re-attempt work that failed with this
    /// error. Everything else dead-letters on first failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientDispatch(_) | EngineError::ConcurrencyConflict(_)
        )
    }

    /// Short stable label for metrics and step-attempt records.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::TransientDispatch(_) => "transient_dispatch",
            EngineError::PermanentDispatch(_) => "permanent_dispatch",
            EngineError::BranchExhausted(_) => "branch_exhausted",
            EngineError::ConcurrencyConflict(_) => "concurrency_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::Serialization(_) => "serialization",
            EngineError::Internal(_) => "internal",
        }
    }
}
