use thiserror::Error;

/// Core error type for ratchet operations.
#[derive(Error, Debug)]
pub enum RatchetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Workflow '{0}' does not exist")]
    WorkflowUnknown(String),

    #[error("Workflow '{0}' has been removed and cannot be started or resumed")]
    WorkflowGone(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Form validation failed: {0}")]
    FormInvalid(String),

    #[error("Invalid process status: {0}")]
    BadStatus(String),

    #[error("Invalid callback token")]
    TokenMismatch,

    #[error("Process is not a task")]
    NotTask,

    #[error("Invalid range: {0}")]
    RangeInvalid(String),

    #[error("Invalid filter: {0}")]
    FilterInvalid(String),

    #[error("Engine is locked and cannot accept changes on processes at this time")]
    EngineLocked,

    #[error("Another request to resume all processes is in progress")]
    ResumeAllInProgress,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Lock backend error: {0}")]
    LockBackend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RatchetError {
    fn from(e: serde_json::Error) -> Self {
        RatchetError::Serialization(e.to_string())
    }
}

/// Result type alias using RatchetError.
pub type Result<T> = std::result::Result<T, RatchetError>;
