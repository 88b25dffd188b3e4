use thiserror::Error;

/// Errors surfaced by the engine, the stores and the scheduler implementations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lookup by id or name found nothing.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Another `try_run` of the same job is in flight.
    #[error("Job {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// A job, workflow or task definition breaks an invariant.
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The primary scheduler answered with a non-success status.
    #[error("Remote scheduler error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine context was dropped while a scheduler still referenced it.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        EngineError::NotFound { kind, key: key.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
