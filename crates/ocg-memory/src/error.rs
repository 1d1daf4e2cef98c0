use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("embedding service error: {0}")]
    Embedding(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("index error: {0}")]
    Index(String),

    #[error("memory not found: {id}")]
    NotFound { id: i64 },

    #[error("index snapshot error: {0}")]
    Snapshot(String),
}

impl From<MemoryError> for ocg_core::AgentError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::NotFound { id } => ocg_core::AgentError::NotFound(format!("memory {id}")),
            MemoryError::Database(err) => ocg_core::AgentError::Store(err.to_string()),
            MemoryError::Embedding(msg) => ocg_core::AgentError::Provider(msg),
            other => ocg_core::AgentError::Index(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
