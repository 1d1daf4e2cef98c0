use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("session not found: {key}")]
    NotFound { key: String },

    #[error("duplicate tool call id: {id}")]
    DuplicateToolCall { id: String },

    #[error("task not found: {id}")]
    TaskNotFound { id: String },
}

impl From<SessionError> for ocg_core::AgentError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound { key } => {
                ocg_core::AgentError::NotFound(format!("session {key}"))
            }
            SessionError::TaskNotFound { id } => {
                ocg_core::AgentError::NotFound(format!("task {id}"))
            }
            other => ocg_core::AgentError::Store(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
