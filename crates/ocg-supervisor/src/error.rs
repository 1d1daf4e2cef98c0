use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("process not found: {id}")]
    NotFound { id: String },

    #[error("process has no stdin: {id}")]
    NoStdin { id: String },

    #[error("path escapes workdir jail: {path}")]
    JailEscape { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SupervisorError> for ocg_core::AgentError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::NotFound { id } => {
                ocg_core::AgentError::NotFound(format!("process {id}"))
            }
            other => ocg_core::AgentError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
