use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    #[error("pulse event not found: {id}")]
    EventNotFound { id: String },

    #[error("cron job not found: {id}")]
    JobNotFound { id: String },

    #[error("no handler registered for kind: {kind}")]
    NoHandler { kind: String },
}

impl From<SchedulerError> for ocg_core::AgentError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidExpression(msg) => ocg_core::AgentError::Config(msg),
            SchedulerError::EventNotFound { id } => {
                ocg_core::AgentError::NotFound(format!("pulse event {id}"))
            }
            SchedulerError::JobNotFound { id } => {
                ocg_core::AgentError::NotFound(format!("cron job {id}"))
            }
            other => ocg_core::AgentError::Store(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
