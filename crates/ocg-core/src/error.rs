use thiserror::Error;

/// Top-level error surfaced at the RPC boundary and by the turn executor.
///
/// Subsystem crates define their own error enums and convert into this type
/// at the point where a failure becomes caller-visible.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("context overflow: {0}")]
    Context(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool budget exceeded: {used} calls (budget {budget})")]
    ToolBudget { used: u32, budget: u32 },

    #[error("tool loop detected: {tool} called {count} times with identical arguments")]
    ToolLoop { tool: String, count: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("capability not supported: {0}")]
    Capability(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short error code string sent to RPC clients in response frames.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Context(_) => "CONTEXT_OVERFLOW",
            AgentError::Provider(_) => "PROVIDER_ERROR",
            AgentError::ToolBudget { .. } => "TOOL_BUDGET",
            AgentError::ToolLoop { .. } => "TOOL_LOOP",
            AgentError::Cancelled => "CANCELLED",
            AgentError::Store(_) => "STORE_ERROR",
            AgentError::Index(_) => "INDEX_ERROR",
            AgentError::Config(_) => "CONFIG_ERROR",
            AgentError::Capability(_) => "CAPABILITY",
            AgentError::NotFound(_) => "NOT_FOUND",
            AgentError::Timeout { .. } => "TIMEOUT",
            AgentError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// A short hint for the client on how to proceed, included in error frames.
    pub fn hint(&self) -> &'static str {
        match self {
            AgentError::Context(_) => "reset the session or shorten the message",
            AgentError::Provider(_) => "retry later or switch provider",
            AgentError::ToolBudget { .. } => "the turn used too many tool calls",
            AgentError::ToolLoop { .. } => "the model repeated an identical tool call",
            AgentError::Cancelled => "the caller aborted the request",
            AgentError::Store(_) | AgentError::Index(_) => "check the daemon logs",
            AgentError::Config(_) => "fix the configuration and restart",
            AgentError::Capability(_) => "the selected provider lacks this capability",
            AgentError::NotFound(_) => "check the identifier",
            AgentError::Timeout { .. } => "the call exceeded its deadline",
            AgentError::Internal(_) => "check the daemon logs",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AgentError::Context("x".into()).code(), "CONTEXT_OVERFLOW");
        assert_eq!(
            AgentError::ToolBudget { used: 17, budget: 16 }.code(),
            "TOOL_BUDGET"
        );
        assert_eq!(AgentError::Cancelled.code(), "CANCELLED");
    }
}
