use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ocg_core::Role;

use crate::stream::StreamEvent;

/// A single message as seen by providers. Tool results carry their
/// `tool_call_id`; assistant messages may carry requested `tool_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from an LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tools to expose to the LLM. Empty means no tool use.
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    /// Tool calls requested by the LLM. Empty when no tools are called.
    pub tool_calls: Vec<ToolCall>,
}

/// What a provider can do. The executor checks these before dispatching.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Capabilities {
    pub chat: bool,
    pub streaming: bool,
    pub embeddings: bool,
    pub realtime: bool,
}

/// Common interface for all LLM providers. The core never sees a vendor
/// wire format — only this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logging, health tracking, and error messages.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Send a non-streaming chat request, wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming chat, emits TextDelta + Done.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.chat(req).await?;
        let _ = tx
            .send(StreamEvent::TextDelta {
                text: resp.content.clone(),
            })
            .await;
        for call in &resp.tool_calls {
            let _ = tx.send(StreamEvent::ToolUse(call.clone())).await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<ProviderError> for ocg_core::AgentError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Cancelled => ocg_core::AgentError::Cancelled,
            other => ocg_core::AgentError::Provider(other.to_string()),
        }
    }
}
