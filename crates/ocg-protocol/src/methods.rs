//! Method names and typed parameter/payload shapes for the RPC surface.

use serde::{Deserialize, Serialize};

// chat
pub const CHAT_SEND: &str = "chat.send";
pub const CHAT_STREAM: &str = "chat.stream";
pub const CHAT_ABORT: &str = "chat.abort";

// sessions
pub const SESSIONS_LIST: &str = "sessions.list";
pub const SESSIONS_HISTORY: &str = "sessions.history";
pub const SESSIONS_RESET: &str = "sessions.reset";

// memory
pub const MEMORY_SEARCH: &str = "memory.search";
pub const MEMORY_GET: &str = "memory.get";
pub const MEMORY_STORE: &str = "memory.store";
pub const MEMORY_DELETE: &str = "memory.delete";

// pulse
pub const PULSE_ADD: &str = "pulse.add";
pub const PULSE_STATUS: &str = "pulse.status";

// stats & tasks
pub const STATS_GET: &str = "stats.get";
pub const TASKS_CREATE: &str = "tasks.create";
pub const TASKS_STATUS: &str = "tasks.status";

// realtime audio
pub const AUDIO_CHUNK: &str = "audio.chunk";
pub const AUDIO_END: &str = "audio.end";

// stream event names (interleaved between req and final res)
pub const EVENT_CHAT_DELTA: &str = "chat.delta";
pub const EVENT_CHAT_TOOL: &str = "chat.tool";
pub const EVENT_AUDIO_OUT: &str = "audio.out";
pub const EVENT_AUDIO_TEXT: &str = "audio.text";

/// A chat message as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    pub usage: Usage,
}

/// Payload of a `chat.delta` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPayload {
    pub text: String,
}

/// Payload of a `chat.tool` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEventPayload {
    pub tool: String,
    /// `started`, `finished`, or `failed`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortParams {
    /// The request id of the in-flight `chat.stream` call to cancel.
    pub call_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreParams {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchParams {
    pub query: String,
    #[serde(default = "default_search_k")]
    pub k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
}

fn default_search_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryIdParams {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseAddParams {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// RFC3339 instant; immediate when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateParams {
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunkParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Base64-encoded 16-bit little-endian PCM.
    pub pcm: String,
}
