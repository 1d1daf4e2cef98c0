use serde::{Deserialize, Serialize};

use ocg_core::Role;

/// A persisted session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_key: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: u64,
}

/// One message in a session's active history.
///
/// `message_id` is monotone per session and never reused; compaction deletes
/// rows but the next id always comes from the high-water counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    /// True for `[summary]` rows produced by compaction.
    pub is_summary: bool,
    pub created_at: String,
}

/// A message about to be appended (id assigned by the store).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl NewMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// Compaction bookkeeping for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_key: String,
    /// Largest message id whose original has been archived.
    pub last_compacted_message_id: i64,
    pub compaction_count: u64,
    pub total_tokens_estimate: u64,
}

/// A row in `messages_archive`. At most one per `(session_key,
/// source_message_id)` — repeated compaction attempts are absorbed by the
/// unique constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRow {
    pub session_key: String,
    pub source_message_id: i64,
    pub role: Role,
    pub content: String,
    pub archived_at: String,
}
