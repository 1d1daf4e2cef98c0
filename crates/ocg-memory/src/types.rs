use serde::{Deserialize, Serialize};

/// One stored memory. Every row carries a vector of the configured dimension
/// and a keyword projection in the inverted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: i64,
    pub content: String,
    #[serde(skip_serializing)]
    pub vector: Vec<f32>,
    pub tags: Vec<String>,
    pub created_at: String,
    pub source_session_key: Option<String>,
    /// Set when an index write failed; the row is re-indexed on startup.
    pub pending_reindex: bool,
}

/// A hybrid search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub content: String,
    /// Blended score in `[0, 1]`.
    pub score: f32,
}
