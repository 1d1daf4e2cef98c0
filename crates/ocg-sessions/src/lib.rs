//! Session & context storage: per-key message history with monotone ids,
//! the compaction archive with its watermark and dedupe constraint, session
//! metadata, per-key turn locks, and split user tasks.

pub mod db;
pub mod error;
pub mod manager;
pub mod tasks;
pub mod types;

pub use error::{Result, SessionError};
pub use manager::SessionManager;
pub use tasks::TaskStore;
pub use types::{ArchiveRow, NewMessage, Session, SessionMeta, StoredMessage};
