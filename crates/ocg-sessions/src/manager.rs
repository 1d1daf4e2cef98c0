use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use ocg_core::{Role, SessionKey};

use crate::db::init_db;
use crate::error::{Result, SessionError};
use crate::types::{ArchiveRow, NewMessage, Session, SessionMeta, StoredMessage};

/// Thread-safe manager for persisted sessions and their message history.
///
/// Wraps a single SQLite connection in a `Mutex` (the store is single-writer
/// by design). Turn-level serialisation uses the async per-key locks from
/// [`SessionManager::lock_handle`], which are held across provider calls —
/// the connection mutex is only ever held for individual statements.
pub struct SessionManager {
    db: Mutex<Connection>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionManager {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            locks: DashMap::new(),
        })
    }

    /// The per-session turn mutex. Concurrent turns on one key serialise on
    /// this lock; compaction uses `try_lock` on the same handle.
    pub fn lock_handle(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return an existing session or lazily create one.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions (session_key, created_at, updated_at)
             VALUES (?1, ?2, ?2)",
            rusqlite::params![key.as_str(), now],
        )?;
        db.execute(
            "INSERT OR IGNORE INTO session_meta (session_key) VALUES (?1)",
            rusqlite::params![key.as_str()],
        )?;
        read_session(&db, key.as_str())
    }

    /// List sessions, most recently updated first.
    pub fn list(&self, limit: usize) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT s.session_key, s.created_at, s.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_key = s.session_key)
             FROM sessions s
             ORDER BY s.updated_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(Session {
                session_key: row.get(0)?,
                created_at: row.get(1)?,
                updated_at: row.get(2)?,
                message_count: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Destroy a session: active messages and metadata go, archive rows stay.
    #[instrument(skip(self), fields(key = %key))]
    pub fn reset(&self, key: &SessionKey) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE session_key = ?1",
            [key.as_str()],
        )?;
        tx.execute(
            "DELETE FROM session_meta WHERE session_key = ?1",
            [key.as_str()],
        )?;
        let n = tx.execute(
            "DELETE FROM sessions WHERE session_key = ?1",
            [key.as_str()],
        )?;
        tx.commit()?;
        if n == 0 {
            return Err(SessionError::NotFound {
                key: key.as_str().to_string(),
            });
        }
        info!("session reset");
        Ok(())
    }

    /// Append messages in order, assigning monotone per-session ids.
    ///
    /// Ids come from a high-water counter in `session_meta`, so they keep
    /// growing across compaction deletes. Messages that carry a
    /// `tool_call_id` already present in the session are rejected as
    /// duplicates before anything is written.
    #[instrument(skip(self, messages), fields(key = %key, count = messages.len()))]
    pub fn append_messages(
        &self,
        key: &SessionKey,
        messages: &[NewMessage],
    ) -> Result<Vec<StoredMessage>> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO sessions (session_key, created_at, updated_at)
             VALUES (?1, ?2, ?2)",
            rusqlite::params![key.as_str(), now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO session_meta (session_key) VALUES (?1)",
            rusqlite::params![key.as_str()],
        )?;

        for m in messages {
            if let Some(ref id) = m.tool_call_id {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages
                      WHERE session_key = ?1 AND tool_call_id = ?2)",
                    rusqlite::params![key.as_str(), id],
                    |row| row.get(0),
                )?;
                if exists {
                    return Err(SessionError::DuplicateToolCall { id: id.clone() });
                }
            }
        }

        let mut next: i64 = tx.query_row(
            "SELECT next_message_id FROM session_meta WHERE session_key = ?1",
            [key.as_str()],
            |row| row.get(0),
        )?;

        let mut stored = Vec::with_capacity(messages.len());
        for m in messages {
            tx.execute(
                "INSERT INTO messages
                 (session_key, message_id, role, content, tool_call_id, tool_name, is_summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                rusqlite::params![
                    key.as_str(),
                    next,
                    m.role.as_str(),
                    m.content,
                    m.tool_call_id,
                    m.tool_name,
                    now
                ],
            )?;
            stored.push(StoredMessage {
                message_id: next,
                role: m.role,
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
                tool_name: m.tool_name.clone(),
                is_summary: false,
                created_at: now.clone(),
            });
            next += 1;
        }

        tx.execute(
            "UPDATE session_meta SET next_message_id = ?2 WHERE session_key = ?1",
            rusqlite::params![key.as_str(), next],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE session_key = ?1",
            rusqlite::params![key.as_str(), now],
        )?;
        tx.commit()?;

        debug!(appended = stored.len(), "messages appended");
        Ok(stored)
    }

    /// Whether a tool call id has already been recorded in this session.
    pub fn has_tool_call(&self, key: &SessionKey, tool_call_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let exists: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages
              WHERE session_key = ?1 AND tool_call_id = ?2)",
            rusqlite::params![key.as_str(), tool_call_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// The full active history in message-id order.
    pub fn active_messages(&self, key: &SessionKey) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_id, role, content, tool_call_id, tool_name, is_summary, created_at
             FROM messages WHERE session_key = ?1 ORDER BY message_id",
        )?;
        let rows = stmt.query_map([key.as_str()], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The trailing `limit` messages in message-id order.
    pub fn history(&self, key: &SessionKey, limit: usize) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_id, role, content, tool_call_id, tool_name, is_summary, created_at
             FROM (SELECT * FROM messages WHERE session_key = ?1
                   ORDER BY message_id DESC LIMIT ?2)
             ORDER BY message_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![key.as_str(), limit as i64], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn meta(&self, key: &SessionKey) -> Result<SessionMeta> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT last_compacted_message_id, compaction_count, total_tokens_estimate
             FROM session_meta WHERE session_key = ?1",
            [key.as_str()],
            |row| {
                Ok(SessionMeta {
                    session_key: key.as_str().to_string(),
                    last_compacted_message_id: row.get(0)?,
                    compaction_count: row.get::<_, i64>(1)? as u64,
                    total_tokens_estimate: row.get::<_, i64>(2)? as u64,
                })
            },
        ) {
            Ok(meta) => Ok(meta),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(SessionMeta {
                session_key: key.as_str().to_string(),
                ..SessionMeta::default()
            }),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    pub fn set_token_estimate(&self, key: &SessionKey, tokens: u64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE session_meta SET total_tokens_estimate = ?2 WHERE session_key = ?1",
            rusqlite::params![key.as_str(), tokens as i64],
        )?;
        Ok(())
    }

    /// Drop tool-result messages older than `days`. Returns how many went.
    #[instrument(skip(self), fields(key = %key))]
    pub fn prune_tool_results(&self, key: &SessionKey, days: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM messages
             WHERE session_key = ?1 AND role = 'tool' AND created_at < ?2",
            rusqlite::params![key.as_str(), cutoff],
        )?;
        if n > 0 {
            debug!(pruned = n, "old tool results pruned");
        }
        Ok(n)
    }

    // --- compaction support -------------------------------------------------

    /// Messages eligible for archival: `(watermark, cutoff]`, excluding
    /// `[summary]` synthetics (they are never historical).
    pub fn compaction_candidates(
        &self,
        key: &SessionKey,
        cutoff: i64,
    ) -> Result<Vec<StoredMessage>> {
        let watermark = self.meta(key)?.last_compacted_message_id;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_id, role, content, tool_call_id, tool_name, is_summary, created_at
             FROM messages
             WHERE session_key = ?1 AND message_id > ?2 AND message_id <= ?3
               AND is_summary = 0
             ORDER BY message_id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![key.as_str(), watermark, cutoff],
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Upsert candidate messages into the archive. The unique constraint on
    /// `(session_key, source_message_id)` absorbs retries; returns how many
    /// rows were newly inserted.
    pub fn archive_messages(
        &self,
        key: &SessionKey,
        messages: &[StoredMessage],
    ) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let mut inserted = 0usize;
        for m in messages {
            inserted += tx.execute(
                "INSERT INTO messages_archive
                 (session_key, source_message_id, role, content, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_key, source_message_id) DO NOTHING",
                rusqlite::params![key.as_str(), m.message_id, m.role.as_str(), m.content, now],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Atomically swap the compacted range for its summary.
    ///
    /// In one transaction: delete archived candidates `(watermark, cutoff]`,
    /// delete superseded `[summary]` rows at or below `cutoff` (synthetic —
    /// deleted, never archived), insert the new summary at `message_id =
    /// cutoff` so it sorts ahead of the kept tail, advance the watermark and
    /// bump the compaction counter.
    #[instrument(skip(self, summary), fields(key = %key))]
    pub fn apply_compaction(&self, key: &SessionKey, cutoff: i64, summary: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let watermark: i64 = tx.query_row(
            "SELECT last_compacted_message_id FROM session_meta WHERE session_key = ?1",
            [key.as_str()],
            |row| row.get(0),
        )?;

        tx.execute(
            "DELETE FROM messages
             WHERE session_key = ?1 AND message_id > ?2 AND message_id <= ?3
               AND is_summary = 0",
            rusqlite::params![key.as_str(), watermark, cutoff],
        )?;
        tx.execute(
            "DELETE FROM messages
             WHERE session_key = ?1 AND message_id <= ?2 AND is_summary = 1",
            rusqlite::params![key.as_str(), cutoff],
        )?;
        tx.execute(
            "INSERT INTO messages
             (session_key, message_id, role, content, tool_call_id, tool_name, is_summary, created_at)
             VALUES (?1, ?2, 'system', ?3, NULL, NULL, 1, ?4)",
            rusqlite::params![key.as_str(), cutoff, summary, now],
        )?;
        tx.execute(
            "UPDATE session_meta
             SET last_compacted_message_id = ?2,
                 compaction_count = compaction_count + 1
             WHERE session_key = ?1",
            rusqlite::params![key.as_str(), cutoff],
        )?;
        tx.commit()?;

        info!("compaction applied");
        Ok(())
    }

    /// Archive rows for one session, in source-id order.
    pub fn archive_rows(&self, key: &SessionKey) -> Result<Vec<ArchiveRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT source_message_id, role, content, archived_at
             FROM messages_archive WHERE session_key = ?1
             ORDER BY source_message_id",
        )?;
        let key_str = key.as_str().to_string();
        let rows = stmt.query_map([key.as_str()], move |row| {
            Ok(ArchiveRow {
                session_key: key_str.clone(),
                source_message_id: row.get(0)?,
                role: row
                    .get::<_, String>(1)?
                    .parse()
                    .unwrap_or(ocg_core::Role::User),
                content: row.get(2)?,
                archived_at: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Counters for `stats.get`.
    pub fn stats(&self) -> Result<(u64, u64, u64)> {
        let db = self.db.lock().unwrap();
        let sessions: i64 = db.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        let messages: i64 = db.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let archived: i64 =
            db.query_row("SELECT COUNT(*) FROM messages_archive", [], |r| r.get(0))?;
        Ok((sessions as u64, messages as u64, archived as u64))
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: row.get(0)?,
        role: row
            .get::<_, String>(1)?
            .parse::<Role>()
            .unwrap_or(Role::User),
        content: row.get(2)?,
        tool_call_id: row.get(3)?,
        tool_name: row.get(4)?,
        is_summary: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn read_session(db: &Connection, key: &str) -> Result<Session> {
    Ok(db.query_row(
        "SELECT session_key, created_at, updated_at,
                (SELECT COUNT(*) FROM messages m WHERE m.session_key = sessions.session_key)
         FROM sessions WHERE session_key = ?1",
        [key],
        |row| {
            Ok(Session {
                session_key: row.get(0)?,
                created_at: row.get(1)?,
                updated_at: row.get(2)?,
                message_count: row.get::<_, i64>(3)? as u64,
            })
        },
    )?)
}
