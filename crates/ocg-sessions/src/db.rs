use rusqlite::{Connection, Result};

/// Initialise session tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_sessions_table(conn)?;
    create_messages_table(conn)?;
    create_archive_table(conn)?;
    create_meta_table(conn)?;
    create_task_tables(conn)?;
    Ok(())
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );",
    )
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            session_key  TEXT NOT NULL,
            message_id   INTEGER NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            tool_call_id TEXT,
            tool_name    TEXT,
            is_summary   INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            PRIMARY KEY (session_key, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_tool_call
            ON messages(session_key, tool_call_id)
            WHERE tool_call_id IS NOT NULL;",
    )
}

/// The uniqueness constraint is the dedupe guarantee: retried compactions
/// upsert into this table and never create a second row per source message.
fn create_archive_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages_archive (
            session_key       TEXT NOT NULL,
            source_message_id INTEGER NOT NULL,
            role              TEXT NOT NULL,
            content           TEXT NOT NULL,
            archived_at       TEXT NOT NULL,
            UNIQUE (session_key, source_message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_archive_session
            ON messages_archive(session_key, source_message_id);",
    )
}

fn create_meta_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS session_meta (
            session_key               TEXT PRIMARY KEY,
            last_compacted_message_id INTEGER NOT NULL DEFAULT 0,
            next_message_id           INTEGER NOT NULL DEFAULT 1,
            compaction_count          INTEGER NOT NULL DEFAULT 0,
            total_tokens_estimate     INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn create_task_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_tasks (
            id           TEXT PRIMARY KEY,
            description  TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending',
            created_at   TEXT NOT NULL,
            completed_at TEXT
        );
        CREATE TABLE IF NOT EXISTS user_subtasks (
            id        TEXT PRIMARY KEY,
            task_id   TEXT NOT NULL REFERENCES user_tasks(id) ON DELETE CASCADE,
            step      INTEGER NOT NULL,
            title     TEXT NOT NULL,
            status    TEXT NOT NULL DEFAULT 'pending',
            result    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_subtasks_task
            ON user_subtasks(task_id, step);",
    )
}
