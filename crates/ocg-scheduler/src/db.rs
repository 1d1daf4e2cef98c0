use rusqlite::{Connection, Result};

/// Initialise scheduler tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pulse_events (
            id           TEXT PRIMARY KEY,
            session_key  TEXT,
            kind         TEXT NOT NULL,
            payload      TEXT NOT NULL DEFAULT 'null',
            scheduled_at TEXT NOT NULL,
            claimed_at   TEXT,
            completed_at TEXT,
            worker_id    TEXT,
            attempts     INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            state        TEXT NOT NULL DEFAULT 'pending'
        );
        CREATE INDEX IF NOT EXISTS idx_pulse_due
            ON pulse_events(state, scheduled_at);

        CREATE TABLE IF NOT EXISTS cron_jobs (
            id         TEXT PRIMARY KEY,
            expression TEXT NOT NULL,
            kind       TEXT NOT NULL,
            payload    TEXT NOT NULL DEFAULT 'null',
            enabled    INTEGER NOT NULL DEFAULT 1,
            next_fire  TEXT,
            last_fire  TEXT,
            created_at TEXT NOT NULL
        );",
    )
}
