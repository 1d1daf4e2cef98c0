use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{CronJob, PulseEvent, PulseState};

/// Terminal events are purged this long after completion/failure.
pub const RETENTION_DAYS: i64 = 7;

/// Base retry backoff; doubles per attempt.
const BACKOFF_BASE_SECS: i64 = 30;

/// Durable pulse queue plus cron job storage, sharing one connection.
///
/// The claim statement is a single UPDATE with a nested SELECT and
/// `RETURNING`, so two workers can never observe the same event as pending —
/// the store's row locking (and the connection mutex) make the transition
/// atomic.
pub struct PulseQueue {
    db: Mutex<Connection>,
}

impl PulseQueue {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Enqueue an event. `scheduled_at = None` means due immediately.
    #[instrument(skip(self, payload))]
    pub fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        session_key: Option<&str>,
        scheduled_at: Option<DateTime<Utc>>,
        max_attempts: u32,
    ) -> Result<PulseEvent> {
        let id = Uuid::now_v7().to_string();
        let at = scheduled_at.unwrap_or_else(Utc::now).to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO pulse_events
             (id, session_key, kind, payload, scheduled_at, attempts, max_attempts, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 'pending')",
            rusqlite::params![id, session_key, kind, payload.to_string(), at, max_attempts],
        )?;
        debug!(event_id = %id, "pulse event enqueued");
        Ok(PulseEvent {
            id,
            session_key: session_key.map(str::to_string),
            kind: kind.to_string(),
            payload,
            scheduled_at: at,
            claimed_at: None,
            completed_at: None,
            worker_id: None,
            attempts: 0,
            max_attempts,
            state: PulseState::Pending,
        })
    }

    /// Atomically claim the oldest due pending event for `worker_id`.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<PulseEvent>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let claimed = db.query_row(
            "UPDATE pulse_events
             SET state = 'claimed', claimed_at = ?1, worker_id = ?2
             WHERE id = (SELECT id FROM pulse_events
                         WHERE state = 'pending' AND scheduled_at <= ?1
                         ORDER BY scheduled_at
                         LIMIT 1)
               AND state = 'pending'
             RETURNING id, session_key, kind, payload, scheduled_at, claimed_at,
                       completed_at, worker_id, attempts, max_attempts, state",
            rusqlite::params![now, worker_id],
            row_to_event,
        );
        match claimed {
            Ok(event) => Ok(Some(event)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// Mark a claimed event done. Exactly one worker ever reaches this for a
    /// given claim.
    pub fn complete(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE pulse_events SET state = 'completed', completed_at = ?2
             WHERE id = ?1 AND state = 'claimed'",
            rusqlite::params![id, now],
        )?;
        if n == 0 {
            return Err(SchedulerError::EventNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record a processing failure: increment attempts, then either
    /// reschedule with exponential backoff or mark the event failed.
    /// Returns the resulting state.
    pub fn fail(&self, id: &str) -> Result<PulseState> {
        let now = Utc::now();
        let db = self.db.lock().unwrap();
        let (attempts, max_attempts): (u32, u32) = db.query_row(
            "SELECT attempts, max_attempts FROM pulse_events WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SchedulerError::EventNotFound { id: id.to_string() },
            other => SchedulerError::Database(other),
        })?;

        let attempts = attempts + 1;
        if attempts >= max_attempts {
            db.execute(
                "UPDATE pulse_events
                 SET state = 'failed', attempts = ?2, completed_at = ?3
                 WHERE id = ?1",
                rusqlite::params![id, attempts, now.to_rfc3339()],
            )?;
            warn!(event_id = %id, attempts, "pulse event failed permanently");
            Ok(PulseState::Failed)
        } else {
            let backoff = BACKOFF_BASE_SECS * (1 << (attempts - 1).min(8));
            let retry_at = (now + Duration::seconds(backoff)).to_rfc3339();
            db.execute(
                "UPDATE pulse_events
                 SET state = 'pending', attempts = ?2, scheduled_at = ?3,
                     claimed_at = NULL, worker_id = NULL
                 WHERE id = ?1",
                rusqlite::params![id, attempts, retry_at],
            )?;
            debug!(event_id = %id, attempts, backoff_secs = backoff, "pulse event rescheduled");
            Ok(PulseState::Pending)
        }
    }

    pub fn status(&self, id: &str) -> Result<PulseEvent> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, session_key, kind, payload, scheduled_at, claimed_at,
                    completed_at, worker_id, attempts, max_attempts, state
             FROM pulse_events WHERE id = ?1",
            [id],
            row_to_event,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SchedulerError::EventNotFound { id: id.to_string() },
            other => SchedulerError::Database(other),
        })
    }

    /// Recent events, newest scheduled first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<PulseEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_key, kind, payload, scheduled_at, claimed_at,
                    completed_at, worker_id, attempts, max_attempts, state
             FROM pulse_events ORDER BY scheduled_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_event)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Requeue events that were claimed but never finished (e.g. the daemon
    /// died mid-processing). Called once on startup.
    pub fn recover_stale_claims(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE pulse_events
             SET state = 'pending', claimed_at = NULL, worker_id = NULL
             WHERE state = 'claimed'",
            [],
        )?;
        if n > 0 {
            info!(recovered = n, "stale pulse claims recovered on startup");
        }
        Ok(n)
    }

    /// Purge terminal events older than the retention window.
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(RETENTION_DAYS)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM pulse_events
             WHERE state IN ('completed', 'failed') AND completed_at < ?1",
            [cutoff],
        )?;
        if n > 0 {
            debug!(purged = n, "expired pulse events purged");
        }
        Ok(n)
    }

    /// `(pending, claimed, completed, failed)` counters for `stats.get`.
    pub fn counts(&self) -> Result<(u64, u64, u64, u64)> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT state, COUNT(*) FROM pulse_events GROUP BY state")?;
        let mut counts = (0u64, 0u64, 0u64, 0u64);
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            match PulseState::parse(&row.0) {
                PulseState::Pending => counts.0 = row.1,
                PulseState::Claimed => counts.1 = row.1,
                PulseState::Completed => counts.2 = row.1,
                PulseState::Failed => counts.3 = row.1,
            }
        }
        Ok(counts)
    }

    // --- cron jobs ----------------------------------------------------------

    /// Add a cron job. The expression is validated and `next_fire` seeded.
    pub fn add_cron_job(
        &self,
        expression: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<CronJob> {
        let expr = crate::cron::CronExpr::parse(expression)?;
        let now = Utc::now();
        let next = expr.next_after(now).map(|t| t.to_rfc3339());
        let id = Uuid::now_v7().to_string();
        let created = now.to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO cron_jobs (id, expression, kind, payload, enabled, next_fire, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
            rusqlite::params![id, expression, kind, payload.to_string(), next, created],
        )?;
        info!(job_id = %id, expression, "cron job added");
        Ok(CronJob {
            id,
            expression: expression.to_string(),
            kind: kind.to_string(),
            payload,
            enabled: true,
            next_fire: next,
            last_fire: None,
            created_at: created,
        })
    }

    pub fn remove_cron_job(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM cron_jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn set_cron_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE cron_jobs SET enabled = ?2 WHERE id = ?1",
            rusqlite::params![id, enabled as i64],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, expression, kind, payload, enabled, next_fire, last_fire, created_at
             FROM cron_jobs ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Record a firing: bump `last_fire` and store the recomputed `next_fire`.
    pub fn mark_cron_fired(&self, id: &str, next_fire: Option<DateTime<Utc>>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE cron_jobs SET last_fire = ?2, next_fire = ?3 WHERE id = ?1",
            rusqlite::params![id, now, next_fire.map(|t| t.to_rfc3339())],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
impl PulseQueue {
    /// Direct connection access for crate tests that need to fudge rows.
    pub(crate) fn db_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap()
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<PulseEvent> {
    let payload_json: String = row.get(3)?;
    Ok(PulseEvent {
        id: row.get(0)?,
        session_key: row.get(1)?,
        kind: row.get(2)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        scheduled_at: row.get(4)?,
        claimed_at: row.get(5)?,
        completed_at: row.get(6)?,
        worker_id: row.get(7)?,
        attempts: row.get::<_, i64>(8)? as u32,
        max_attempts: row.get::<_, i64>(9)? as u32,
        state: PulseState::parse(&row.get::<_, String>(10)?),
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    let payload_json: String = row.get(3)?;
    Ok(CronJob {
        id: row.get(0)?,
        expression: row.get(1)?,
        kind: row.get(2)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        enabled: row.get::<_, i64>(4)? != 0,
        next_fire: row.get(5)?,
        last_fire: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> PulseQueue {
        PulseQueue::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn claim_is_exclusive() {
        let q = queue();
        q.enqueue("tick", serde_json::Value::Null, None, None, 3).unwrap();

        let first = q.claim_next("w1").unwrap();
        assert!(first.is_some());
        // nothing left for the other workers
        assert!(q.claim_next("w2").unwrap().is_none());
        assert!(q.claim_next("w3").unwrap().is_none());

        let event = first.unwrap();
        assert_eq!(event.state, PulseState::Claimed);
        assert_eq!(event.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn future_events_are_not_due() {
        let q = queue();
        q.enqueue(
            "later",
            serde_json::Value::Null,
            None,
            Some(Utc::now() + Duration::hours(1)),
            3,
        )
        .unwrap();
        assert!(q.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn fail_reschedules_until_max_attempts() {
        let q = queue();
        let event = q.enqueue("flaky", serde_json::Value::Null, None, None, 2).unwrap();

        q.claim_next("w1").unwrap().unwrap();
        assert_eq!(q.fail(&event.id).unwrap(), PulseState::Pending);
        let after = q.status(&event.id).unwrap();
        assert_eq!(after.attempts, 1);
        // rescheduled into the future with backoff
        assert!(after.scheduled_at > Utc::now().to_rfc3339());

        assert_eq!(q.fail(&event.id).unwrap(), PulseState::Failed);
        assert_eq!(q.status(&event.id).unwrap().state, PulseState::Failed);
    }

    #[test]
    fn complete_requires_a_claim() {
        let q = queue();
        let event = q.enqueue("tick", serde_json::Value::Null, None, None, 3).unwrap();
        assert!(q.complete(&event.id).is_err());
        q.claim_next("w1").unwrap().unwrap();
        q.complete(&event.id).unwrap();
        assert_eq!(q.status(&event.id).unwrap().state, PulseState::Completed);
    }

    #[test]
    fn stale_claims_recover_on_startup() {
        let q = queue();
        q.enqueue("tick", serde_json::Value::Null, None, None, 3).unwrap();
        q.claim_next("w1").unwrap().unwrap();
        assert_eq!(q.recover_stale_claims().unwrap(), 1);
        assert!(q.claim_next("w2").unwrap().is_some());
    }

    #[test]
    fn purge_removes_old_terminal_events() {
        let q = queue();
        let event = q.enqueue("tick", serde_json::Value::Null, None, None, 3).unwrap();
        q.claim_next("w1").unwrap().unwrap();
        q.complete(&event.id).unwrap();

        // backdate completion past the retention window
        {
            let db = q.db.lock().unwrap();
            let old = (Utc::now() - Duration::days(RETENTION_DAYS + 1)).to_rfc3339();
            db.execute(
                "UPDATE pulse_events SET completed_at = ?2 WHERE id = ?1",
                rusqlite::params![event.id, old],
            )
            .unwrap();
        }
        assert_eq!(q.purge_expired().unwrap(), 1);
        assert!(q.status(&event.id).is_err());
    }

    #[test]
    fn cron_job_round_trip() {
        let q = queue();
        let job = q
            .add_cron_job("*/5 * * * * *", "heartbeat", serde_json::Value::Null)
            .unwrap();
        assert!(job.next_fire.is_some());

        let listed = q.list_cron_jobs().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, "heartbeat");

        q.set_cron_enabled(&job.id, false).unwrap();
        assert!(!q.list_cron_jobs().unwrap()[0].enabled);

        q.remove_cron_job(&job.id).unwrap();
        assert!(q.list_cron_jobs().unwrap().is_empty());
    }

    #[test]
    fn bad_expression_rejected() {
        let q = queue();
        assert!(q
            .add_cron_job("not cron", "x", serde_json::Value::Null)
            .is_err());
    }
}
