use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cron::CronExpr;
use crate::error::Result;
use crate::pulse::PulseQueue;
use crate::types::PulseEvent;

/// Worker poll cadence when the queue is empty.
const POLL_INTERVAL_MS: u64 = 500;
/// Longest the cron planner sleeps before re-reading the job table.
const PLANNER_MAX_SLEEP_SECS: u64 = 60;
/// Housekeeping (retention purge) cadence.
const HOUSEKEEPING_SECS: u64 = 3600;

/// Processes claimed pulse events of one kind.
#[async_trait]
pub trait PulseHandler: Send + Sync {
    async fn handle(&self, event: &PulseEvent) -> std::result::Result<(), String>;
}

/// Drives the pulse queue: a small worker pool claiming due events, a single
/// cron planner enqueuing on schedule, and an hourly housekeeping tick.
///
/// On shutdown the planner stops producing first; workers finish the event
/// they hold (the drain), then exit.
pub struct SchedulerEngine {
    queue: Arc<PulseQueue>,
    handlers: HashMap<String, Arc<dyn PulseHandler>>,
    workers: usize,
}

impl SchedulerEngine {
    pub fn new(queue: Arc<PulseQueue>, workers: usize) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            workers: workers.max(1),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn PulseHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Spawn all scheduler tasks. Returns the join handles so the daemon can
    /// await the drain on shutdown.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        // recover events a previous process claimed but never finished
        if let Err(e) = self.queue.recover_stale_claims() {
            error!(error = %e, "stale claim recovery failed");
        }

        let handlers = Arc::new(self.handlers);
        let mut handles = Vec::new();

        for i in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let handlers = Arc::clone(&handlers);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(i, queue, handlers, shutdown).await;
            }));
        }

        let queue = Arc::clone(&self.queue);
        let planner_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            planner_loop(queue, planner_shutdown).await;
        }));

        let queue = Arc::clone(&self.queue);
        handles.push(tokio::spawn(async move {
            housekeeping_loop(queue, shutdown).await;
        }));

        handles
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<PulseQueue>,
    handlers: Arc<HashMap<String, Arc<dyn PulseHandler>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let worker_id = format!("worker-{index}");
    debug!(worker = %worker_id, "pulse worker started");

    loop {
        match queue.claim_next(&worker_id) {
            Ok(Some(event)) => {
                // a claimed event is always driven to a terminal update,
                // even when shutdown has been requested (the drain)
                process_event(&queue, &handlers, &event).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker = %worker_id, error = %e, "pulse claim failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(worker = %worker_id, "pulse worker stopping");
                    return;
                }
            }
        }
    }
}

async fn process_event(
    queue: &PulseQueue,
    handlers: &HashMap<String, Arc<dyn PulseHandler>>,
    event: &PulseEvent,
) {
    let outcome = match handlers.get(&event.kind) {
        Some(handler) => handler.handle(event).await,
        None => Err(format!("no handler registered for kind {}", event.kind)),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = queue.complete(&event.id) {
                error!(event_id = %event.id, error = %e, "pulse complete failed");
            }
        }
        Err(reason) => {
            warn!(event_id = %event.id, kind = %event.kind, reason, "pulse handler failed");
            if let Err(e) = queue.fail(&event.id) {
                error!(event_id = %event.id, error = %e, "pulse fail transition failed");
            }
        }
    }
}

/// Single planner: sleep until the earliest `next_fire`, enqueue the job's
/// pulse event, recompute. Re-reads the table at least once a minute so job
/// table edits are picked up.
async fn planner_loop(queue: Arc<PulseQueue>, mut shutdown: watch::Receiver<bool>) {
    info!("cron planner started");
    loop {
        let sleep_secs = match plan_once(&queue) {
            Ok(secs) => secs,
            Err(e) => {
                error!(error = %e, "cron planning pass failed");
                PLANNER_MAX_SLEEP_SECS
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("cron planner stopping");
                    return;
                }
            }
        }
    }
}

/// Fire all due jobs; return seconds until the next wakeup.
fn plan_once(queue: &PulseQueue) -> Result<u64> {
    let now = Utc::now();
    let now_str = now.to_rfc3339();
    let mut earliest: Option<chrono::DateTime<Utc>> = None;

    for job in queue.list_cron_jobs()? {
        if !job.enabled {
            continue;
        }
        let expr = match CronExpr::parse(&job.expression) {
            Ok(e) => e,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "stored cron expression no longer parses");
                continue;
            }
        };

        let due = job.next_fire.as_deref().is_some_and(|nf| nf <= now_str.as_str());
        if due {
            debug!(job_id = %job.id, kind = %job.kind, "cron job firing");
            queue.enqueue(&job.kind, job.payload.clone(), None, None, 3)?;
            let next = expr.next_after(now);
            queue.mark_cron_fired(&job.id, next)?;
            if let Some(n) = next {
                earliest = Some(earliest.map_or(n, |e| e.min(n)));
            }
        } else if let Some(nf) = job.next_fire.as_deref() {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(nf) {
                let parsed = parsed.with_timezone(&Utc);
                earliest = Some(earliest.map_or(parsed, |e| e.min(parsed)));
            }
        }
    }

    let sleep = earliest
        .map(|t| (t - now).num_seconds().clamp(1, PLANNER_MAX_SLEEP_SECS as i64) as u64)
        .unwrap_or(PLANNER_MAX_SLEEP_SECS);
    Ok(sleep)
}

async fn housekeeping_loop(queue: Arc<PulseQueue>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(HOUSEKEEPING_SECS)) => {
                if let Err(e) = queue.purge_expired() {
                    error!(error = %e, "pulse retention purge failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl PulseHandler for Counter {
        async fn handle(&self, _event: &PulseEvent) -> std::result::Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl PulseHandler for AlwaysFails {
        async fn handle(&self, _event: &PulseEvent) -> std::result::Result<(), String> {
            Err("boom".to_string())
        }
    }

    fn queue() -> Arc<PulseQueue> {
        Arc::new(PulseQueue::new(Connection::open_in_memory().unwrap()).unwrap())
    }

    #[tokio::test]
    async fn one_event_four_workers_exactly_one_completion() {
        let q = queue();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        q.enqueue("tick", serde_json::Value::Null, None, None, 3).unwrap();

        let mut engine = SchedulerEngine::new(Arc::clone(&q), 4);
        engine.register("tick", Arc::clone(&counter) as Arc<dyn PulseHandler>);

        let (tx, rx) = watch::channel(false);
        let handles = engine.start(rx);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        for handle in handles {
            let _ = handle.await;
        }

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        let (_, _, completed, _) = q.counts().unwrap();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn failing_handler_reschedules_then_fails() {
        let q = queue();
        let event = q.enqueue("boom", serde_json::Value::Null, None, None, 1).unwrap();

        let mut engine = SchedulerEngine::new(Arc::clone(&q), 1);
        engine.register("boom", Arc::new(AlwaysFails) as Arc<dyn PulseHandler>);

        let (tx, rx) = watch::channel(false);
        let handles = engine.start(rx);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        for handle in handles {
            let _ = handle.await;
        }

        // max_attempts = 1 → a single failure is terminal
        assert_eq!(q.status(&event.id).unwrap().state, crate::types::PulseState::Failed);
    }

    #[tokio::test]
    async fn unhandled_kind_is_not_lost_silently() {
        let q = queue();
        let event = q.enqueue("mystery", serde_json::Value::Null, None, None, 1).unwrap();

        let engine = SchedulerEngine::new(Arc::clone(&q), 1);
        let (tx, rx) = watch::channel(false);
        let handles = engine.start(rx);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        for handle in handles {
            let _ = handle.await;
        }

        assert_eq!(q.status(&event.id).unwrap().state, crate::types::PulseState::Failed);
    }

    #[test]
    fn plan_once_fires_due_jobs_and_reports_next_sleep() {
        let q = PulseQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        let job = q
            .add_cron_job("*/5 * * * * *", "heartbeat", serde_json::Value::Null)
            .unwrap();

        // force the job due
        {
            let past = (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
            q.mark_cron_fired(&job.id, None).unwrap();
            let db_patch = |q: &PulseQueue| {
                let db = q_db(q);
                db.execute(
                    "UPDATE cron_jobs SET next_fire = ?2 WHERE id = ?1",
                    rusqlite::params![job.id, past],
                )
                .unwrap();
            };
            db_patch(&q);
        }

        let sleep = plan_once(&q).unwrap();
        assert!(sleep >= 1);

        // one heartbeat pulse was enqueued and next_fire recomputed
        let (pending, _, _, _) = q.counts().unwrap();
        assert_eq!(pending, 1);
        let jobs = q.list_cron_jobs().unwrap();
        assert!(jobs[0].next_fire.is_some());
        assert!(jobs[0].last_fire.is_some());
    }

    // test-only access to the queue's connection
    fn q_db(q: &PulseQueue) -> std::sync::MutexGuard<'_, Connection> {
        q.db_for_tests()
    }
}
