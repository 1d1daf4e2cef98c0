//! `Supervisor` — owns all managed child processes.
//!
//! Callers interact exclusively through this struct. The registry is a
//! `RwLock<HashMap>`; restarts and retry-counter updates happen only while
//! holding the write lock, never during a read-lock iteration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, SupervisorError};
use crate::process::ProcHandle;
use crate::types::{LogSlice, ProcessInfo, ProcessSpec};

/// Auto-restart monitor cadence.
pub const MONITOR_INTERVAL_SECS: u64 = 10;
/// Janitor sweep cadence.
pub const JANITOR_INTERVAL_SECS: u64 = 60;
/// Exited processes are removed this long after exit.
pub const JANITOR_MAX_AGE_SECS: u64 = 300;

pub struct Supervisor {
    procs: RwLock<HashMap<String, Arc<ProcHandle>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            procs: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a child and register it. Returns the initial snapshot.
    pub fn spawn(&self, spec: ProcessSpec) -> Result<ProcessInfo> {
        let handle = Arc::new(ProcHandle::spawn(spec, 0, None)?);
        let info = handle.info();
        self.procs
            .write()
            .unwrap()
            .insert(handle.id.clone(), handle);
        Ok(info)
    }

    fn get(&self, id: &str) -> Result<Arc<ProcHandle>> {
        self.procs
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound { id: id.to_string() })
    }

    /// Read captured output. `offset` addresses the logical stream; bytes
    /// already dropped by the ring are reported via the `truncated` flag.
    pub fn log(&self, id: &str, offset: u64, limit: usize) -> Result<LogSlice> {
        Ok(self.get(id)?.log(offset, limit))
    }

    pub fn write_stdin(&self, id: &str, input: &str) -> Result<()> {
        self.get(id)?.write_stdin(input)
    }

    /// Kill and immediately deregister.
    pub fn kill(&self, id: &str) -> Result<()> {
        let handle = self.get(id)?;
        handle.kill();
        self.procs.write().unwrap().remove(id);
        info!(process_id = %id, "process killed and removed");
        Ok(())
    }

    pub fn info(&self, id: &str) -> Result<ProcessInfo> {
        Ok(self.get(id)?.info())
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.procs
            .read()
            .unwrap()
            .values()
            .map(|h| h.info())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.procs
            .read()
            .unwrap()
            .values()
            .filter(|h| h.is_running())
            .count()
    }

    /// Remove processes that exited more than `max_age` ago. Returns the
    /// removed ids.
    pub fn janitor_sweep(&self, max_age: Duration) -> Vec<String> {
        let mut procs = self.procs.write().unwrap();
        let expired: Vec<String> = procs
            .iter()
            .filter(|(_, h)| h.exited_for().is_some_and(|d| d >= max_age))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            procs.remove(id);
            info!(process_id = %id, "exited process removed by janitor");
        }
        expired
    }

    /// One auto-restart pass. For each exited process with restart budget
    /// left, spawn a replacement under the same spec with a fresh id and
    /// an incremented retry counter. Returns `(old_id, new_id)` pairs.
    pub fn monitor_pass(&self) -> Vec<(String, String)> {
        let mut procs = self.procs.write().unwrap();

        let candidates: Vec<Arc<ProcHandle>> = procs
            .values()
            .filter(|h| {
                !h.is_running()
                    && h.spec.auto_restart
                    && h.current_retries < h.spec.max_retries
                    && h.exited_for()
                        .is_some_and(|d| d >= Duration::from_secs(h.spec.restart_delay_secs))
            })
            .cloned()
            .collect();

        let mut restarted = Vec::new();
        for old in candidates {
            let retries = old.current_retries + 1;
            match ProcHandle::spawn(
                old.spec.clone(),
                retries,
                Some(chrono::Utc::now().to_rfc3339()),
            ) {
                Ok(handle) => {
                    let new_id = handle.id.clone();
                    info!(
                        old_id = %old.id, new_id = %new_id, retries,
                        "auto-restarted exited process"
                    );
                    procs.remove(&old.id);
                    procs.insert(new_id.clone(), Arc::new(handle));
                    restarted.push((old.id.clone(), new_id));
                }
                Err(e) => {
                    warn!(process_id = %old.id, error = %e, "auto-restart spawn failed");
                }
            }
        }
        restarted
    }

    /// Kill everything. Called on daemon shutdown.
    pub fn shutdown_all(&self) {
        let procs = self.procs.read().unwrap();
        for handle in procs.values() {
            handle.kill();
        }
    }

    /// Spawn the background monitor and janitor loops.
    pub fn start_loops(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let monitor = {
            let sup = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(MONITOR_INTERVAL_SECS)) => {
                            let restarted = sup.monitor_pass();
                            if !restarted.is_empty() {
                                info!(count = restarted.len(), "monitor pass restarted processes");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { return; }
                        }
                    }
                }
            })
        };

        let janitor = {
            let sup = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(JANITOR_INTERVAL_SECS)) => {
                            sup.janitor_sweep(Duration::from_secs(JANITOR_MAX_AGE_SECS));
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { return; }
                        }
                    }
                }
            })
        };

        vec![monitor, janitor]
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(cmdline: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::shell("sh");
        spec.args = vec!["-c".to_string(), cmdline.to_string()];
        spec
    }

    fn wait_exited(sup: &Supervisor, id: &str) {
        for _ in 0..100 {
            if let Ok(info) = sup.info(id) {
                if !matches!(info.status, crate::types::ProcessStatus::Running) {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("process {id} did not exit");
    }

    #[test]
    fn spawn_log_and_kill_round_trip() {
        let sup = Supervisor::new();
        let info = sup.spawn(sh("echo supervised")).unwrap();
        wait_exited(&sup, &info.id);
        std::thread::sleep(Duration::from_millis(150)); // drain window

        let log = sup.log(&info.id, 0, 1024).unwrap();
        assert!(log.data.contains("supervised"));

        sup.kill(&info.id).unwrap();
        assert!(sup.info(&info.id).is_err());
    }

    #[test]
    fn monitor_restarts_within_budget_and_assigns_new_id() {
        let sup = Supervisor::new();
        let mut spec = sh("exit 1");
        spec.auto_restart = true;
        spec.max_retries = 2;
        spec.restart_delay_secs = 0;

        let info = sup.spawn(spec).unwrap();
        wait_exited(&sup, &info.id);

        let restarted = sup.monitor_pass();
        assert_eq!(restarted.len(), 1);
        let (old_id, new_id) = &restarted[0];
        assert_eq!(old_id, &info.id);
        assert_ne!(old_id, new_id);
        assert!(sup.info(old_id).is_err());
        assert_eq!(sup.info(new_id).unwrap().current_retries, 1);

        // exhaust the budget
        wait_exited(&sup, new_id);
        let second = sup.monitor_pass();
        assert_eq!(second.len(), 1);
        let final_id = &second[0].1;
        wait_exited(&sup, final_id);
        assert!(sup.monitor_pass().is_empty());
        assert_eq!(sup.info(final_id).unwrap().current_retries, 2);
    }

    #[test]
    fn janitor_removes_only_old_exits() {
        let sup = Supervisor::new();
        let done = sup.spawn(sh("true")).unwrap();
        let running = sup.spawn(sh("sleep 30")).unwrap();
        wait_exited(&sup, &done.id);

        // age 0: any exited process qualifies
        let removed = sup.janitor_sweep(Duration::from_secs(0));
        assert_eq!(removed, vec![done.id.clone()]);
        assert!(sup.info(&running.id).is_ok());

        sup.kill(&running.id).unwrap();
    }
}
