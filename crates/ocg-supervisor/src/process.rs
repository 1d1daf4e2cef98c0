//! One managed child process: spawn (pipe or PTY), capture into the ring
//! buffer, track exit, and flush trailing output through a single-shot
//! drain gate.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SupervisorError};
use crate::ring::RingBuffer;
use crate::types::{LogSlice, ProcessInfo, ProcessSpec, ProcessStatus};

/// How long the drainer keeps flushing after the child exits.
const DRAIN_GRACE_MS: u64 = 100;

struct ProcState {
    status: ProcessStatus,
    exited_at: Option<(String, Instant)>,
    /// Set once, 100 ms after exit, when trailing output has been flushed.
    drained: bool,
}

pub struct ProcHandle {
    pub id: String,
    pub spec: ProcessSpec,
    pub pid: Option<u32>,
    pub created_at: String,
    pub current_retries: u32,
    pub last_restart_at: Option<String>,
    ring: Arc<Mutex<RingBuffer>>,
    stdin: Mutex<Option<Box<dyn Write + Send>>>,
    state: Arc<Mutex<ProcState>>,
    drain_fired: Arc<AtomicBool>,
}

impl ProcHandle {
    /// Spawn a fresh child for `spec`. `current_retries` and
    /// `last_restart_at` carry restart bookkeeping into the new handle.
    pub fn spawn(
        spec: ProcessSpec,
        current_retries: u32,
        last_restart_at: Option<String>,
    ) -> Result<Self> {
        let id = Uuid::now_v7().to_string();
        let ring = Arc::new(Mutex::new(RingBuffer::new(spec.buffer_max_bytes)));
        let state = Arc::new(Mutex::new(ProcState {
            status: ProcessStatus::Running,
            exited_at: None,
            drained: false,
        }));
        let drain_fired = Arc::new(AtomicBool::new(false));

        let (pid, stdin) = if spec.pty {
            spawn_pty(&spec, &id, &ring, &state, &drain_fired)?
        } else {
            spawn_piped(&spec, &id, &ring, &state, &drain_fired)?
        };

        debug!(process_id = %id, pid, command = %spec.command, pty = spec.pty, "child spawned");

        Ok(Self {
            id,
            spec,
            pid,
            created_at: chrono::Utc::now().to_rfc3339(),
            current_retries,
            last_restart_at,
            ring,
            stdin: Mutex::new(stdin),
            state,
            drain_fired,
        })
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), ProcessStatus::Running)
    }

    /// Time since exit, when exited.
    pub fn exited_for(&self) -> Option<std::time::Duration> {
        self.state
            .lock()
            .unwrap()
            .exited_at
            .as_ref()
            .map(|(_, at)| at.elapsed())
    }

    pub fn info(&self) -> ProcessInfo {
        let state = self.state.lock().unwrap();
        ProcessInfo {
            id: self.id.clone(),
            pid: self.pid,
            command: self.spec.command.clone(),
            uses_pty: self.spec.pty,
            status: state.status,
            created_at: self.created_at.clone(),
            exited_at: state.exited_at.as_ref().map(|(ts, _)| ts.clone()),
            auto_restart: self.spec.auto_restart,
            current_retries: self.current_retries,
            max_retries: self.spec.max_retries,
            last_restart_at: self.last_restart_at.clone(),
        }
    }

    /// Read captured output at `offset`, up to `limit` bytes.
    pub fn log(&self, offset: u64, limit: usize) -> LogSlice {
        let ring = self.ring.lock().unwrap();
        let slice = ring.read(offset, limit);
        LogSlice {
            data: String::from_utf8_lossy(&slice.data).into_owned(),
            offset: slice.offset,
            truncated: slice.truncated,
            total_written: slice.total_written,
        }
    }

    /// Send bytes to the child's stdin (the PTY master in PTY mode).
    pub fn write_stdin(&self, input: &str) -> Result<()> {
        let mut guard = self.stdin.lock().unwrap();
        let writer = guard.as_mut().ok_or_else(|| SupervisorError::NoStdin {
            id: self.id.clone(),
        })?;
        writer.write_all(input.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Terminate the child. SIGKILL by pid is the reliable path once the
    /// Child handle lives inside the waiter thread.
    pub fn kill(&self) {
        if !self.is_running() {
            return;
        }
        if let Some(pid) = self.pid {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            {
                let _ = std::process::Command::new("taskkill")
                    .args(["/F", "/PID", &pid.to_string()])
                    .output();
            }
        }
    }

    /// Whether the post-exit drain window has completed.
    pub fn drained(&self) -> bool {
        self.state.lock().unwrap().drained
    }
}

fn spawn_piped(
    spec: &ProcessSpec,
    id: &str,
    ring: &Arc<Mutex<RingBuffer>>,
    state: &Arc<Mutex<ProcState>>,
    drain_fired: &Arc<AtomicBool>,
) -> Result<(Option<u32>, Option<Box<dyn Write + Send>>)> {
    let mut cmd = std::process::Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    if let Some(ref dir) = spec.workdir {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
    let pid = Some(child.id());

    let stdin: Option<Box<dyn Write + Send>> = child
        .stdin
        .take()
        .map(|s| Box::new(s) as Box<dyn Write + Send>);

    if let Some(stdout) = child.stdout.take() {
        start_reader(id, "stdout", stdout, Arc::clone(ring));
    }
    if let Some(stderr) = child.stderr.take() {
        start_reader(id, "stderr", stderr, Arc::clone(ring));
    }

    start_waiter(id, state, drain_fired, move || {
        child.wait().ok().and_then(|s| s.code())
    });

    Ok((pid, stdin))
}

fn spawn_pty(
    spec: &ProcessSpec,
    id: &str,
    ring: &Arc<Mutex<RingBuffer>>,
    state: &Arc<Mutex<ProcState>>,
    drain_fired: &Arc<AtomicBool>,
) -> Result<(Option<u32>, Option<Box<dyn Write + Send>>)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.command);
    for arg in &spec.args {
        cmd.arg(arg);
    }
    if let Some(ref dir) = spec.workdir {
        cmd.cwd(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
    let pid = child.process_id();

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

    start_reader(id, "pty", reader, Arc::clone(ring));
    start_waiter(id, state, drain_fired, move || {
        // master must stay alive while the child runs; holding it in the
        // waiter closure ties their lifetimes together
        let _master = pair.master;
        child.wait().ok().map(|s| s.exit_code() as i32)
    });

    Ok((pid, Some(writer)))
}

/// Blocking reads run on a dedicated OS thread so they never block Tokio.
fn start_reader(id: &str, stream: &'static str, mut src: impl Read + Send + 'static, ring: Arc<Mutex<RingBuffer>>) {
    let id = id.to_string();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => ring.lock().unwrap().write(&buf[..n]),
                Err(e) => {
                    // PTY masters report EIO at child exit; that's EOF here
                    if e.raw_os_error() != Some(libc::EIO) {
                        warn!(process_id = %id, stream, error = %e, "reader error");
                    }
                    break;
                }
            }
        }
        debug!(process_id = %id, stream, "reader finished");
    });
}

/// Waits for the child, records the exit, then holds the drain window open
/// for `DRAIN_GRACE_MS` before firing the single-shot completion gate.
fn start_waiter(
    id: &str,
    state: &Arc<Mutex<ProcState>>,
    drain_fired: &Arc<AtomicBool>,
    wait_fn: impl FnOnce() -> Option<i32> + Send + 'static,
) {
    let id = id.to_string();
    let state = Arc::clone(state);
    let drain_fired = Arc::clone(drain_fired);
    std::thread::spawn(move || {
        let code = wait_fn();
        {
            let mut guard = state.lock().unwrap();
            guard.status = ProcessStatus::Exited { code };
            guard.exited_at = Some((chrono::Utc::now().to_rfc3339(), Instant::now()));
        }
        debug!(process_id = %id, code, "child exited");

        std::thread::sleep(std::time::Duration::from_millis(DRAIN_GRACE_MS));
        if !drain_fired.swap(true, Ordering::SeqCst) {
            state.lock().unwrap().drained = true;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(cmdline: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::shell("sh");
        spec.args = vec!["-c".to_string(), cmdline.to_string()];
        spec
    }

    fn wait_exit(handle: &ProcHandle) {
        for _ in 0..100 {
            if !handle.is_running() && handle.drained() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        panic!("process did not exit in time");
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let handle = ProcHandle::spawn(sh("echo out; echo err 1>&2"), 0, None).unwrap();
        wait_exit(&handle);
        let log = handle.log(0, 1024);
        assert!(log.data.contains("out"));
        assert!(log.data.contains("err"));
        assert!(!log.truncated);
    }

    #[test]
    fn ring_cap_keeps_only_the_tail() {
        let mut spec = sh("i=0; while [ $i -lt 2000 ]; do echo line$i; i=$((i+1)); done");
        spec.buffer_max_bytes = 1024;
        let handle = ProcHandle::spawn(spec, 0, None).unwrap();
        wait_exit(&handle);

        let log = handle.log(0, 4096);
        assert!(log.truncated);
        assert!(log.data.len() <= 1024);
        assert!(log.data.contains("line1999"));
        assert!(!log.data.contains("line0\n"));
    }

    #[test]
    fn stdin_reaches_the_child() {
        let handle = ProcHandle::spawn(sh("read x; echo got:$x"), 0, None).unwrap();
        handle.write_stdin("ping\n").unwrap();
        wait_exit(&handle);
        assert!(handle.log(0, 256).data.contains("got:ping"));
    }

    #[test]
    fn kill_terminates_a_running_child() {
        let handle = ProcHandle::spawn(sh("sleep 30"), 0, None).unwrap();
        assert!(handle.is_running());
        handle.kill();
        wait_exit(&handle);
        assert!(matches!(handle.status(), ProcessStatus::Exited { .. }));
    }

    #[test]
    fn exit_code_is_recorded() {
        let handle = ProcHandle::spawn(sh("exit 7"), 0, None).unwrap();
        wait_exit(&handle);
        assert_eq!(handle.status(), ProcessStatus::Exited { code: Some(7) });
    }
}
