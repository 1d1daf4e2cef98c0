use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ring::DEFAULT_BUFFER_MAX_BYTES;

/// Everything needed to (re)spawn a child process. Restarts reuse the spec
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Allocate a pseudo-terminal instead of pipes.
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_buffer_max")]
    pub buffer_max_bytes: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_restart_delay() -> u64 {
    2
}
fn default_buffer_max() -> usize {
    DEFAULT_BUFFER_MAX_BYTES
}

impl ProcessSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
            pty: false,
            auto_restart: false,
            max_retries: default_max_retries(),
            restart_delay_secs: default_restart_delay(),
            buffer_max_bytes: default_buffer_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum ProcessStatus {
    Running,
    Exited { code: Option<i32> },
}

/// Point-in-time snapshot of a managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub uses_pty: bool,
    pub status: ProcessStatus,
    pub created_at: String,
    pub exited_at: Option<String>,
    pub auto_restart: bool,
    pub current_retries: u32,
    pub max_retries: u32,
    pub last_restart_at: Option<String>,
}

/// A log read result surfaced to tools and RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSlice {
    /// Captured bytes, lossily decoded for transport.
    pub data: String,
    pub offset: u64,
    pub truncated: bool,
    pub total_written: u64,
}
