//! Process tools: spawn supervised children, read their ring-buffered
//! output, and kill them. Workdirs resolve through the jail.

use std::sync::Arc;

use async_trait::async_trait;

use ocg_supervisor::{Jail, ProcessSpec, Supervisor};

use super::{Tool, ToolResult};

pub struct ProcessSpawnTool {
    supervisor: Arc<Supervisor>,
    jail: Option<Jail>,
}

impl ProcessSpawnTool {
    pub fn new(supervisor: Arc<Supervisor>, jail: Option<Jail>) -> Self {
        Self { supervisor, jail }
    }
}

#[async_trait]
impl Tool for ProcessSpawnTool {
    fn name(&self) -> &str {
        "process_spawn"
    }

    fn description(&self) -> &str {
        "Start a supervised background process; returns its id for later log reads"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "args": {"type": "array"},
                "workdir": {"type": "string"},
                "pty": {"type": "boolean"},
                "auto_restart": {"type": "boolean"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let command = input["command"].as_str().unwrap_or_default();
        if command.is_empty() {
            return ToolResult::error("command must not be empty");
        }

        let mut spec = ProcessSpec::shell(command);
        spec.args = input["args"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        spec.pty = input["pty"].as_bool().unwrap_or(false);
        spec.auto_restart = input["auto_restart"].as_bool().unwrap_or(false);

        if let Some(dir) = input["workdir"].as_str() {
            match &self.jail {
                Some(jail) => match jail.resolve(dir) {
                    Ok(resolved) => spec.workdir = Some(resolved),
                    Err(e) => return ToolResult::error(format!("workdir rejected: {e}")),
                },
                None => spec.workdir = Some(dir.into()),
            }
        }

        match self.supervisor.spawn(spec) {
            Ok(info) => ToolResult::success(format!(
                "spawned process {} (pid {})",
                info.id,
                info.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
            )),
            Err(e) => ToolResult::error(format!("spawn failed: {e}")),
        }
    }
}

pub struct ProcessLogTool {
    supervisor: Arc<Supervisor>,
}

impl ProcessLogTool {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for ProcessLogTool {
    fn name(&self) -> &str {
        "process_log"
    }

    fn description(&self) -> &str {
        "Read captured output from a supervised process"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "offset": {"type": "integer"},
                "limit": {"type": "integer"}
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let id = input["id"].as_str().unwrap_or_default();
        let offset = input["offset"].as_u64().unwrap_or(0);
        let limit = input["limit"].as_u64().map(|n| n as usize).unwrap_or(16 * 1024);

        match self.supervisor.log(id, offset, limit) {
            Ok(slice) => {
                let mut out = String::new();
                if slice.truncated {
                    out.push_str("[older output truncated]\n");
                }
                // strip terminal escapes so the model sees clean text
                let clean = strip_ansi_escapes::strip(slice.data.as_bytes());
                out.push_str(&String::from_utf8_lossy(&clean));
                ToolResult::success(out)
            }
            Err(e) => ToolResult::error(format!("log read failed: {e}")),
        }
    }
}

pub struct ProcessKillTool {
    supervisor: Arc<Supervisor>,
}

impl ProcessKillTool {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for ProcessKillTool {
    fn name(&self) -> &str {
        "process_kill"
    }

    fn description(&self) -> &str {
        "Terminate a supervised process"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "id": {"type": "string"} },
            "required": ["id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let id = input["id"].as_str().unwrap_or_default();
        match self.supervisor.kill(id) {
            Ok(()) => ToolResult::success(format!("process {id} killed")),
            Err(e) => ToolResult::error(format!("kill failed: {e}")),
        }
    }
}
