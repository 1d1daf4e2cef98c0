//! Task tool: split a request into durable subtask rows the model can work
//! through and report against.

use std::sync::Arc;

use async_trait::async_trait;

use ocg_sessions::tasks::TaskStatus;
use ocg_sessions::TaskStore;

use super::{Tool, ToolResult};

pub struct TaskPlanTool {
    tasks: Arc<TaskStore>,
}

impl TaskPlanTool {
    pub fn new(tasks: Arc<TaskStore>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Tool for TaskPlanTool {
    fn name(&self) -> &str {
        "task_plan"
    }

    fn description(&self) -> &str {
        "Create a task split into ordered steps, or record a step result"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": {"type": "string", "description": "Task summary (create mode)"},
                "steps": {"type": "array", "description": "Step titles (create mode)"},
                "subtask_id": {"type": "string", "description": "Step to complete (update mode)"},
                "result": {"type": "string", "description": "Step outcome (update mode)"}
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        // update mode
        if let Some(subtask_id) = input["subtask_id"].as_str() {
            let result = input["result"].as_str().unwrap_or("done");
            return match self
                .tasks
                .complete_subtask(subtask_id, TaskStatus::Done, result)
            {
                Ok(()) => ToolResult::success(format!("subtask {subtask_id} completed")),
                Err(e) => ToolResult::error(format!("subtask update failed: {e}")),
            };
        }

        // create mode
        let description = input["description"].as_str().unwrap_or_default();
        if description.is_empty() {
            return ToolResult::error("provide either description+steps or subtask_id+result");
        }
        let steps: Vec<String> = input["steps"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        match self.tasks.create(description, &steps) {
            Ok(task) => {
                let mut lines = vec![format!("task {} created", task.id)];
                for sub in &task.subtasks {
                    lines.push(format!("  step {}: {} [{}]", sub.step, sub.title, sub.id));
                }
                ToolResult::success(lines.join("\n"))
            }
            Err(e) => ToolResult::error(format!("task create failed: {e}")),
        }
    }
}
