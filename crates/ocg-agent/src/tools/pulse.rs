//! Pulse tool: schedule a future event (reminder-style) through the durable
//! queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use ocg_scheduler::PulseQueue;

use super::{Tool, ToolResult};

pub struct PulseScheduleTool {
    queue: Arc<PulseQueue>,
    session_key: Option<String>,
}

impl PulseScheduleTool {
    /// `session_key` binds scheduled events back to the conversation that
    /// created them.
    pub fn new(queue: Arc<PulseQueue>, session_key: Option<String>) -> Self {
        Self { queue, session_key }
    }
}

#[async_trait]
impl Tool for PulseScheduleTool {
    fn name(&self) -> &str {
        "pulse_schedule"
    }

    fn description(&self) -> &str {
        "Schedule a reminder or follow-up to fire at a later time"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "What to deliver when the event fires"},
                "at": {"type": "string", "description": "RFC3339 instant"},
                "delay_secs": {"type": "integer", "description": "Alternative to 'at'"}
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let message = input["message"].as_str().unwrap_or_default();
        if message.is_empty() {
            return ToolResult::error("message must not be empty");
        }

        let scheduled_at = if let Some(at) = input["at"].as_str() {
            match DateTime::parse_from_rfc3339(at) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => return ToolResult::error(format!("bad 'at' timestamp: {e}")),
            }
        } else {
            input["delay_secs"]
                .as_i64()
                .map(|secs| Utc::now() + Duration::seconds(secs.max(0)))
        };

        let payload = serde_json::json!({ "message": message });
        match self.queue.enqueue(
            "reminder",
            payload,
            self.session_key.as_deref(),
            scheduled_at,
            3,
        ) {
            Ok(event) => ToolResult::success(format!(
                "reminder {} scheduled for {}",
                event.id, event.scheduled_at
            )),
            Err(e) => ToolResult::error(format!("schedule failed: {e}")),
        }
    }
}
