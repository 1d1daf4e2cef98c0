use serde::{Deserialize, Serialize};

/// Pulse event lifecycle. `pending → claimed → (completed | failed)`, with
/// retries looping a claimed event back to pending at a later `scheduled_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseState {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl PulseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PulseState::Pending => "pending",
            PulseState::Claimed => "claimed",
            PulseState::Completed => "completed",
            PulseState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "claimed" => PulseState::Claimed,
            "completed" => PulseState::Completed,
            "failed" => PulseState::Failed,
            _ => PulseState::Pending,
        }
    }
}

/// A durable scheduled event, processed at most once per claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseEvent {
    pub id: String,
    pub session_key: Option<String>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub scheduled_at: String,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
    pub worker_id: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: PulseState,
}

/// A recurring job driven by a cron expression. Firing enqueues a pulse
/// event; the planner recomputes `next_fire` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub expression: String,
    /// Pulse kind enqueued when the job fires.
    pub kind: String,
    pub payload: serde_json::Value,
    pub enabled: bool,
    pub next_fire: Option<String>,
    pub last_fire: Option<String>,
    pub created_at: String,
}
