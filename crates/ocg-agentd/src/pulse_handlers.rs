//! Pulse event handlers owned by the daemon.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use ocg_core::{Role, SessionKey};
use ocg_scheduler::{PulseEvent, PulseHandler};
use ocg_sessions::{NewMessage, SessionManager};

/// Delivers fired reminders into the owning session's history, where the
/// next turn (or the gateway's session poll) picks them up.
pub struct ReminderHandler {
    sessions: Arc<SessionManager>,
}

impl ReminderHandler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl PulseHandler for ReminderHandler {
    async fn handle(&self, event: &PulseEvent) -> Result<(), String> {
        let message = event.payload["message"].as_str().unwrap_or("reminder");
        let key: SessionKey = event.session_key.clone().into();

        self.sessions
            .append_messages(
                &key,
                &[NewMessage::text(
                    Role::System,
                    format!("[reminder fired] {message}"),
                )],
            )
            .map_err(|e| e.to_string())?;

        info!(session = %key, event_id = %event.id, "reminder delivered");
        Ok(())
    }
}

/// Standing heartbeat job — proves the cron → pulse → worker path is alive.
pub struct HeartbeatHandler;

#[async_trait]
impl PulseHandler for HeartbeatHandler {
    async fn handle(&self, event: &PulseEvent) -> Result<(), String> {
        debug!(event_id = %event.id, "heartbeat");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocg_scheduler::PulseState;

    #[tokio::test]
    async fn reminder_lands_in_session_history() {
        let sessions = Arc::new(
            SessionManager::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap(),
        );
        let handler = ReminderHandler::new(Arc::clone(&sessions));

        let event = PulseEvent {
            id: "ev1".into(),
            session_key: Some("tg_42".into()),
            kind: "reminder".into(),
            payload: serde_json::json!({"message": "stand up"}),
            scheduled_at: chrono::Utc::now().to_rfc3339(),
            claimed_at: None,
            completed_at: None,
            worker_id: None,
            attempts: 0,
            max_attempts: 3,
            state: PulseState::Claimed,
        };

        handler.handle(&event).await.unwrap();

        let history = sessions
            .active_messages(&SessionKey::from("tg_42"))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].content.contains("stand up"));
        assert_eq!(history[0].role, Role::System);
    }
}
