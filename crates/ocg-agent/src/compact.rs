//! Incremental compaction: archive the oldest active messages exactly once,
//! replace them with an LLM summary, and advance the watermark.
//!
//! The dangerous window is between the archive commit and the active-range
//! swap. Both sides are safe to retry: the archive upsert is absorbed by the
//! unique constraint, and the swap is a single transaction that re-reads the
//! watermark. A crash between the two simply re-runs summarisation.

use std::sync::Arc;

use tracing::{info, warn};

use ocg_core::config::CompactionConfig;
use ocg_core::{estimate, AgentError, Role, SessionKey};
use ocg_sessions::{SessionManager, StoredMessage};

use crate::health::HealthManager;
use crate::provider::{ChatMessage, ChatRequest};

/// Cap on the deterministic fallback summary.
const FALLBACK_SUMMARY_CHARS: usize = 2_000;

pub struct CompactionEngine {
    sessions: Arc<SessionManager>,
    health: Arc<HealthManager>,
    config: CompactionConfig,
    model: String,
}

impl CompactionEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        health: Arc<HealthManager>,
        config: CompactionConfig,
        model: String,
    ) -> Self {
        Self {
            sessions,
            health,
            config,
            model,
        }
    }

    /// Non-blocking trigger between turns: skip when a live turn holds the
    /// session lock.
    pub async fn try_compact(&self, key: &SessionKey) -> Result<bool, AgentError> {
        let handle = self.sessions.lock_handle(key);
        match handle.try_lock_owned() {
            Ok(_guard) => self.compact_locked(key).await,
            Err(_) => {
                info!(session = %key, "compaction deferred — session busy");
                Ok(false)
            }
        }
    }

    /// Run one compaction. The caller must hold the session's turn lock.
    /// Returns whether anything was archived.
    pub async fn compact_locked(&self, key: &SessionKey) -> Result<bool, AgentError> {
        let active = self.sessions.active_messages(key)?;
        let Some(cutoff) = self.choose_cutoff(&active) else {
            return Ok(false);
        };

        let watermark = self.sessions.meta(key)?.last_compacted_message_id;
        if cutoff <= watermark {
            return Ok(false);
        }

        let candidates = self.sessions.compaction_candidates(key, cutoff)?;
        if candidates.is_empty() {
            return Ok(false);
        }

        // step 1: durably archive before anything is deleted
        let archived = self.sessions.archive_messages(key, &candidates)?;

        // step 2: summarise (LLM, deterministic fallback on failure)
        let summary = self.summarize(&candidates).await;

        // step 3: atomic swap — delete candidates, insert summary, advance
        // watermark
        self.sessions.apply_compaction(key, cutoff, &summary)?;

        info!(
            session = %key,
            cutoff,
            candidates = candidates.len(),
            newly_archived = archived,
            "session compacted"
        );
        Ok(true)
    }

    /// Pick the largest id to archive so the kept tail satisfies the keep
    /// budget: the last `keep_messages` messages or the last `keep_tokens`
    /// tokens, whichever keeps more.
    fn choose_cutoff(&self, active: &[StoredMessage]) -> Option<i64> {
        if active.is_empty() {
            return None;
        }

        let keep_start_by_count = active.len().saturating_sub(self.config.keep_messages);

        let mut tokens: u64 = 0;
        let mut keep_start_by_tokens = 0usize;
        for (i, msg) in active.iter().enumerate().rev() {
            tokens += estimate::estimate_message(&msg.content);
            if tokens > self.config.keep_tokens {
                keep_start_by_tokens = i + 1;
                break;
            }
        }

        // whichever budget keeps more messages wins
        let keep_start = keep_start_by_count.min(keep_start_by_tokens);
        if keep_start == 0 {
            return None;
        }
        Some(active[keep_start - 1].message_id)
    }

    async fn summarize(&self, candidates: &[StoredMessage]) -> String {
        let transcript: String = candidates
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::text(Role::System, self.config.summary_instruction.clone()),
                ChatMessage::text(Role::User, transcript.clone()),
            ],
            tools: Vec::new(),
            temperature: Some(self.config.summary_temperature),
            max_tokens: 1024,
            stream: false,
        };

        let provider = self.health.active();
        let text = match provider.chat(&req).await {
            Ok(resp) if !resp.content.trim().is_empty() => {
                self.health.record_success(provider.name());
                resp.content.trim().to_string()
            }
            Ok(_) => fallback_summary(&transcript),
            Err(e) => {
                warn!(error = %e, "summarisation call failed — using fallback");
                self.health.record_failure(provider.name(), &e);
                fallback_summary(&transcript)
            }
        };
        format!("[summary] {text}")
    }
}

/// Deterministic fallback: the head of the transcript, truncated on a char
/// boundary.
fn fallback_summary(transcript: &str) -> String {
    if transcript.len() <= FALLBACK_SUMMARY_CHARS {
        return transcript.to_string();
    }
    let mut end = FALLBACK_SUMMARY_CHARS;
    while end > 0 && !transcript.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} …(earlier conversation, truncated)", &transcript[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Capabilities, ChatResponse, Provider, ProviderError};
    use async_trait::async_trait;
    use ocg_sessions::NewMessage;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SummaryProvider {
        broken: AtomicBool,
    }

    #[async_trait]
    impl Provider for SummaryProvider {
        fn name(&self) -> &str {
            "mock"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                chat: true,
                ..Default::default()
            }
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("down".into()));
            }
            Ok(ChatResponse {
                content: "the user discussed ten things".into(),
                model: "mock".into(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "stop".into(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn engine(broken: bool) -> (Arc<SessionManager>, CompactionEngine) {
        let sessions = Arc::new(SessionManager::new(Connection::open_in_memory().unwrap()).unwrap());
        let provider = Arc::new(SummaryProvider {
            broken: AtomicBool::new(broken),
        });
        let health = Arc::new(HealthManager::new(
            vec![provider as Arc<dyn Provider>],
            3,
            2,
            5,
            "mock".into(),
        ));
        let config = CompactionConfig {
            keep_messages: 4,
            // tiny token budget so the message-count budget decides the keep
            keep_tokens: 1,
            ..CompactionConfig::default()
        };
        let engine = CompactionEngine::new(Arc::clone(&sessions), health, config, "mock".into());
        (sessions, engine)
    }

    fn seed(sessions: &SessionManager, key: &SessionKey, n: usize) {
        let msgs: Vec<NewMessage> = (0..n)
            .map(|i| NewMessage::text(if i % 2 == 0 { Role::User } else { Role::Assistant }, format!("message number {i}")))
            .collect();
        sessions.append_messages(key, &msgs).unwrap();
    }

    #[tokio::test]
    async fn compaction_archives_and_summarises() {
        let (sessions, engine) = engine(false);
        let key = SessionKey::from("s1");
        seed(&sessions, &key, 10);

        assert!(engine.compact_locked(&key).await.unwrap());

        let meta = sessions.meta(&key).unwrap();
        assert_eq!(meta.last_compacted_message_id, 6);
        assert_eq!(sessions.archive_rows(&key).unwrap().len(), 6);

        let active = sessions.active_messages(&key).unwrap();
        assert!(active[0].is_summary);
        assert!(active[0].content.starts_with("[summary] "));
        assert_eq!(active.len(), 5); // summary + kept 4
    }

    #[tokio::test]
    async fn repeated_compaction_without_new_messages_is_noop() {
        let (sessions, engine) = engine(false);
        let key = SessionKey::from("s1");
        seed(&sessions, &key, 10);

        assert!(engine.compact_locked(&key).await.unwrap());
        let first = sessions.meta(&key).unwrap();
        assert!(!engine.compact_locked(&key).await.unwrap());
        let second = sessions.meta(&key).unwrap();

        assert_eq!(first.last_compacted_message_id, second.last_compacted_message_id);
        assert_eq!(first.compaction_count, second.compaction_count);
        assert_eq!(sessions.archive_rows(&key).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn crash_between_archive_and_swap_never_duplicates() {
        let (sessions, engine) = engine(false);
        let key = SessionKey::from("s1");
        seed(&sessions, &key, 100);

        // simulate the first run dying after step 1: archive the exact
        // candidate set, then "crash" before the swap
        let candidates = sessions.compaction_candidates(&key, 96).unwrap();
        sessions.archive_messages(&key, &candidates).unwrap();

        // the retry runs the whole sequence
        assert!(engine.compact_locked(&key).await.unwrap());

        let rows = sessions.archive_rows(&key).unwrap();
        let mut ids: Vec<i64> = rows.iter().map(|r| r.source_message_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 96);
        assert_eq!(sessions.meta(&key).unwrap().last_compacted_message_id, 96);
        let summaries = sessions
            .active_messages(&key)
            .unwrap()
            .into_iter()
            .filter(|m| m.is_summary)
            .count();
        assert_eq!(summaries, 1);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_deterministic_summary() {
        let (sessions, engine) = engine(true);
        let key = SessionKey::from("s1");
        seed(&sessions, &key, 10);

        assert!(engine.compact_locked(&key).await.unwrap());
        let active = sessions.active_messages(&key).unwrap();
        assert!(active[0].is_summary);
        // fallback embeds the original transcript text
        assert!(active[0].content.contains("message number 0"));
    }

    #[tokio::test]
    async fn try_compact_defers_when_session_is_busy() {
        let (sessions, engine) = engine(false);
        let key = SessionKey::from("s1");
        seed(&sessions, &key, 10);

        let handle = sessions.lock_handle(&key);
        let _guard = handle.lock().await;
        assert!(!engine.try_compact(&key).await.unwrap());
        drop(_guard);
        assert!(engine.try_compact(&key).await.unwrap());
    }

    #[test]
    fn cutoff_respects_token_budget_when_it_keeps_more() {
        let sessions = Arc::new(SessionManager::new(Connection::open_in_memory().unwrap()).unwrap());
        let provider = Arc::new(SummaryProvider { broken: AtomicBool::new(false) });
        let health = Arc::new(HealthManager::new(vec![provider as Arc<dyn Provider>], 3, 2, 5, "m".into()));
        let config = CompactionConfig {
            keep_messages: 2,
            keep_tokens: 1_000_000, // token budget keeps everything
            ..CompactionConfig::default()
        };
        let engine = CompactionEngine::new(Arc::clone(&sessions), health, config, "m".into());

        let key = SessionKey::from("s1");
        seed(&sessions, &key, 6);
        let active = sessions.active_messages(&key).unwrap();
        // the huge token budget keeps all messages, so nothing is archived
        assert!(engine.choose_cutoff(&active).is_none());
    }
}
