//! Provider health: periodic probes plus passive outcome recording, with
//! automatic fail-over to the highest-priority healthy provider.
//!
//! Providers keep their configured order; index 0 is the preferred primary.
//! After `failure_threshold` consecutive failures the active slot moves to
//! the best healthy candidate. Recovery is deliberate: once the original
//! primary has `success_threshold` consecutive successes, a manual
//! [`HealthManager::reset`] restores it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use ocg_core::Role;

use crate::provider::{ChatMessage, ChatRequest, ChatResponse, Provider, ProviderError};
use crate::stream::StreamEvent;

/// Audit trail length.
const MAX_EVENTS: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub at: String,
    pub provider: String,
    pub what: String,
}

#[derive(Debug, Default)]
struct ProviderState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_error: Option<String>,
    total_ok: u64,
    total_err: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub active: bool,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_ok: u64,
    pub total_err: u64,
    pub last_error: Option<String>,
}

pub struct HealthManager {
    /// Fixed priority order; index 0 is the configured primary.
    providers: Vec<Arc<dyn Provider>>,
    states: DashMap<String, ProviderState>,
    active: RwLock<usize>,
    events: Mutex<VecDeque<HealthEvent>>,
    failure_threshold: u32,
    success_threshold: u32,
    probe_timeout_secs: u64,
    probe_model: String,
}

impl HealthManager {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        failure_threshold: u32,
        success_threshold: u32,
        probe_timeout_secs: u64,
        probe_model: String,
    ) -> Self {
        assert!(!providers.is_empty(), "at least one provider is required");
        let states = DashMap::new();
        for p in &providers {
            states.insert(p.name().to_string(), ProviderState::default());
        }
        Self {
            providers,
            states,
            active: RwLock::new(0),
            events: Mutex::new(VecDeque::new()),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            probe_timeout_secs,
            probe_model,
        }
    }

    /// The current primary.
    pub fn active(&self) -> Arc<dyn Provider> {
        let idx = *self.active.read().unwrap();
        Arc::clone(&self.providers[idx])
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Record a successful real or probe request.
    pub fn record_success(&self, name: &str) {
        if let Some(mut state) = self.states.get_mut(name) {
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            state.total_ok += 1;
        }
    }

    /// Record a failure and fail over if the active provider just crossed
    /// the threshold.
    pub fn record_failure(&self, name: &str, error: &ProviderError) {
        let crossed = {
            let Some(mut state) = self.states.get_mut(name) else {
                return;
            };
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            state.total_err += 1;
            state.last_error = Some(error.to_string());
            state.consecutive_failures == self.failure_threshold
        };
        if crossed {
            self.push_event(name, "marked unhealthy");
            self.maybe_failover();
        }
    }

    fn is_healthy(&self, name: &str) -> bool {
        self.states
            .get(name)
            .map(|s| s.consecutive_failures < self.failure_threshold)
            .unwrap_or(false)
    }

    /// Swap the active slot to the highest-priority healthy provider when
    /// the current one is unhealthy.
    fn maybe_failover(&self) {
        let mut active = self.active.write().unwrap();
        let current = self.providers[*active].name().to_string();
        if self.is_healthy(&current) {
            return;
        }
        for (i, p) in self.providers.iter().enumerate() {
            if self.is_healthy(p.name()) {
                if i != *active {
                    warn!(from = %current, to = %p.name(), "provider fail-over");
                    self.push_event(p.name(), &format!("promoted to primary (was {current})"));
                    *active = i;
                }
                return;
            }
        }
        warn!("no healthy provider available — keeping current primary");
    }

    /// Manual reset: restore the configured primary, provided it has shown
    /// `success_threshold` consecutive successes since failing.
    pub fn reset(&self) -> bool {
        let original = self.providers[0].name().to_string();
        let recovered = self
            .states
            .get(&original)
            .map(|s| s.consecutive_successes >= self.success_threshold)
            .unwrap_or(false);
        if !recovered {
            return false;
        }
        let mut active = self.active.write().unwrap();
        if *active != 0 {
            info!(provider = %original, "primary restored by reset");
            self.push_event(&original, "restored as primary by reset");
            *active = 0;
        }
        true
    }

    /// Probe every provider with a short prompt and record the outcome.
    pub async fn probe_all(&self) {
        let req = ChatRequest {
            model: self.probe_model.clone(),
            messages: vec![ChatMessage::text(Role::User, "ping")],
            tools: Vec::new(),
            temperature: Some(0.0),
            max_tokens: 8,
            stream: false,
        };

        for provider in &self.providers {
            let name = provider.name().to_string();
            let outcome = tokio::time::timeout(
                std::time::Duration::from_secs(self.probe_timeout_secs),
                provider.chat(&req),
            )
            .await;
            match outcome {
                Ok(Ok(_)) => self.record_success(&name),
                Ok(Err(e)) => self.record_failure(&name, &e),
                Err(_) => self.record_failure(
                    &name,
                    &ProviderError::Unavailable("probe timed out".to_string()),
                ),
            }
        }
        // a probe round can also reveal the active provider went bad
        self.maybe_failover();
    }

    /// Periodic probe loop.
    pub fn start_loop(
        self: &Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval_secs)) => {
                        mgr.probe_all().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        })
    }

    fn push_event(&self, provider: &str, what: &str) {
        let mut events = self.events.lock().unwrap();
        events.push_back(HealthEvent {
            at: chrono::Utc::now().to_rfc3339(),
            provider: provider.to_string(),
            what: what.to_string(),
        });
        while events.len() > MAX_EVENTS {
            events.pop_front();
        }
    }

    pub fn events(&self) -> Vec<HealthEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        let active_idx = *self.active.read().unwrap();
        self.providers
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let name = p.name().to_string();
                let state = self.states.get(&name);
                ProviderSnapshot {
                    active: i == active_idx,
                    healthy: self.is_healthy(&name),
                    consecutive_failures: state.as_ref().map(|s| s.consecutive_failures).unwrap_or(0),
                    total_ok: state.as_ref().map(|s| s.total_ok).unwrap_or(0),
                    total_err: state.as_ref().map(|s| s.total_err).unwrap_or(0),
                    last_error: state.as_ref().and_then(|s| s.last_error.clone()),
                    name,
                }
            })
            .collect()
    }
}

/// A provider stub that always fails — used as a placeholder when config
/// names a provider the build does not know.
pub struct UnreachableProvider {
    name: String,
}

impl UnreachableProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl Provider for UnreachableProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> crate::provider::Capabilities {
        crate::provider::Capabilities::default()
    }

    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "provider {} is not configured",
            self.name
        )))
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
        _tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "provider {} is not configured",
            self.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyProvider {
        name: &'static str,
        broken: AtomicBool,
    }

    impl FlakyProvider {
        fn new(name: &'static str, broken: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                broken: AtomicBool::new(broken),
            })
        }
    }

    #[async_trait::async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> crate::provider::Capabilities {
            crate::provider::Capabilities {
                chat: true,
                ..Default::default()
            }
        }

        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.broken.load(Ordering::SeqCst) {
                Err(ProviderError::Unavailable("down".into()))
            } else {
                Ok(ChatResponse {
                    content: "pong".into(),
                    model: "m".into(),
                    tokens_in: 1,
                    tokens_out: 1,
                    stop_reason: "stop".into(),
                    tool_calls: Vec::new(),
                })
            }
        }
    }

    fn manager(primary_broken: bool) -> (Arc<FlakyProvider>, Arc<FlakyProvider>, HealthManager) {
        let a = FlakyProvider::new("alpha", primary_broken);
        let b = FlakyProvider::new("beta", false);
        let mgr = HealthManager::new(
            vec![Arc::clone(&a) as Arc<dyn Provider>, Arc::clone(&b) as Arc<dyn Provider>],
            3,
            2,
            5,
            "m".into(),
        );
        (a, b, mgr)
    }

    #[tokio::test]
    async fn failover_after_threshold_failures() {
        let (_a, _b, mgr) = manager(true);
        assert_eq!(mgr.active().name(), "alpha");

        for _ in 0..3 {
            mgr.probe_all().await;
        }
        assert_eq!(mgr.active().name(), "beta");
        assert!(mgr.events().iter().any(|e| e.what.contains("promoted")));
    }

    #[tokio::test]
    async fn reset_restores_recovered_primary() {
        let (a, _b, mgr) = manager(true);
        for _ in 0..3 {
            mgr.probe_all().await;
        }
        assert_eq!(mgr.active().name(), "beta");

        // primary has not recovered yet — reset refuses
        assert!(!mgr.reset());

        a.broken.store(false, Ordering::SeqCst);
        for _ in 0..2 {
            mgr.probe_all().await;
        }
        assert!(mgr.reset());
        assert_eq!(mgr.active().name(), "alpha");
    }

    #[tokio::test]
    async fn passive_outcomes_count_toward_failover() {
        let (_a, _b, mgr) = manager(false);
        let err = ProviderError::Unavailable("rate limit storm".into());
        for _ in 0..3 {
            mgr.record_failure("alpha", &err);
        }
        assert_eq!(mgr.active().name(), "beta");
    }
}
