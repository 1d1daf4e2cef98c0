//! Realtime session cache: one long-lived bidirectional audio provider per
//! session key, an idle janitor, and the per-session mutex that serialises
//! concurrent audio RPCs.
//!
//! Providers never back-reference sessions — they emit [`RealtimeEvent`]s on
//! a bounded channel that the daemon consumes and routes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use ocg_core::SessionKey;

use crate::provider::{ProviderError, ToolCall};

/// Bounded event queue per realtime session.
pub const REALTIME_EVENT_CAP: usize = 64;

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// Assistant text (incremental).
    Text(String),
    /// Assistant audio (PCM 16-bit LE).
    Audio(Vec<u8>),
    /// User speech transcription.
    Transcription { text: String, is_final: bool },
    /// The model requested a tool call mid-conversation.
    ToolCall(ToolCall),
    /// Voice-activity detection state change.
    Vad { speaking: bool },
    /// Usage accounting for the session so far.
    Usage { tokens_in: u32, tokens_out: u32 },
    /// The provider closed the session.
    Closed,
    Error(String),
}

/// A bidirectional audio session with a supporting provider.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    async fn connect(&self) -> Result<(), ProviderError>;
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), ProviderError>;
    /// Signal end of the user's audio turn.
    async fn end_audio(&self) -> Result<(), ProviderError>;
    async fn send_tool_response(&self, call_id: &str, content: &str) -> Result<(), ProviderError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    /// Take the event receiver. Single consumer; later calls return `None`.
    fn take_events(&self) -> Option<mpsc::Receiver<RealtimeEvent>>;
}

type ProviderFactory =
    dyn Fn(&SessionKey) -> Arc<dyn RealtimeProvider> + Send + Sync;

struct CacheEntry {
    provider: Arc<dyn RealtimeProvider>,
    last_used: Instant,
}

pub struct RealtimeCache {
    entries: DashMap<String, CacheEntry>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    factory: Arc<ProviderFactory>,
    idle: Duration,
}

impl RealtimeCache {
    pub fn new(factory: Arc<ProviderFactory>, idle: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            factory,
            idle,
        }
    }

    /// The per-session mutex. Concurrent audio RPCs on one key serialise on
    /// this lock; the lock map itself is guarded by the DashMap shards.
    pub fn session_lock(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The cached provider, if still connected. Touches the idle clock.
    pub fn get_cached(&self, key: &SessionKey) -> Option<Arc<dyn RealtimeProvider>> {
        let mut entry = self.entries.get_mut(key.as_str())?;
        if !entry.provider.is_connected() {
            drop(entry);
            self.entries.remove(key.as_str());
            return None;
        }
        entry.last_used = Instant::now();
        Some(Arc::clone(&entry.provider))
    }

    /// Cached provider or a fresh connection.
    pub async fn get_or_connect(
        &self,
        key: &SessionKey,
    ) -> Result<Arc<dyn RealtimeProvider>, ProviderError> {
        if let Some(provider) = self.get_cached(key) {
            return Ok(provider);
        }
        let provider = (self.factory)(key);
        provider.connect().await?;
        info!(session = %key, "realtime session opened");
        self.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                provider: Arc::clone(&provider),
                last_used: Instant::now(),
            },
        );
        Ok(provider)
    }

    /// Drop one session, closing its provider.
    pub async fn remove(&self, key: &SessionKey) {
        if let Some((_, entry)) = self.entries.remove(key.as_str()) {
            entry.provider.disconnect().await;
            info!(session = %key, "realtime session closed");
        }
    }

    /// Close sessions idle past the threshold. Returns the closed keys.
    pub async fn janitor_sweep(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().last_used.elapsed() >= self.idle)
            .map(|e| e.key().clone())
            .collect();

        let mut closed = Vec::new();
        for key in expired {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.provider.disconnect().await;
                info!(session = %key, "idle realtime session closed by janitor");
                closed.push(key);
            }
        }
        closed
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Periodic janitor loop.
    pub fn start_janitor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let closed = cache.janitor_sweep().await;
                        if !closed.is_empty() {
                            warn!(count = closed.len(), "realtime janitor closed idle sessions");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        })
    }

    /// Close everything. Called on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.provider.disconnect().await;
            }
        }
    }

    #[cfg(test)]
    fn age_entry(&self, key: &SessionKey, by: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key.as_str()) {
            entry.last_used = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockRealtime {
        connected: AtomicBool,
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RealtimeProvider for MockRealtime {
        async fn connect(&self) -> Result<(), ProviderError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn send_audio(&self, _pcm: &[u8]) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn end_audio(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn send_tool_response(&self, _id: &str, _content: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn take_events(&self) -> Option<mpsc::Receiver<RealtimeEvent>> {
            None
        }
    }

    fn cache(idle: Duration) -> (Arc<RealtimeCache>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&disconnects);
        let c = Arc::clone(&connects);
        let factory: Arc<ProviderFactory> = Arc::new(move |_key: &SessionKey| {
            c.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockRealtime {
                connected: AtomicBool::new(false),
                disconnects: Arc::clone(&d),
            }) as Arc<dyn RealtimeProvider>
        });
        (
            Arc::new(RealtimeCache::new(factory, idle)),
            connects,
            disconnects,
        )
    }

    #[tokio::test]
    async fn cached_provider_is_reused() {
        let (cache, connects, _) = cache(Duration::from_secs(300));
        let key = SessionKey::from("voice_1");

        cache.get_or_connect(&key).await.unwrap();
        cache.get_or_connect(&key).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.active_count(), 1);
    }

    #[tokio::test]
    async fn janitor_closes_idle_and_next_call_reconnects() {
        let (cache, connects, disconnects) = cache(Duration::from_secs(300));
        let key = SessionKey::from("voice_1");

        cache.get_or_connect(&key).await.unwrap();
        cache.age_entry(&key, Duration::from_secs(360));

        let closed = cache.janitor_sweep().await;
        assert_eq!(closed, vec!["voice_1".to_string()]);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.active_count(), 0);

        // transparently reopens on next use
        cache.get_or_connect(&key).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recently_used_sessions_survive_the_sweep() {
        let (cache, _, disconnects) = cache(Duration::from_secs(300));
        let key = SessionKey::from("voice_1");
        cache.get_or_connect(&key).await.unwrap();

        assert!(cache.janitor_sweep().await.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnected_provider_is_not_served_from_cache() {
        let (cache, connects, _) = cache(Duration::from_secs(300));
        let key = SessionKey::from("voice_1");

        let provider = cache.get_or_connect(&key).await.unwrap();
        provider.disconnect().await;

        assert!(cache.get_cached(&key).is_none());
        cache.get_or_connect(&key).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_lock_serialises_concurrent_calls() {
        let (cache, _, _) = cache(Duration::from_secs(300));
        let key = SessionKey::from("voice_1");

        let lock = cache.session_lock(&key);
        let guard = lock.lock().await;
        let second = cache.session_lock(&key);
        assert!(second.try_lock().is_err());
        drop(guard);
        assert!(second.try_lock().is_ok());
    }
}
