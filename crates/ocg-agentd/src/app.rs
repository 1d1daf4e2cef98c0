//! Explicit wiring: every subsystem is created here and shared by
//! reference. There are no module-level singletons.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ocg_agent::health::UnreachableProvider;
use ocg_agent::realtime_ws::WsRealtimeProvider;
use ocg_agent::tools::memory::{MemorySearchTool, MemoryStoreTool};
use ocg_agent::tools::process::{ProcessKillTool, ProcessLogTool, ProcessSpawnTool};
use ocg_agent::tools::pulse::PulseScheduleTool;
use ocg_agent::tools::tasks::TaskPlanTool;
use ocg_agent::{
    CompactionEngine, HealthManager, Provider, RealtimeCache, RealtimeProvider, ToolRegistry,
    TurnExecutor,
};
use ocg_core::config::AgentConfig;
use ocg_core::kv::KvStore;
use ocg_core::SessionKey;
use ocg_memory::{HttpEmbedder, MemoryStore};
use ocg_scheduler::{PulseQueue, SchedulerEngine};
use ocg_sessions::{SessionManager, TaskStore};
use ocg_supervisor::{Jail, Supervisor};

use crate::pulse_handlers::{HeartbeatHandler, ReminderHandler};

/// Pulse worker pool size.
const PULSE_WORKERS: usize = 4;
/// Heartbeat cron: every 10 minutes, offset to second 0.
const HEARTBEAT_EXPR: &str = "0 */10 * * * *";

pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub sessions: Arc<SessionManager>,
    pub memory: Arc<MemoryStore>,
    pub tasks: Arc<TaskStore>,
    pub pulse: Arc<PulseQueue>,
    pub supervisor: Arc<Supervisor>,
    pub health: Arc<HealthManager>,
    pub executor: Arc<TurnExecutor>,
    pub realtime: Arc<RealtimeCache>,
    pub kv: Arc<KvStore>,
    /// In-flight cancellable calls by request id (chat.abort).
    pub inflight: DashMap<String, CancellationToken>,
    /// Snapshot of the DB-persisted config layer, surfaced in stats.
    pub persisted_config: serde_json::Value,
    pub started_at: Instant,
    scheduler: std::sync::Mutex<Option<SchedulerEngine>>,
}

impl AppState {
    pub async fn build(config: AgentConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let open = |what: &str| -> anyhow::Result<rusqlite::Connection> {
            rusqlite::Connection::open(&config.db_path)
                .with_context(|| format!("open store for {what}"))
        };

        let sessions = Arc::new(SessionManager::new(open("sessions")?)?);
        let tasks = Arc::new(TaskStore::new(open("tasks")?)?);
        let pulse = Arc::new(PulseQueue::new(open("pulse")?)?);

        let persisted_config = {
            let conn = open("config")?;
            ocg_core::config::init_config_table(&conn)?;
            let pairs = ocg_core::config::list_config_values(&conn)?;
            serde_json::Value::Object(pairs.into_iter().collect())
        };

        // the embedding service must answer (with the right dimension) when
        // auto-recall depends on it; otherwise a dead service just degrades
        // recall
        let embedder = Arc::new(HttpEmbedder::new(
            config.embedding.url.clone(),
            config.embedding.model.clone(),
            config.embedding.dim,
            config.embedding.timeout_secs,
        )?);
        if config.recall.auto_recall {
            embedder
                .verify()
                .await
                .context("embedding service verification (required by AUTO_RECALL)")?;
        } else if let Err(e) = embedder.verify().await {
            warn!(error = %e, "embedding service unreachable — memory recall degraded");
        }
        let memory = Arc::new(MemoryStore::new(
            open("memory")?,
            embedder,
            Some(config.vector_index.clone()),
        )?);

        let supervisor = Arc::new(Supervisor::new());
        let kv = Arc::new(KvStore::from_config(config.kv_dir.clone())?);

        let providers: Vec<Arc<dyn Provider>> = if config.providers.is_empty() {
            warn!("no providers configured — chat calls will fail until one is added");
            vec![Arc::new(UnreachableProvider::new("unconfigured"))]
        } else {
            config
                .providers
                .iter()
                .map(|entry| {
                    let timeout = if entry.local {
                        300
                    } else {
                        config.turn.provider_timeout_secs
                    };
                    Arc::new(ocg_agent::openai::OpenAiProvider::new(
                        entry.id.clone(),
                        entry.api_key.clone(),
                        entry.base_url.clone(),
                        timeout,
                    )) as Arc<dyn Provider>
                })
                .collect()
        };
        let health = Arc::new(HealthManager::new(
            providers,
            config.health.failure_threshold,
            config.health.success_threshold,
            config.health.probe_timeout_secs,
            config.default_model.clone(),
        ));

        let compactor = Arc::new(CompactionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&health),
            config.compaction.clone(),
            config.default_model.clone(),
        ));

        let jail = match &config.workdir_root {
            Some(root) => Some(Jail::new(root).context("workdir jail root")?),
            None => None,
        };
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MemoryStoreTool::new(Arc::clone(&memory))));
        registry.register(Arc::new(MemorySearchTool::new(
            Arc::clone(&memory),
            config.recall.limit,
            config.recall.min_score,
            config.recall.alpha,
        )));
        registry.register(Arc::new(ProcessSpawnTool::new(Arc::clone(&supervisor), jail)));
        registry.register(Arc::new(ProcessLogTool::new(Arc::clone(&supervisor))));
        registry.register(Arc::new(ProcessKillTool::new(Arc::clone(&supervisor))));
        registry.register(Arc::new(PulseScheduleTool::new(Arc::clone(&pulse), None)));
        registry.register(Arc::new(TaskPlanTool::new(Arc::clone(&tasks))));

        let executor = Arc::new(TurnExecutor::new(
            Arc::clone(&config),
            Arc::clone(&sessions),
            Some(Arc::clone(&memory)),
            Arc::new(registry),
            Arc::clone(&health),
            Arc::clone(&compactor),
        ));

        let realtime_url = config.realtime.url.clone();
        let factory: Arc<dyn Fn(&SessionKey) -> Arc<dyn RealtimeProvider> + Send + Sync> =
            Arc::new(move |_key: &SessionKey| match &realtime_url {
                Some(url) => {
                    Arc::new(WsRealtimeProvider::new(url.clone())) as Arc<dyn RealtimeProvider>
                }
                None => Arc::new(NoRealtime) as Arc<dyn RealtimeProvider>,
            });
        let realtime = Arc::new(RealtimeCache::new(
            factory,
            Duration::from_secs(config.realtime.idle_secs),
        ));

        let mut scheduler = SchedulerEngine::new(Arc::clone(&pulse), PULSE_WORKERS);
        scheduler.register(
            "reminder",
            Arc::new(ReminderHandler::new(Arc::clone(&sessions))),
        );
        scheduler.register("heartbeat", Arc::new(HeartbeatHandler));
        seed_heartbeat(&pulse);

        Ok(Self {
            config,
            sessions,
            memory,
            tasks,
            pulse,
            supervisor,
            health,
            executor,
            realtime,
            kv,
            inflight: DashMap::new(),
            persisted_config,
            started_at: Instant::now(),
            scheduler: std::sync::Mutex::new(Some(scheduler)),
        })
    }

    /// Final cleanup after background tasks have drained.
    pub async fn shutdown_cleanup(&self) {
        self.supervisor.shutdown_all();
        self.realtime.shutdown_all().await;
        if let Err(e) = self.memory.save_snapshot() {
            warn!(error = %e, "vector index snapshot failed on shutdown");
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
    }
}

/// Spawn all long-lived background tasks.
pub fn start_background(
    state: &Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    if let Some(engine) = state.scheduler.lock().unwrap().take() {
        handles.extend(engine.start(shutdown.clone()));
    }
    handles.extend(state.supervisor.start_loops(shutdown.clone()));
    handles.push(
        state
            .realtime
            .start_janitor(Duration::from_secs(state.config.realtime.janitor_secs), shutdown.clone()),
    );
    if state.config.health.enabled && state.health.provider_count() > 0 {
        handles.push(
            state
                .health
                .start_loop(state.config.health.interval_secs, shutdown),
        );
    }
    handles
}

/// Make sure the standing heartbeat job exists; it exercises the pulse path
/// end to end.
fn seed_heartbeat(pulse: &PulseQueue) {
    match pulse.list_cron_jobs() {
        Ok(jobs) if jobs.iter().any(|j| j.kind == "heartbeat") => {}
        Ok(_) => {
            if let Err(e) = pulse.add_cron_job(HEARTBEAT_EXPR, "heartbeat", serde_json::Value::Null)
            {
                warn!(error = %e, "heartbeat cron seed failed");
            } else {
                info!(expression = HEARTBEAT_EXPR, "heartbeat cron job seeded");
            }
        }
        Err(e) => warn!(error = %e, "cron job listing failed"),
    }
}

/// Placeholder provider used when no realtime endpoint is configured.
struct NoRealtime;

#[async_trait::async_trait]
impl RealtimeProvider for NoRealtime {
    async fn connect(&self) -> Result<(), ocg_agent::ProviderError> {
        Err(ocg_agent::ProviderError::Unavailable(
            "no realtime provider configured".into(),
        ))
    }
    async fn send_audio(&self, _pcm: &[u8]) -> Result<(), ocg_agent::ProviderError> {
        Err(ocg_agent::ProviderError::Unavailable(
            "no realtime provider configured".into(),
        ))
    }
    async fn end_audio(&self) -> Result<(), ocg_agent::ProviderError> {
        Err(ocg_agent::ProviderError::Unavailable(
            "no realtime provider configured".into(),
        ))
    }
    async fn send_tool_response(
        &self,
        _call_id: &str,
        _content: &str,
    ) -> Result<(), ocg_agent::ProviderError> {
        Err(ocg_agent::ProviderError::Unavailable(
            "no realtime provider configured".into(),
        ))
    }
    async fn disconnect(&self) {}
    fn is_connected(&self) -> bool {
        false
    }
    fn take_events(&self) -> Option<tokio::sync::mpsc::Receiver<ocg_agent::RealtimeEvent>> {
        None
    }
}
