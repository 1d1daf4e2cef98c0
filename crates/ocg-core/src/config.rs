use std::collections::HashMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Default context window used when a model is missing from the `models` map.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 128_000;

/// Top-level agent configuration.
///
/// Layering (lowest to highest): built-in defaults, DB-persisted `config`
/// table, TOML file, environment. `FORCE_ENV_CONFIG=true` drops the DB layer
/// on boot so the environment fully defines the running config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// RPC socket path. Defaults to `ocg-agent.sock` in the OS temp dir.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// SQLite store path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Context window (tokens) per model name.
    #[serde(default)]
    pub models: HashMap<String, u64>,

    /// Model used when a request does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default)]
    pub recall: RecallConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// HNSW index snapshot path.
    #[serde(default = "default_vector_index")]
    pub vector_index: PathBuf,

    #[serde(default)]
    pub health: HealthConfig,

    /// Persistent KV cache directory. Empty/absent means in-memory only.
    #[serde(default)]
    pub kv_dir: Option<PathBuf>,

    /// Allow-list root for path-taking tools. Absent disables the jail.
    #[serde(default)]
    pub workdir_root: Option<PathBuf>,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Configured providers, highest priority first.
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,

    /// When true the DB-persisted config layer is ignored on boot.
    #[serde(default)]
    pub force_env_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Inject hybrid-search memories into each turn.
    #[serde(default)]
    pub auto_recall: bool,
    #[serde(default = "default_recall_limit")]
    pub limit: usize,
    #[serde(default = "default_recall_min_score")]
    pub min_score: f32,
    /// Vector weight in the hybrid blend (keyword weight is `1 - alpha`).
    #[serde(default = "default_recall_alpha")]
    pub alpha: f32,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            auto_recall: false,
            limit: default_recall_limit(),
            min_score: default_recall_min_score(),
            alpha: default_recall_alpha(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding service base URL (POST `/embed`).
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Declared vector dimension, verified on startup.
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            dim: default_embedding_dim(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum tool invocations per turn.
    #[serde(default = "default_tool_budget")]
    pub tool_budget: u32,
    /// Identical (tool, args) calls allowed per turn before refusal.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    /// Tool result size cap before head/tail truncation.
    #[serde(default = "default_tool_result_max_bytes")]
    pub tool_result_max_bytes: usize,
    /// Wall-clock bound per tool invocation.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Provider retries on transport failure before fail-over.
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,
    /// Provider call deadline.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    /// Tool results older than this are dropped by the pruning pass.
    #[serde(default = "default_prune_days")]
    pub prune_days: i64,
    /// Keep partially-generated assistant output when a call is cancelled.
    #[serde(default)]
    pub persist_on_cancel: bool,
    /// Completion cap sent to the provider.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// RPC deadline for chat calls.
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            tool_budget: default_tool_budget(),
            loop_threshold: default_loop_threshold(),
            tool_result_max_bytes: default_tool_result_max_bytes(),
            tool_timeout_secs: default_tool_timeout(),
            provider_retries: default_provider_retries(),
            provider_timeout_secs: default_provider_timeout(),
            prune_days: default_prune_days(),
            persist_on_cancel: false,
            max_tokens: default_max_tokens(),
            chat_timeout_secs: default_chat_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Pruning kicks in above this estimate.
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: u64,
    /// Compaction is scheduled above this estimate.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: u64,
    /// The turn fails with a context error above this estimate.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: u64,
    /// Keep at least this many trailing messages out of the archive range.
    #[serde(default = "default_keep_messages")]
    pub keep_messages: usize,
    /// Keep at least this many trailing tokens out of the archive range.
    #[serde(default = "default_keep_tokens")]
    pub keep_tokens: u64,
    /// Summarisation sampling temperature.
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,
    /// Summarisation instruction sent to the model.
    #[serde(default = "default_summary_instruction")]
    pub summary_instruction: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            prune_threshold: default_prune_threshold(),
            compact_threshold: default_compact_threshold(),
            hard_limit: default_hard_limit(),
            keep_messages: default_keep_messages(),
            keep_tokens: default_keep_tokens(),
            summary_temperature: default_summary_temperature(),
            summary_instruction: default_summary_instruction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Realtime provider WebSocket endpoint, when configured.
    #[serde(default)]
    pub url: Option<String>,
    /// Idle providers are closed after this long without use.
    #[serde(default = "default_realtime_idle")]
    pub idle_secs: u64,
    /// Janitor sweep cadence.
    #[serde(default = "default_realtime_janitor")]
    pub janitor_secs: u64,
    /// RPC deadline for audio calls.
    #[serde(default = "default_realtime_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            idle_secs: default_realtime_idle(),
            janitor_secs: default_realtime_janitor(),
            call_timeout_secs: default_realtime_timeout(),
        }
    }
}

/// One configured LLM provider. Priority follows list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Local models get the longer provider deadline.
    #[serde(default)]
    pub local: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            db_path: default_db_path(),
            models: HashMap::new(),
            default_model: default_model(),
            recall: RecallConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_index: default_vector_index(),
            health: HealthConfig::default(),
            kv_dir: None,
            workdir_root: None,
            turn: TurnConfig::default(),
            compaction: CompactionConfig::default(),
            realtime: RealtimeConfig::default(),
            providers: Vec::new(),
            force_env_config: false,
        }
    }
}

impl AgentConfig {
    /// Load config without a DB layer (used before the store is open).
    pub fn load(toml_path: Option<&str>) -> Result<Self> {
        Self::figment(toml_path, None)
            .extract()
            .map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Load config with the DB-persisted layer merged below file and env.
    ///
    /// The DB layer is skipped entirely when `FORCE_ENV_CONFIG=true` is set
    /// in the environment, letting the environment override persisted state.
    pub fn load_with_db(toml_path: Option<&str>, conn: &Connection) -> Result<Self> {
        let force = std::env::var("FORCE_ENV_CONFIG")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let db_layer = if force {
            debug!("FORCE_ENV_CONFIG set — skipping DB config layer");
            None
        } else {
            Some(read_db_layer(conn)?)
        };
        Self::figment(toml_path, db_layer)
            .extract()
            .map_err(|e| AgentError::Config(e.to_string()))
    }

    fn figment(toml_path: Option<&str>, db_layer: Option<serde_json::Value>) -> Figment {
        let mut fig = Figment::from(Serialized::defaults(AgentConfig::default()));
        if let Some(layer) = db_layer {
            fig = fig.merge(Serialized::defaults(layer));
        }
        let path = toml_path
            .map(str::to_string)
            .or_else(|| std::env::var("OCG_CONFIG").ok())
            .unwrap_or_else(|| "ocg.toml".to_string());
        fig = fig.merge(Toml::file(path));
        fig = fig.merge(Serialized::defaults(env_alias_layer()));
        fig.merge(Env::prefixed("OCG_").split("__"))
    }

    /// Context window for `model`, falling back to the built-in default.
    pub fn context_window(&self, model: &str) -> u64 {
        self.models
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    /// Validate cross-field invariants after loading.
    pub fn validate(&self) -> Result<()> {
        let c = &self.compaction;
        if !(c.prune_threshold <= c.compact_threshold && c.compact_threshold <= c.hard_limit) {
            return Err(AgentError::Config(format!(
                "compaction thresholds must satisfy prune ({}) <= compact ({}) <= hard ({})",
                c.prune_threshold, c.compact_threshold, c.hard_limit
            )));
        }
        if self.embedding.dim == 0 {
            return Err(AgentError::Config("embedding dim must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.recall.alpha) {
            return Err(AgentError::Config("recall alpha must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Expected value shape of an unprefixed env alias.
#[derive(Clone, Copy)]
enum EnvKind {
    Bool,
    Int,
    Float,
    Text,
}

/// Unprefixed environment keys recognised for operator convenience.
/// Each maps onto a dotted config path; `MODELS` carries a JSON object.
const ENV_ALIASES: &[(&str, &str, EnvKind)] = &[
    ("SOCKET_PATH", "socket_path", EnvKind::Text),
    ("DB_PATH", "db_path", EnvKind::Text),
    ("AUTO_RECALL", "recall.auto_recall", EnvKind::Bool),
    ("RECALL_LIMIT", "recall.limit", EnvKind::Int),
    ("RECALL_MINSCORE", "recall.min_score", EnvKind::Float),
    ("VECTOR_INDEX", "vector_index", EnvKind::Text),
    ("EMBEDDING_URL", "embedding.url", EnvKind::Text),
    ("EMBEDDING_MODEL", "embedding.model", EnvKind::Text),
    ("EMBEDDING_DIM", "embedding.dim", EnvKind::Int),
    ("HEALTH_CHECK", "health.enabled", EnvKind::Bool),
    ("HEALTH_INTERVAL", "health.interval_secs", EnvKind::Int),
    ("HEALTH_FAILURE_THRESHOLD", "health.failure_threshold", EnvKind::Int),
    ("KV_DIR", "kv_dir", EnvKind::Text),
    ("FORCE_ENV_CONFIG", "force_env_config", EnvKind::Bool),
];

fn env_alias_layer() -> serde_json::Value {
    let mut root = serde_json::Map::new();
    for (env_key, dotted, kind) in ENV_ALIASES {
        if let Ok(raw) = std::env::var(env_key) {
            match coerce_scalar(&raw, *kind) {
                Some(value) => insert_dotted(&mut root, dotted, value),
                None => warn!(key = env_key, value = %raw, "unparseable env override — ignored"),
            }
        }
    }
    if let Ok(raw) = std::env::var("MODELS") {
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(v) if v.is_object() => {
                root.insert("models".to_string(), v);
            }
            _ => warn!("MODELS env var is not a JSON object — ignored"),
        }
    }
    serde_json::Value::Object(root)
}

fn coerce_scalar(raw: &str, kind: EnvKind) -> Option<serde_json::Value> {
    match kind {
        EnvKind::Bool => match raw {
            "1" | "true" | "yes" => Some(serde_json::Value::Bool(true)),
            "0" | "false" | "no" => Some(serde_json::Value::Bool(false)),
            _ => None,
        },
        EnvKind::Int => raw.parse::<i64>().ok().map(|n| serde_json::json!(n)),
        EnvKind::Float => raw.parse::<f64>().ok().map(|f| serde_json::json!(f)),
        EnvKind::Text => Some(serde_json::Value::String(raw.to_string())),
    }
}

fn insert_dotted(root: &mut serde_json::Map<String, serde_json::Value>, dotted: &str, value: serde_json::Value) {
    let mut parts = dotted.splitn(2, '.');
    let head = parts.next().unwrap_or_default().to_string();
    match parts.next() {
        None => {
            root.insert(head, value);
        }
        Some(rest) => {
            let entry = root
                .entry(head)
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let serde_json::Value::Object(map) = entry {
                insert_dotted(map, rest, value);
            }
        }
    }
}

// --- persisted config table -------------------------------------------------

/// Initialise the `config` table. Idempotent.
pub fn init_config_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS config (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

/// Persist one dotted-path config value as JSON.
pub fn set_config_value(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value.to_string(), now],
    )
    .map_err(|e| AgentError::Store(e.to_string()))?;
    Ok(())
}

/// Read all persisted config values as `(dotted_key, json)` pairs.
pub fn list_config_values(conn: &Connection) -> Result<Vec<(String, serde_json::Value)>> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM config ORDER BY key")
        .map_err(|e| AgentError::Store(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| AgentError::Store(e.to_string()))?;
    let mut out = Vec::new();
    for row in rows {
        let (key, raw) = row.map_err(|e| AgentError::Store(e.to_string()))?;
        match serde_json::from_str(&raw) {
            Ok(value) => out.push((key, value)),
            Err(e) => warn!(key, error = %e, "skipping malformed persisted config value"),
        }
    }
    Ok(out)
}

fn read_db_layer(conn: &Connection) -> Result<serde_json::Value> {
    init_config_table(conn).map_err(|e| AgentError::Store(e.to_string()))?;
    let mut root = serde_json::Map::new();
    for (key, value) in list_config_values(conn)? {
        insert_dotted(&mut root, &key, value);
    }
    Ok(serde_json::Value::Object(root))
}

// --- serde defaults ---------------------------------------------------------

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("ocg-agent.sock")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("ocg.db")
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_vector_index() -> PathBuf {
    PathBuf::from("ocg.hnsw")
}
fn default_recall_limit() -> usize {
    5
}
fn default_recall_min_score() -> f32 {
    0.2
}
fn default_recall_alpha() -> f32 {
    0.5
}
fn default_embedding_url() -> String {
    "http://127.0.0.1:8089".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_embedding_dim() -> usize {
    384
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_health_interval() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    2
}
fn default_probe_timeout() -> u64 {
    30
}
fn default_tool_budget() -> u32 {
    16
}
fn default_loop_threshold() -> u32 {
    3
}
fn default_tool_result_max_bytes() -> usize {
    64 * 1024
}
fn default_tool_timeout() -> u64 {
    120
}
fn default_provider_retries() -> u32 {
    2
}
fn default_provider_timeout() -> u64 {
    60
}
fn default_prune_days() -> i64 {
    3
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_chat_timeout() -> u64 {
    60
}
fn default_prune_threshold() -> u64 {
    24_000
}
fn default_compact_threshold() -> u64 {
    28_000
}
fn default_hard_limit() -> u64 {
    32_000
}
fn default_keep_messages() -> usize {
    20
}
fn default_keep_tokens() -> u64 {
    4_000
}
fn default_summary_temperature() -> f32 {
    0.3
}
fn default_summary_instruction() -> String {
    "Concisely summarize the key points of this conversation. Preserve stated \
     facts, decisions, names, and unresolved questions. Use short bullet points."
        .to_string()
}
fn default_realtime_idle() -> u64 {
    300
}
fn default_realtime_janitor() -> u64 {
    60
}
fn default_realtime_timeout() -> u64 {
    300
}
fn bool_true() -> bool {
    true
}
