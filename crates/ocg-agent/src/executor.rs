//! The turn executor: one user → assistant exchange, including overflow
//! handling, memory recall, the provider roundtrip with retry and fail-over,
//! and the tool loop with budget and loop protection.
//!
//! The session lock is held for the whole turn; every exit path releases it
//! by dropping the guard. Past tool results are re-rendered as plain system
//! notes when building context (the wire-level pairing of tool calls and
//! results only matters within the turn that produced them).

use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use ocg_core::config::AgentConfig;
use ocg_core::{estimate, AgentError, Role, SessionKey};
use ocg_memory::MemoryStore;
use ocg_sessions::{NewMessage, SessionManager, StoredMessage};

use crate::compact::CompactionEngine;
use crate::health::HealthManager;
use crate::provider::{ChatMessage, ChatRequest, ChatResponse, Provider, ProviderError};
use crate::stream::StreamEvent;
use crate::tools::loop_guard::LoopCheck;
use crate::tools::{LoopDetector, ToolRegistry, ToolResult};
use crate::truncate::truncate_result;

/// Streaming channels are bounded; a slow consumer pauses the producer.
const STREAM_CHANNEL_CAP: usize = 64;
/// Base backoff between provider retries; jittered and doubled per attempt.
const RETRY_BASE_MS: u64 = 300;

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

pub struct TurnExecutor {
    config: Arc<AgentConfig>,
    sessions: Arc<SessionManager>,
    memory: Option<Arc<MemoryStore>>,
    registry: Arc<ToolRegistry>,
    health: Arc<HealthManager>,
    compactor: Arc<CompactionEngine>,
}

impl TurnExecutor {
    pub fn new(
        config: Arc<AgentConfig>,
        sessions: Arc<SessionManager>,
        memory: Option<Arc<MemoryStore>>,
        registry: Arc<ToolRegistry>,
        health: Arc<HealthManager>,
        compactor: Arc<CompactionEngine>,
    ) -> Self {
        Self {
            config,
            sessions,
            memory,
            registry,
            health,
            compactor,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Continue the conversation from the persisted history alone, without
    /// new user input. This is the HTTP leg of the realtime fall-back: when
    /// an audio session dies mid-turn, the reply is produced by the regular
    /// provider path over the same message history.
    pub async fn run_turn_from_history(
        &self,
        key: &SessionKey,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.run_turn(key, Vec::new(), None, cancel, None).await
    }

    /// Fire-and-forget compaction attempt after a turn. Uses `try_lock`
    /// under the hood, so a live turn on the same session wins and the
    /// attempt is simply deferred to the next opportunity.
    pub fn schedule_compaction(&self, key: &SessionKey) {
        let compactor = Arc::clone(&self.compactor);
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = compactor.try_compact(&key).await {
                warn!(session = %key, error = %e, "post-turn compaction failed");
            }
        });
    }

    /// Run one turn. When `stream_tx` is set, text deltas and tool events
    /// are forwarded as they happen; the returned outcome still carries the
    /// full assistant content and usage.
    #[instrument(skip_all, fields(session = %key))]
    pub async fn run_turn(
        &self,
        key: &SessionKey,
        user_messages: Vec<NewMessage>,
        model_override: Option<String>,
        cancel: CancellationToken,
        stream_tx: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<TurnOutcome, AgentError> {
        let handle = self.sessions.lock_handle(key);
        let _guard = handle.lock().await;

        self.sessions.get_or_create(key)?;
        self.sessions.append_messages(key, &user_messages)?;

        let model = model_override.unwrap_or_else(|| self.config.default_model.clone());
        self.overflow_precheck(key).await?;

        let recall_note = self.recall_note(&user_messages).await;
        let mut convo = self.render_context(key, recall_note.as_deref())?;

        let mut detector = LoopDetector::new(self.config.turn.loop_threshold);
        let budget = self.config.turn.tool_budget;
        let mut tool_calls_used: u32 = 0;
        let mut tokens_in: u32 = 0;
        let mut tokens_out: u32 = 0;

        loop {
            let req = ChatRequest {
                model: model.clone(),
                messages: convo.clone(),
                tools: self.registry.definitions(),
                temperature: None,
                max_tokens: self.config.turn.max_tokens,
                stream: stream_tx.is_some(),
            };

            let resp = self
                .roundtrip(&req, &cancel, stream_tx.as_ref(), key)
                .await?;
            tokens_in += resp.tokens_in;
            tokens_out += resp.tokens_out;

            if resp.tool_calls.is_empty() {
                self.sessions.append_messages(
                    key,
                    &[NewMessage::text(Role::Assistant, resp.content.clone())],
                )?;
                self.update_token_estimate(key);
                info!(tokens_in, tokens_out, tool_calls = tool_calls_used, "turn complete");
                return Ok(TurnOutcome {
                    content: resp.content,
                    tokens_in,
                    tokens_out,
                });
            }

            // keep the assistant tool-call message in the working context
            convo.push(ChatMessage {
                role: Role::Assistant,
                content: resp.content.clone(),
                tool_call_id: None,
                tool_calls: resp.tool_calls.clone(),
            });
            if !resp.content.trim().is_empty() {
                self.sessions.append_messages(
                    key,
                    &[NewMessage::text(Role::Assistant, resp.content.clone())],
                )?;
            }

            for call in &resp.tool_calls {
                if tool_calls_used >= budget {
                    warn!(budget, "tool budget exhausted");
                    return Err(AgentError::ToolBudget {
                        used: tool_calls_used + 1,
                        budget,
                    });
                }
                tool_calls_used += 1;

                let result = self
                    .dispatch_tool(key, call, &mut detector, &cancel, stream_tx.as_ref())
                    .await?;

                let text = truncate_result(&result.content, self.config.turn.tool_result_max_bytes);
                convo.push(ChatMessage {
                    role: Role::Tool,
                    content: text.clone(),
                    tool_call_id: Some(call.id.clone()),
                    tool_calls: Vec::new(),
                });
                // duplicates are rejected before dispatch, so this append
                // only races with itself across turns and is safe to persist
                if let Err(e) = self.sessions.append_messages(
                    key,
                    &[NewMessage::tool_result(
                        call.id.as_str(),
                        call.name.as_str(),
                        text.as_str(),
                    )],
                ) {
                    warn!(error = %e, tool = %call.name, "tool result not persisted");
                }
            }
        }
    }

    /// Prune first, compact next, and give up with a context error only when
    /// neither brings the estimate under the hard limit.
    async fn overflow_precheck(&self, key: &SessionKey) -> Result<(), AgentError> {
        let limits = &self.config.compaction;
        let mut total = self.estimate_context(key)?;

        if total > limits.prune_threshold {
            let pruned = self
                .sessions
                .prune_tool_results(key, self.config.turn.prune_days)?;
            if pruned > 0 {
                total = self.estimate_context(key)?;
            }
        }
        if total > limits.compact_threshold {
            debug!(estimate = total, "context above compact threshold");
            self.compactor.compact_locked(key).await?;
            total = self.estimate_context(key)?;
        }
        if total > limits.hard_limit {
            return Err(AgentError::Context(format!(
                "context estimate {total} tokens exceeds hard limit {}",
                limits.hard_limit
            )));
        }
        self.update_token_estimate(key);
        Ok(())
    }

    fn estimate_context(&self, key: &SessionKey) -> Result<u64, AgentError> {
        let active = self.sessions.active_messages(key)?;
        Ok(estimate::estimate_messages(
            active.iter().map(|m| m.content.as_str()),
        ))
    }

    fn update_token_estimate(&self, key: &SessionKey) {
        if let Ok(total) = self.estimate_context(key) {
            let _ = self.sessions.set_token_estimate(key, total);
        }
    }

    /// Embed the last user message and fold the best memories in as a
    /// system note. Recall failures never fail the turn.
    async fn recall_note(&self, user_messages: &[NewMessage]) -> Option<String> {
        if !self.config.recall.auto_recall {
            return None;
        }
        let memory = self.memory.as_ref()?;
        let query = user_messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())?;

        match memory
            .search(
                query,
                self.config.recall.limit,
                self.config.recall.min_score,
                self.config.recall.alpha,
            )
            .await
        {
            Ok(hits) if hits.is_empty() => None,
            Ok(hits) => {
                let lines: Vec<String> =
                    hits.iter().map(|h| format!("- {}", h.content)).collect();
                Some(format!(
                    "Relevant memories from previous conversations:\n{}",
                    lines.join("\n")
                ))
            }
            Err(e) => {
                warn!(error = %e, "memory recall failed");
                None
            }
        }
    }

    /// Build the provider context from persisted history. `[summary]` rows
    /// and past tool results become system notes; the optional recall note
    /// goes in front.
    fn render_context(
        &self,
        key: &SessionKey,
        recall_note: Option<&str>,
    ) -> Result<Vec<ChatMessage>, AgentError> {
        let active = self.sessions.active_messages(key)?;
        let mut out = Vec::with_capacity(active.len() + 1);
        if let Some(note) = recall_note {
            out.push(ChatMessage::text(Role::System, note));
        }
        for msg in active {
            out.push(render_stored(&msg));
        }
        Ok(out)
    }

    /// One provider roundtrip with retry, backoff, and health-driven
    /// fail-over. Streaming requests forward deltas while accumulating the
    /// full response.
    async fn roundtrip(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
        stream_tx: Option<&mpsc::Sender<StreamEvent>>,
        key: &SessionKey,
    ) -> Result<ChatResponse, AgentError> {
        let retries = self.config.turn.provider_retries;
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=retries {
            let provider = self.health.active();
            let caps = provider.capabilities();
            if !caps.chat {
                return Err(AgentError::Capability(format!(
                    "provider {} does not support chat",
                    provider.name()
                )));
            }

            // accumulated deltas, shared so a cancellation can still see the
            // partial assistant output
            let partial = Arc::new(std::sync::Mutex::new(String::new()));
            let call = self.call_provider(Arc::clone(&provider), req, stream_tx, Arc::clone(&partial));
            tokio::pin!(call);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    let text = partial.lock().unwrap().clone();
                    return Err(self.on_cancel(key, Some(&text)));
                }
                outcome = &mut call => outcome,
            };

            match outcome {
                Ok(resp) => {
                    self.health.record_success(provider.name());
                    return Ok(resp);
                }
                Err(ProviderError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    warn!(
                        provider = %provider.name(),
                        attempt,
                        error = %e,
                        "provider call failed"
                    );
                    self.health.record_failure(provider.name(), &e);
                    last_err = Some(e);
                    if attempt < retries {
                        let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_MS);
                        let delay = RETRY_BASE_MS * (1 << attempt.min(4)) + jitter;
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(last_err
            .map(AgentError::from)
            .unwrap_or_else(|| AgentError::Provider("provider retries exhausted".into())))
    }

    async fn call_provider(
        &self,
        provider: Arc<dyn Provider>,
        req: &ChatRequest,
        stream_tx: Option<&mpsc::Sender<StreamEvent>>,
        partial: Arc<std::sync::Mutex<String>>,
    ) -> Result<ChatResponse, ProviderError> {
        let Some(client_tx) = stream_tx else {
            return provider.chat(req).await;
        };

        // bounded internal channel: a slow client applies backpressure to
        // the provider stream
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAP);
        let stream_req = req.clone();
        let stream_provider = Arc::clone(&provider);
        let producer =
            tokio::spawn(async move { stream_provider.chat_stream(&stream_req, tx).await });

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = (0u32, 0u32);
        let mut stop_reason = String::new();
        let mut stream_error: Option<String> = None;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    content.push_str(&text);
                    partial.lock().unwrap().push_str(&text);
                    let _ = client_tx
                        .send(StreamEvent::TextDelta { text })
                        .await;
                }
                StreamEvent::ToolUse(call) => tool_calls.push(call),
                StreamEvent::Done {
                    tokens_in,
                    tokens_out,
                    stop_reason: reason,
                    ..
                } => {
                    usage = (tokens_in, tokens_out);
                    stop_reason = reason;
                }
                StreamEvent::Error { message } => stream_error = Some(message),
                StreamEvent::ToolStatus { .. } => {}
            }
        }

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(ProviderError::Parse(format!("stream task panicked: {e}"))),
        }
        if let Some(message) = stream_error {
            return Err(ProviderError::Unavailable(message));
        }

        Ok(ChatResponse {
            content,
            model: req.model.clone(),
            tokens_in: usage.0,
            tokens_out: usage.1,
            stop_reason,
            tool_calls,
        })
    }

    /// Validate, loop-check, and run one tool call. Rejections come back as
    /// error results the model can read; only a persistent loop aborts.
    async fn dispatch_tool(
        &self,
        key: &SessionKey,
        call: &crate::provider::ToolCall,
        detector: &mut LoopDetector,
        cancel: &CancellationToken,
        stream_tx: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<ToolResult, AgentError> {
        self.emit_tool_status(stream_tx, &call.name, "started", None).await;

        if self.sessions.has_tool_call(key, &call.id)? {
            let result = ToolResult::error(format!(
                "tool call id {} was already executed in this session",
                call.id
            ));
            self.emit_tool_status(stream_tx, &call.name, "failed", Some("duplicate id")).await;
            return Ok(result);
        }

        if let Err(reason) = self.registry.validate(&call.name, &call.input) {
            self.emit_tool_status(stream_tx, &call.name, "failed", Some("invalid arguments"))
                .await;
            return Ok(ToolResult::error(format!("invalid arguments: {reason}")));
        }

        match detector.check(&call.name, &call.input) {
            LoopCheck::Ok => {}
            LoopCheck::RejectCall { count } => {
                warn!(tool = %call.name, count, "repeated identical tool call rejected");
                self.emit_tool_status(stream_tx, &call.name, "failed", Some("repeated call"))
                    .await;
                // the rejection only ever comes back to the model as a tool
                // result; the turn itself stays alive and at worst runs into
                // the tool budget
                let err = AgentError::ToolLoop {
                    tool: call.name.clone(),
                    count,
                };
                return Ok(ToolResult::error(format!(
                    "{}: {err}. Stop retrying this call and answer with what you have.",
                    err.code()
                )));
            }
        }

        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| AgentError::NotFound(format!("tool {}", call.name)))?;

        let timeout = std::time::Duration::from_secs(self.config.turn.tool_timeout_secs);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(self.on_cancel(key, None)),
            outcome = tokio::time::timeout(timeout, tool.execute(call.input.clone())) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => ToolResult::error(format!(
                        "tool {} timed out after {}s",
                        call.name, self.config.turn.tool_timeout_secs
                    )),
                }
            }
        };

        let status = if result.is_error { "failed" } else { "finished" };
        self.emit_tool_status(stream_tx, &call.name, status, None).await;
        Ok(result)
    }

    async fn emit_tool_status(
        &self,
        stream_tx: Option<&mpsc::Sender<StreamEvent>>,
        tool: &str,
        status: &'static str,
        detail: Option<&str>,
    ) {
        if let Some(tx) = stream_tx {
            let _ = tx
                .send(StreamEvent::ToolStatus {
                    tool: tool.to_string(),
                    status,
                    detail: detail.map(str::to_string),
                })
                .await;
        }
    }

    /// Cancellation: persist the partial assistant output only on explicit
    /// opt-in, then surface the cancelled error. The session lock is still
    /// held by the caller, so the append is ordered like any other turn
    /// mutation.
    fn on_cancel(&self, key: &SessionKey, partial: Option<&str>) -> AgentError {
        if self.config.turn.persist_on_cancel {
            if let Some(content) = partial.filter(|c| !c.is_empty()) {
                let _ = self
                    .sessions
                    .append_messages(key, &[NewMessage::text(Role::Assistant, content)]);
            }
        }
        info!(session = %key, "turn cancelled");
        AgentError::Cancelled
    }
}

/// Convert a stored message into its provider-facing form.
fn render_stored(msg: &StoredMessage) -> ChatMessage {
    match msg.role {
        Role::Tool => {
            let name = msg.tool_name.as_deref().unwrap_or("tool");
            ChatMessage::text(
                Role::System,
                format!("[result of earlier {name} call]\n{}", msg.content),
            )
        }
        role => ChatMessage::text(role, msg.content.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Capabilities, ToolCall, ToolDefinition};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use ocg_core::config::AgentConfig;
    use rusqlite::Connection;
    use std::sync::Mutex;

    /// Scripted provider: pops pre-programmed responses; replies with plain
    /// text once the script runs out. Records every request it sees.
    struct ScriptedProvider {
        script: Mutex<Vec<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn text(content: &str) -> ChatResponse {
            ChatResponse {
                content: content.to_string(),
                model: "mock".into(),
                tokens_in: 5,
                tokens_out: 5,
                stop_reason: "stop".into(),
                tool_calls: Vec::new(),
            }
        }

        fn tool_call(id: &str, name: &str, input: serde_json::Value) -> ChatResponse {
            ChatResponse {
                content: String::new(),
                model: "mock".into(),
                tokens_in: 5,
                tokens_out: 5,
                stop_reason: "tool_calls".into(),
                tool_calls: vec![ToolCall {
                    id: id.into(),
                    name: name.into(),
                    input,
                }],
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                chat: true,
                streaming: true,
                ..Default::default()
            }
        }
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(Self::text("fallback reply"))
            } else {
                Ok(script.remove(0))
            }
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo text back"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(format!("echo: {}", input["text"].as_str().unwrap_or("")))
        }
    }

    fn executor(
        provider: Arc<ScriptedProvider>,
        mut tweak: impl FnMut(&mut AgentConfig),
    ) -> TurnExecutor {
        let mut config = AgentConfig::default();
        tweak(&mut config);
        let config = Arc::new(config);

        let sessions =
            Arc::new(SessionManager::new(Connection::open_in_memory().unwrap()).unwrap());
        let health = Arc::new(HealthManager::new(
            vec![Arc::clone(&provider) as Arc<dyn Provider>],
            3,
            2,
            5,
            "mock".into(),
        ));
        let compactor = Arc::new(CompactionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&health),
            config.compaction.clone(),
            "mock".into(),
        ));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        TurnExecutor::new(
            config,
            sessions,
            None,
            Arc::new(registry),
            health,
            compactor,
        )
    }

    fn user(content: &str) -> Vec<NewMessage> {
        vec![NewMessage::text(Role::User, content)]
    }

    #[tokio::test]
    async fn simple_turn_persists_both_sides() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text("hello there")]);
        let exec = executor(Arc::clone(&provider), |_| {});
        let key = SessionKey::from("s1");

        let outcome = exec
            .run_turn(&key, user("hello"), None, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome.content, "hello there");
        assert!(outcome.tokens_in >= 1);
        let history = exec.sessions().active_messages(&key).unwrap();
        assert!(history.len() >= 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn tool_loop_executes_and_reenters() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call("c1", "echo", serde_json::json!({"text": "ping"})),
            ScriptedProvider::text("done after tool"),
        ]);
        let exec = executor(Arc::clone(&provider), |_| {});
        let key = SessionKey::from("s1");

        let outcome = exec
            .run_turn(&key, user("use the tool"), None, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.content, "done after tool");

        // the tool result is persisted with its call id
        let history = exec.sessions().active_messages(&key).unwrap();
        let tool_msg = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert!(tool_msg.content.contains("echo: ping"));

        // the second provider request saw the tool result
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1]
            .messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn tool_budget_exhaustion_fails_the_turn() {
        // every response asks for echo again, with fresh args so the loop
        // detector stays quiet; budget 4 must stop it
        let script: Vec<ChatResponse> = (0..10)
            .map(|i| {
                ScriptedProvider::tool_call(
                    &format!("c{i}"),
                    "echo",
                    serde_json::json!({"text": format!("round {i}")}),
                )
            })
            .collect();
        let provider = ScriptedProvider::new(script);
        let exec = executor(Arc::clone(&provider), |c| c.turn.tool_budget = 4);
        let key = SessionKey::from("s1");

        let err = exec
            .run_turn(&key, user("loop"), None, CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolBudget { budget: 4, .. }));

        let tool_msgs = exec
            .sessions()
            .active_messages(&key)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        assert_eq!(tool_msgs, 4);
    }

    #[tokio::test]
    async fn repeated_identical_calls_are_rejected_but_never_fail_the_turn() {
        // the model insists on the same call; past the threshold each one is
        // rejected back to it, and only the budget ever ends the turn
        let script: Vec<ChatResponse> = (0..20)
            .map(|i| {
                ScriptedProvider::tool_call(
                    &format!("c{i}"),
                    "echo",
                    serde_json::json!({"text": "same"}),
                )
            })
            .collect();
        let provider = ScriptedProvider::new(script);
        let exec = executor(Arc::clone(&provider), |c| {
            c.turn.tool_budget = 6;
            c.turn.loop_threshold = 3;
        });
        let key = SessionKey::from("s1");

        let err = exec
            .run_turn(&key, user("loop forever"), None, CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolBudget { budget: 6, .. }));

        // calls 4..6 were rejected with the loop code, visible to the model
        let requests = provider.requests.lock().unwrap();
        let rejection = requests
            .iter()
            .flat_map(|r| r.messages.iter())
            .find(|m| m.content.contains("TOOL_LOOP"))
            .expect("rejection result reached the model");
        assert!(rejection.content.contains("Stop retrying"));
    }

    #[tokio::test]
    async fn history_only_turn_serves_the_realtime_fallback() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text("voice fallback reply")]);
        let exec = executor(Arc::clone(&provider), |_| {});
        let key = SessionKey::from("voice_1");
        exec.sessions()
            .append_messages(&key, &[NewMessage::text(Role::User, "spoken words")])
            .unwrap();

        let outcome = exec
            .run_turn_from_history(&key, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.content, "voice fallback reply");

        // the provider saw the persisted transcript, nothing was re-appended
        let requests = provider.requests.lock().unwrap();
        assert!(requests[0].messages.iter().any(|m| m.content == "spoken words"));
        let history = exec.sessions().active_messages(&key).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn invalid_tool_args_are_reported_to_the_model() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call("c1", "echo", serde_json::json!({"wrong": 1})),
            ScriptedProvider::text("recovered"),
        ]);
        let exec = executor(Arc::clone(&provider), |_| {});
        let key = SessionKey::from("s1");

        let outcome = exec
            .run_turn(&key, user("bad call"), None, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.content, "recovered");

        let requests = provider.requests.lock().unwrap();
        let second = &requests[1];
        let tool_reply = second
            .messages
            .iter()
            .find(|m| m.tool_call_id.is_some())
            .unwrap();
        assert!(tool_reply.content.contains("invalid arguments"));
    }

    #[tokio::test]
    async fn oversized_history_fails_with_context_error() {
        let provider = ScriptedProvider::new(vec![]);
        let exec = executor(provider, |c| {
            c.compaction.prune_threshold = 10;
            c.compaction.compact_threshold = 20;
            c.compaction.hard_limit = 30;
        });
        let key = SessionKey::from("s1");

        // a single message far over every threshold cannot be compacted away
        let err = exec
            .run_turn(
                &key,
                user(&"x".repeat(1000)),
                None,
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Context(_)));
    }

    #[tokio::test]
    async fn cancelled_turn_discards_partial_by_default() {
        struct SlowProvider;
        #[async_trait]
        impl Provider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities {
                    chat: true,
                    ..Default::default()
                }
            }
            async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                unreachable!("cancelled before completion")
            }
        }

        let config = Arc::new(AgentConfig::default());
        let sessions =
            Arc::new(SessionManager::new(Connection::open_in_memory().unwrap()).unwrap());
        let health = Arc::new(HealthManager::new(
            vec![Arc::new(SlowProvider) as Arc<dyn Provider>],
            3,
            2,
            5,
            "m".into(),
        ));
        let compactor = Arc::new(CompactionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&health),
            config.compaction.clone(),
            "m".into(),
        ));
        let exec = TurnExecutor::new(
            Arc::clone(&config),
            Arc::clone(&sessions),
            None,
            Arc::new(ToolRegistry::new()),
            health,
            compactor,
        );

        let key = SessionKey::from("s1");
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let err = exec
            .run_turn(&key, user("hi"), None, cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));

        // user message persisted, no assistant partial
        let history = sessions.active_messages(&key).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn streaming_turn_forwards_deltas_and_tool_events() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call("c1", "echo", serde_json::json!({"text": "hi"})),
            ScriptedProvider::text("streamed answer"),
        ]);
        let exec = executor(Arc::clone(&provider), |_| {});
        let key = SessionKey::from("s1");

        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAP);
        let outcome = exec
            .run_turn(&key, user("stream it"), None, CancellationToken::new(), Some(tx))
            .await
            .unwrap();
        assert_eq!(outcome.content, "streamed answer");

        let mut saw_delta = false;
        let mut saw_tool = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                StreamEvent::TextDelta { .. } => saw_delta = true,
                StreamEvent::ToolStatus { .. } => saw_tool = true,
                _ => {}
            }
        }
        assert!(saw_delta);
        assert!(saw_tool);
    }
}
