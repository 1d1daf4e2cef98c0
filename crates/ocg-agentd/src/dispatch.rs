//! Method routing: decode typed params, call the owning subsystem, shape
//! the payload. Streaming methods push event frames through the
//! connection's outbound queue before the final response.

use std::sync::Arc;

use base64::Engine;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ocg_agent::{RealtimeEvent, StreamEvent};
use ocg_core::{AgentError, Role, SessionKey};
use ocg_protocol::frames::{EventFrame, ReqFrame};
use ocg_protocol::methods::{self, ChatParams, ChatPayload, DeltaPayload, ToolEventPayload, Usage};
use ocg_sessions::NewMessage;

use crate::app::AppState;
use crate::rpc::send_frame;

type Payload = Result<serde_json::Value, AgentError>;

pub async fn route(state: Arc<AppState>, req: ReqFrame, out: mpsc::Sender<String>) -> Payload {
    let params = req.params.clone().unwrap_or(serde_json::Value::Null);
    match req.method.as_str() {
        methods::CHAT_SEND => chat(state, &req.id, params, None).await,
        methods::CHAT_STREAM => chat(state, &req.id, params, Some(out)).await,
        methods::CHAT_ABORT => chat_abort(state, params),
        methods::SESSIONS_LIST => sessions_list(state),
        methods::SESSIONS_HISTORY => sessions_history(state, params),
        methods::SESSIONS_RESET => sessions_reset(state, params),
        methods::MEMORY_STORE => memory_store(state, params).await,
        methods::MEMORY_SEARCH => memory_search(state, params).await,
        methods::MEMORY_GET => memory_get(state, params),
        methods::MEMORY_DELETE => memory_delete(state, params),
        methods::PULSE_ADD => pulse_add(state, params),
        methods::PULSE_STATUS => pulse_status(state, params),
        methods::STATS_GET => stats(state),
        methods::TASKS_CREATE => tasks_create(state, params),
        methods::TASKS_STATUS => tasks_status(state, params),
        methods::AUDIO_CHUNK => audio_chunk(state, params, out).await,
        methods::AUDIO_END => audio_end(state, params, out).await,
        other => Err(AgentError::NotFound(format!("method {other}"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, AgentError> {
    serde_json::from_value(params).map_err(|e| AgentError::Config(format!("bad params: {e}")))
}

async fn chat(
    state: Arc<AppState>,
    req_id: &str,
    params: serde_json::Value,
    out: Option<mpsc::Sender<String>>,
) -> Payload {
    let params: ChatParams = parse(params)?;
    let key: SessionKey = params.session_key.into();

    let messages: Vec<NewMessage> = params
        .messages
        .into_iter()
        .map(|m| {
            let role = m.role.parse::<Role>().unwrap_or(Role::User);
            NewMessage::text(role, m.content)
        })
        .collect();
    if messages.is_empty() {
        return Err(AgentError::Config("messages must not be empty".into()));
    }

    let cancel = CancellationToken::new();
    state.inflight.insert(req_id.to_string(), cancel.clone());

    // streaming: forward executor events as wire frames until the turn ends
    let (stream_tx, forwarder) = match out {
        Some(out) => {
            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let req_id = req_id.to_string();
            let forwarder = tokio::spawn(async move {
                let mut seq = 0u64;
                while let Some(event) = rx.recv().await {
                    seq += 1;
                    let frame = match event {
                        StreamEvent::TextDelta { text } => {
                            EventFrame::new(methods::EVENT_CHAT_DELTA, DeltaPayload { text })
                        }
                        StreamEvent::ToolStatus { tool, status, detail } => EventFrame::new(
                            methods::EVENT_CHAT_TOOL,
                            ToolEventPayload {
                                tool,
                                status: status.to_string(),
                                detail,
                            },
                        ),
                        _ => continue,
                    };
                    send_frame(&out, &frame.for_request(req_id.as_str()).with_seq(seq)).await;
                }
            });
            (Some(tx), Some(forwarder))
        }
        None => (None, None),
    };

    let outcome = state
        .executor
        .run_turn(&key, messages, params.model, cancel, stream_tx)
        .await;

    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }

    let outcome = outcome?;
    state.executor.schedule_compaction(&key);
    Ok(serde_json::to_value(ChatPayload {
        content: outcome.content,
        usage: Usage {
            prompt_tokens: outcome.tokens_in,
            completion_tokens: outcome.tokens_out,
        },
    })
    .unwrap_or_default())
}

fn chat_abort(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::AbortParams = parse(params)?;
    let aborted = match state.inflight.get(&params.call_id) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    };
    Ok(serde_json::json!({ "aborted": aborted }))
}

fn sessions_list(state: Arc<AppState>) -> Payload {
    let sessions = state.sessions.list(100)?;
    Ok(serde_json::json!({ "sessions": sessions }))
}

fn sessions_history(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::HistoryParams = parse(params)?;
    let key: SessionKey = params.session_key.into();
    let messages = state.sessions.history(&key, params.limit)?;
    Ok(serde_json::json!({ "messages": messages }))
}

fn sessions_reset(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::SessionKeyParams = parse(params)?;
    let key: SessionKey = params.session_key.into();
    state.sessions.reset(&key)?;
    Ok(serde_json::json!({ "reset": true }))
}

async fn memory_store(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::MemoryStoreParams = parse(params)?;
    let id = state
        .memory
        .store(&params.content, &params.tags, params.session_key.as_deref())
        .await?;
    Ok(serde_json::json!({ "id": id }))
}

async fn memory_search(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::MemorySearchParams = parse(params)?;
    let hits = state
        .memory
        .search(
            &params.query,
            params.k,
            params.min_score.unwrap_or(state.config.recall.min_score),
            params.alpha.unwrap_or(state.config.recall.alpha),
        )
        .await?;
    Ok(serde_json::json!({ "hits": hits }))
}

fn memory_get(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::MemoryIdParams = parse(params)?;
    let row = state.memory.get(params.id)?;
    Ok(serde_json::to_value(row).unwrap_or_default())
}

fn memory_delete(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::MemoryIdParams = parse(params)?;
    state.memory.delete(params.id)?;
    Ok(serde_json::json!({ "deleted": true }))
}

fn pulse_add(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::PulseAddParams = parse(params)?;
    let scheduled_at = match params.scheduled_at.as_deref() {
        Some(raw) => Some(
            chrono::DateTime::parse_from_rfc3339(raw)
                .map_err(|e| AgentError::Config(format!("bad scheduled_at: {e}")))?
                .with_timezone(&chrono::Utc),
        ),
        None => None,
    };
    let event = state.pulse.enqueue(
        &params.kind,
        params.payload,
        params.session_key.as_deref(),
        scheduled_at,
        3,
    )?;
    Ok(serde_json::to_value(event).unwrap_or_default())
}

fn pulse_status(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    if let Some(id) = params.get("id").and_then(|v| v.as_str()) {
        let event = state.pulse.status(id)?;
        return Ok(serde_json::to_value(event).unwrap_or_default());
    }
    let (pending, claimed, completed, failed) = state.pulse.counts()?;
    let recent = state.pulse.list_recent(20)?;
    Ok(serde_json::json!({
        "pending": pending,
        "claimed": claimed,
        "completed": completed,
        "failed": failed,
        "recent": recent,
        "cron_jobs": state.pulse.list_cron_jobs()?,
    }))
}

fn stats(state: Arc<AppState>) -> Payload {
    let (session_count, message_count, archived) = state.sessions.stats()?;
    let (memory_rows, memory_live) = state.memory.stats()?;
    let (pending, claimed, completed, failed) = state.pulse.counts()?;
    Ok(serde_json::json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": { "count": session_count, "messages": message_count, "archived": archived },
        "memory": { "rows": memory_rows, "indexed": memory_live },
        "pulse": { "pending": pending, "claimed": claimed, "completed": completed, "failed": failed },
        "processes": state.supervisor.list(),
        "realtime_sessions": state.realtime.active_count(),
        "providers": state.health.snapshot(),
        "health_events": state.health.events(),
        "persisted_config": state.persisted_config,
    }))
}

fn tasks_create(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::TaskCreateParams = parse(params)?;
    let task = state.tasks.create(&params.description, &params.steps)?;
    Ok(serde_json::to_value(task).unwrap_or_default())
}

fn tasks_status(state: Arc<AppState>, params: serde_json::Value) -> Payload {
    let params: methods::TaskIdParams = parse(params)?;
    let task = state.tasks.get(&params.id)?;
    Ok(serde_json::to_value(task).unwrap_or_default())
}

/// Feed one PCM chunk to the session's realtime provider, opening it on
/// first use. Provider events fan out to this connection as unsolicited
/// frames carrying the session key. A failed realtime call falls back to a
/// plain HTTP turn over the same session history.
async fn audio_chunk(
    state: Arc<AppState>,
    params: serde_json::Value,
    out: mpsc::Sender<String>,
) -> Payload {
    let params: methods::AudioChunkParams = parse(params)?;
    let key: SessionKey = params.session_key.into();
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(&params.pcm)
        .map_err(|e| AgentError::Config(format!("bad pcm base64: {e}")))?;

    let lock = state.realtime.session_lock(&key);
    let _guard = lock.lock().await;

    let provider = match state.realtime.get_or_connect(&key).await {
        Ok(p) => p,
        Err(e) => {
            warn!(session = %key, error = %e, "realtime connect failed — using http fallback");
            return realtime_fallback(&state, &key, &out).await;
        }
    };
    if let Some(events) = provider.take_events() {
        spawn_event_pump(Arc::clone(&state), key.clone(), events, out.clone());
    }
    if let Err(e) = provider.send_audio(&pcm).await {
        // evict the broken provider so the next chunk reconnects cleanly
        state.realtime.remove(&key).await;
        warn!(session = %key, error = %e, "realtime send failed — using http fallback");
        return realtime_fallback(&state, &key, &out).await;
    }
    Ok(serde_json::json!({ "accepted": pcm.len() }))
}

async fn audio_end(
    state: Arc<AppState>,
    params: serde_json::Value,
    out: mpsc::Sender<String>,
) -> Payload {
    let params: methods::SessionKeyParams = parse(params)?;
    let key: SessionKey = params.session_key.into();

    let lock = state.realtime.session_lock(&key);
    let _guard = lock.lock().await;

    match state.realtime.get_cached(&key) {
        Some(provider) => {
            if let Err(e) = provider.end_audio().await {
                state.realtime.remove(&key).await;
                warn!(session = %key, error = %e, "realtime end failed — using http fallback");
                return realtime_fallback(&state, &key, &out).await;
            }
            Ok(serde_json::json!({ "ended": true }))
        }
        None => Ok(serde_json::json!({ "ended": false })),
    }
}

/// The HTTP leg of the realtime fall-back: run a normal turn over the
/// session's existing history (final transcriptions are already persisted
/// by the event pump) and surface the reply the way a realtime answer
/// would arrive.
async fn realtime_fallback(
    state: &Arc<AppState>,
    key: &SessionKey,
    out: &mpsc::Sender<String>,
) -> Payload {
    let outcome = state
        .executor
        .run_turn_from_history(key, CancellationToken::new())
        .await?;

    let frame = EventFrame::new(
        methods::EVENT_AUDIO_TEXT,
        serde_json::json!({
            "session_key": key.as_str(),
            "text": outcome.content,
            "fallback": true,
        }),
    );
    send_frame(out, &frame).await;

    Ok(serde_json::json!({
        "fallback": true,
        "content": outcome.content,
        "usage": {
            "prompt_tokens": outcome.tokens_in,
            "completion_tokens": outcome.tokens_out,
        },
    }))
}

/// Forward realtime provider events onto the wire until the provider
/// closes. Final transcriptions also join the session history, so an HTTP
/// fall-back turn picks up exactly where the audio left off.
fn spawn_event_pump(
    state: Arc<AppState>,
    key: SessionKey,
    mut events: mpsc::Receiver<RealtimeEvent>,
    out: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event {
                RealtimeEvent::Text(text) => EventFrame::new(
                    methods::EVENT_AUDIO_TEXT,
                    serde_json::json!({ "session_key": key.as_str(), "text": text }),
                ),
                RealtimeEvent::Audio(pcm) => EventFrame::new(
                    methods::EVENT_AUDIO_OUT,
                    serde_json::json!({
                        "session_key": key.as_str(),
                        "pcm": base64::engine::general_purpose::STANDARD.encode(pcm),
                    }),
                ),
                RealtimeEvent::Transcription { text, is_final } => {
                    if is_final {
                        if let Err(e) = state.sessions.append_messages(
                            &key,
                            &[NewMessage::text(Role::User, text.clone())],
                        ) {
                            warn!(session = %key, error = %e, "transcription not persisted");
                        }
                    }
                    EventFrame::new(
                        methods::EVENT_AUDIO_TEXT,
                        serde_json::json!({
                            "session_key": key.as_str(),
                            "transcription": text,
                            "final": is_final,
                        }),
                    )
                }
                RealtimeEvent::Closed => break,
                RealtimeEvent::Error(message) => {
                    warn!(session = %key, message, "realtime provider error");
                    continue;
                }
                // VAD, usage, and tool calls stay internal for now
                _ => continue,
            };
            send_frame(&out, &frame).await;
        }
    });
}
