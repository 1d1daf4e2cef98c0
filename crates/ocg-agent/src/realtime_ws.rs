//! WebSocket realtime provider: streaming PCM up, audio/text/events down.
//!
//! The wire is line-of-sight JSON messages tagged by `type`; binary frames
//! carry raw audio down. A writer task owns the sink and a reader task fans
//! messages into the bounded event channel. Slow consumers drop events
//! rather than stalling the socket reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::provider::{ProviderError, ToolCall};
use crate::realtime::{RealtimeEvent, RealtimeProvider, REALTIME_EVENT_CAP};

pub struct WsRealtimeProvider {
    url: String,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    events_rx: Mutex<Option<mpsc::Receiver<RealtimeEvent>>>,
}

impl WsRealtimeProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connected: AtomicBool::new(false),
            outbound: Mutex::new(None),
            events_rx: Mutex::new(None),
        }
    }

    async fn send_message(&self, msg: Message) -> Result<(), ProviderError> {
        let tx = {
            let guard = self.outbound.lock().unwrap();
            guard.clone()
        };
        let tx = tx.ok_or_else(|| ProviderError::Unavailable("not connected".into()))?;
        tx.send(msg)
            .await
            .map_err(|_| ProviderError::Unavailable("realtime writer closed".into()))
    }
}

#[async_trait]
impl RealtimeProvider for WsRealtimeProvider {
    async fn connect(&self) -> Result<(), ProviderError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ProviderError::Unavailable(format!("realtime connect: {e}")))?;
        let (mut sink, mut source) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(REALTIME_EVENT_CAP);
        let (event_tx, event_rx) = mpsc::channel::<RealtimeEvent>(REALTIME_EVENT_CAP);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => parse_event(&text),
                    Ok(Message::Binary(bytes)) => Some(RealtimeEvent::Audio(bytes.to_vec())),
                    Ok(Message::Close(_)) | Err(_) => {
                        let _ = reader_events.try_send(RealtimeEvent::Closed);
                        break;
                    }
                    Ok(_) => None,
                };
                if let Some(event) = event {
                    // a full queue drops the event instead of stalling the
                    // socket reader
                    if reader_events.try_send(event).is_err() {
                        warn!("realtime event queue full — event dropped");
                    }
                }
            }
        });

        *self.outbound.lock().unwrap() = Some(out_tx);
        *self.events_rx.lock().unwrap() = Some(event_rx);
        self.connected.store(true, Ordering::SeqCst);
        debug!(url = %self.url, "realtime provider connected");
        Ok(())
    }

    async fn send_audio(&self, pcm: &[u8]) -> Result<(), ProviderError> {
        let payload = serde_json::json!({
            "type": "audio",
            "data": base64::engine::general_purpose::STANDARD.encode(pcm),
        });
        self.send_message(Message::Text(payload.to_string().into()))
            .await
    }

    async fn end_audio(&self) -> Result<(), ProviderError> {
        let payload = serde_json::json!({ "type": "audio_end" });
        self.send_message(Message::Text(payload.to_string().into()))
            .await
    }

    async fn send_tool_response(&self, call_id: &str, content: &str) -> Result<(), ProviderError> {
        let payload = serde_json::json!({
            "type": "tool_response",
            "id": call_id,
            "content": content,
        });
        self.send_message(Message::Text(payload.to_string().into()))
            .await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let tx = self.outbound.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<RealtimeEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

/// Map a tagged JSON message onto an event. Unknown tags are ignored.
fn parse_event(raw: &str) -> Option<RealtimeEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value["type"].as_str()? {
        "text" => Some(RealtimeEvent::Text(
            value["content"].as_str().unwrap_or_default().to_string(),
        )),
        "audio" => {
            let data = value["data"].as_str().unwrap_or_default();
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .ok()
                .map(RealtimeEvent::Audio)
        }
        "transcription" => Some(RealtimeEvent::Transcription {
            text: value["text"].as_str().unwrap_or_default().to_string(),
            is_final: value["final"].as_bool().unwrap_or(false),
        }),
        "tool_call" => Some(RealtimeEvent::ToolCall(ToolCall {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            name: value["name"].as_str().unwrap_or_default().to_string(),
            input: value["input"].clone(),
        })),
        "vad" => Some(RealtimeEvent::Vad {
            speaking: value["speaking"].as_bool().unwrap_or(false),
        }),
        "usage" => Some(RealtimeEvent::Usage {
            tokens_in: value["tokens_in"].as_u64().unwrap_or(0) as u32,
            tokens_out: value["tokens_out"].as_u64().unwrap_or(0) as u32,
        }),
        "error" => Some(RealtimeEvent::Error(
            value["message"].as_str().unwrap_or_default().to_string(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_messages_parse_into_events() {
        assert!(matches!(
            parse_event(r#"{"type":"text","content":"hi"}"#),
            Some(RealtimeEvent::Text(t)) if t == "hi"
        ));
        assert!(matches!(
            parse_event(r#"{"type":"transcription","text":"hello","final":true}"#),
            Some(RealtimeEvent::Transcription { is_final: true, .. })
        ));
        assert!(matches!(
            parse_event(r#"{"type":"vad","speaking":true}"#),
            Some(RealtimeEvent::Vad { speaking: true })
        ));
        assert!(matches!(
            parse_event(r#"{"type":"tool_call","id":"c1","name":"echo","input":{"x":1}}"#),
            Some(RealtimeEvent::ToolCall(call)) if call.name == "echo"
        ));
    }

    #[test]
    fn audio_payload_round_trips_base64() {
        let pcm = vec![0u8, 1, 2, 250];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm);
        let raw = format!(r#"{{"type":"audio","data":"{encoded}"}}"#);
        assert!(matches!(
            parse_event(&raw),
            Some(RealtimeEvent::Audio(bytes)) if bytes == pcm
        ));
    }

    #[test]
    fn unknown_and_malformed_messages_are_ignored() {
        assert!(parse_event(r#"{"type":"mystery"}"#).is_none());
        assert!(parse_event("not json").is_none());
    }
}
