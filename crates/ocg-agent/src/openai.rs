//! OpenAI-compatible HTTP provider. Covers the hosted API and every local
//! server speaking the same wire format (llama.cpp, vLLM, Ollama's compat
//! endpoint) — local deployments just point `base_url` somewhere else.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ocg_core::Role;

use crate::provider::{
    Capabilities, ChatRequest, ChatResponse, Provider, ProviderError, ToolCall,
};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl OpenAiProvider {
    /// `base_url` without a trailing slash; the chat completions path is
    /// appended.
    pub fn new(
        name: impl Into<String>,
        api_key: String,
        base_url: String,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            provider_name: name.into(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            streaming: true,
            embeddings: false,
            realtime: false,
        }
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, provider = %self.provider_name, "sending chat request");

        let resp = self.post(&body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, provider = %self.provider_name, "sending streaming chat request");

        let resp = self.post(&body).await?;
        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

fn role_str(role: Role) -> &'static str {
    role.as_str()
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({
                "role": role_str(m.role),
                "content": m.content,
            });
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = serde_json::json!(id);
            }
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.input.to_string(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = serde_json::json!(calls);
            }
            msg
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });
    if stream {
        // ask for usage on the final chunk
        body["stream_options"] = serde_json::json!({ "include_usage": true });
    }
    if let Some(t) = req.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }
    body
}

pub(crate) fn parse_response(resp: ApiResponse) -> ChatResponse {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();

    ChatResponse {
        content,
        model: resp.model,
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0),
        stop_reason,
        tool_calls,
    }
}

/// Parse the SSE stream, emitting text deltas as they arrive and complete
/// tool calls once their argument fragments have been assembled.
async fn process_stream(resp: reqwest::Response, model: String, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();
    // tool calls stream as fragments keyed by index
    let mut partial_calls: BTreeMap<u32, PartialCall> = BTreeMap::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        line_buf.push_str(text);

        while let Some(pos) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break 'outer;
            }
            let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };

            if let Some(usage) = &chunk_resp.usage {
                tokens_in = usage.prompt_tokens;
                tokens_out = usage.completion_tokens;
            }

            for choice in &chunk_resp.choices {
                if let Some(reason) = &choice.finish_reason {
                    if !reason.is_empty() {
                        stop_reason = reason.clone();
                    }
                }
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty()
                        && tx
                            .send(StreamEvent::TextDelta {
                                text: content.clone(),
                            })
                            .await
                            .is_err()
                    {
                        return; // receiver dropped
                    }
                }
                for frag in choice.delta.tool_calls.iter().flatten() {
                    let slot = partial_calls.entry(frag.index).or_default();
                    if let Some(ref id) = frag.id {
                        slot.id = id.clone();
                    }
                    if let Some(ref f) = frag.function {
                        if let Some(ref name) = f.name {
                            slot.name.push_str(name);
                        }
                        if let Some(ref args) = f.arguments {
                            slot.arguments.push_str(args);
                        }
                    }
                }
            }
        }
    }

    for (_, partial) in partial_calls {
        let input = serde_json::from_str(&partial.arguments).unwrap_or_default();
        let _ = tx
            .send(StreamEvent::ToolUse(ToolCall {
                id: partial.id,
                name: partial.name,
                input,
            }))
            .await;
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            stop_reason,
        })
        .await;
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

// API response types

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) model: String,
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<Usage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ApiMessage,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ApiMessage {
    pub(crate) content: Option<String>,
    pub(crate) tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
pub(crate) struct ApiToolCall {
    pub(crate) id: String,
    pub(crate) function: ApiFunction,
}

#[derive(Deserialize)]
pub(crate) struct ApiFunction {
    pub(crate) name: String,
    pub(crate) arguments: String,
}

#[derive(Deserialize)]
pub(crate) struct Usage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

// streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Deserialize)]
struct ToolCallFragment {
    index: u32,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn request_body_carries_tools_and_tool_results() {
        let req = ChatRequest {
            model: "test-model".into(),
            messages: vec![
                ChatMessage::text(Role::User, "hi"),
                ChatMessage {
                    role: Role::Assistant,
                    content: String::new(),
                    tool_call_id: None,
                    tool_calls: vec![ToolCall {
                        id: "call_1".into(),
                        name: "echo".into(),
                        input: serde_json::json!({"text": "x"}),
                    }],
                },
                ChatMessage {
                    role: Role::Tool,
                    content: "x".into(),
                    tool_call_id: Some("call_1".into()),
                    tool_calls: Vec::new(),
                },
            ],
            tools: vec![crate::provider::ToolDefinition {
                name: "echo".into(),
                description: "echo back".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            temperature: Some(0.3),
            max_tokens: 256,
            stream: false,
        };

        let body = build_request_body(&req, false);
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["name"], "echo");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        assert_eq!(body["temperature"], 0.3);
    }

    #[test]
    fn response_parses_tool_calls() {
        let raw = serde_json::json!({
            "model": "test-model",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 4}
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let parsed = parse_response(resp);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "lookup");
        assert_eq!(parsed.tool_calls[0].input["q"], "rust");
        assert_eq!(parsed.stop_reason, "tool_calls");
        assert_eq!(parsed.tokens_in, 10);
    }
}
