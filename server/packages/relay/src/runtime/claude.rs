use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::session::Exchange;
use crate::tools::{ResourceDescriptor, ToolDescriptor, ToolRegistry};

use super::{AgentRuntime, ReplyStream, RuntimeError};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Hard bound on model/tool rounds per submission.
const MAX_TOOL_ROUNDS: usize = 8;
const REPLY_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl ClaudeConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Streams replies from an Anthropic-style messages API, dispatching tool
/// requests through the registry and looping until the model stops without
/// tool use.
pub struct ClaudeRuntime {
    http: reqwest::Client,
    config: ClaudeConfig,
    registry: Arc<ToolRegistry>,
}

impl ClaudeRuntime {
    pub fn new(config: ClaudeConfig, registry: Arc<ToolRegistry>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            registry,
        }
    }
}

#[async_trait]
impl AgentRuntime for ClaudeRuntime {
    fn model_id(&self) -> String {
        self.config.model.clone()
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RuntimeError> {
        Ok(self.registry.descriptors())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, RuntimeError> {
        Ok(self.registry.resources())
    }

    fn stream_reply(&self, history: &[Exchange], query: &str) -> ReplyStream {
        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        let http = self.http.clone();
        let config = self.config.clone();
        let registry = self.registry.clone();
        let messages = build_messages(history, query);
        tokio::spawn(async move {
            run_turn(http, config, registry, messages, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

fn build_messages(history: &[Exchange], query: &str) -> Vec<Value> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 1);
    for exchange in history {
        messages.push(json!({ "role": "user", "content": exchange.user_text }));
        messages.push(json!({ "role": "assistant", "content": exchange.assistant_text }));
    }
    messages.push(json!({ "role": "user", "content": query }));
    messages
}

fn tool_definitions(registry: &ToolRegistry) -> Vec<Value> {
    registry
        .descriptors()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect()
}

struct ToolCall {
    id: String,
    name: String,
    input: Value,
}

struct TurnOutcome {
    assistant_blocks: Vec<Value>,
    tool_calls: Vec<ToolCall>,
}

async fn run_turn(
    http: reqwest::Client,
    config: ClaudeConfig,
    registry: Arc<ToolRegistry>,
    mut messages: Vec<Value>,
    tx: mpsc::Sender<Result<String, RuntimeError>>,
) {
    let tools = tool_definitions(&registry);
    for _ in 0..MAX_TOOL_ROUNDS {
        let outcome = match stream_once(&http, &config, &messages, &tools, &tx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        if outcome.tool_calls.is_empty() {
            return;
        }

        let mut result_blocks = Vec::with_capacity(outcome.tool_calls.len());
        for call in &outcome.tool_calls {
            let result = registry.invoke(&call.name, call.input.clone()).await;
            result_blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": result.to_string(),
            }));
        }
        messages.push(json!({ "role": "assistant", "content": outcome.assistant_blocks }));
        messages.push(json!({ "role": "user", "content": result_blocks }));
    }
    let _ = tx.send(Err(RuntimeError::ToolLoop(MAX_TOOL_ROUNDS))).await;
}

/// One streaming call to the messages API. Text deltas and tool markers are
/// forwarded on `tx` as they arrive; the accumulated content blocks come
/// back for the follow-up request.
async fn stream_once(
    http: &reqwest::Client,
    config: &ClaudeConfig,
    messages: &[Value],
    tools: &[Value],
    tx: &mpsc::Sender<Result<String, RuntimeError>>,
) -> Result<TurnOutcome, RuntimeError> {
    let mut body = json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "stream": true,
        "messages": messages,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
    }

    let url = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
    let response = http
        .post(&url)
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|err| RuntimeError::Request(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(RuntimeError::Request(format!("status {status}: {text}")));
    }

    let mut events = response.bytes_stream().eventsource();
    let mut blocks: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut current_text: Option<String> = None;
    let mut current_tool: Option<(String, String, String)> = None;

    while let Some(event) = events.next().await {
        let event = event.map_err(|err| RuntimeError::Request(err.to_string()))?;
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        match data.get("type").and_then(|v| v.as_str()) {
            Some("content_block_start") => {
                let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                match block.get("type").and_then(|v| v.as_str()) {
                    Some("text") => current_text = Some(String::new()),
                    Some("tool_use") => {
                        let id = block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if tx.send(Ok(format!("\n[Tool: {name}]\n"))).await.is_err() {
                            return Err(RuntimeError::Request("reply channel closed".to_string()));
                        }
                        current_tool = Some((id, name, String::new()));
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let delta = data.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if let Some(buffer) = current_text.as_mut() {
                                buffer.push_str(text);
                            }
                            if tx.send(Ok(text.to_string())).await.is_err() {
                                return Err(RuntimeError::Request(
                                    "reply channel closed".to_string(),
                                ));
                            }
                        }
                    }
                    Some("input_json_delta") => {
                        if let (Some(tool), Some(part)) = (
                            current_tool.as_mut(),
                            delta.get("partial_json").and_then(|v| v.as_str()),
                        ) {
                            tool.2.push_str(part);
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                if let Some(text) = current_text.take() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                if let Some((id, name, raw)) = current_tool.take() {
                    let input: Value = if raw.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&raw).map_err(|err| {
                            RuntimeError::Protocol(format!("tool input not valid JSON: {err}"))
                        })?
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    }));
                    tool_calls.push(ToolCall { id, name, input });
                }
            }
            Some("error") => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("stream error")
                    .to_string();
                return Err(RuntimeError::Protocol(message));
            }
            Some("message_stop") => break,
            _ => {}
        }
    }

    Ok(TurnOutcome {
        assistant_blocks: blocks,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_history_then_query() {
        let history = vec![Exchange {
            user_text: "hi".to_string(),
            assistant_text: "hello".to_string(),
            model_id: "m".to_string(),
            timestamp: chrono::Utc::now(),
        }];
        let messages = build_messages(&history, "next");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["content"], "next");
    }
}
