//! Chat model abstraction.
//!
//! [`ChatModel`] is the boundary to the language-model inference engine:
//! a blocking-style [`generate`](ChatModel::generate) and a lazy
//! [`stream`](ChatModel::stream). Everything above this trait (advisors,
//! retrieval, tool dispatch) is provider-agnostic.
//!
//! [`OpenAiChatModel`] speaks the OpenAI chat-completions protocol. Its
//! streaming path decodes Server-Sent Events incrementally with
//! [`SseDecoder`], reassembling tool-call fragments that arrive split across
//! many `delta` events.

use anyhow::bail;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::config::ModelConfig;
use crate::error::{GatewayError, Result};
use crate::models::{
    ChatRequest, ChatResponse, Message, ModelEvent, ModelStream, Role, ToolCall, Usage,
};
use crate::openai::OpenAiClient;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Run one completion and return the full response.
    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Start a completion and return its events as they arrive.
    ///
    /// Dropping the returned stream releases the underlying connection.
    async fn stream(&self, request: &ChatRequest) -> Result<ModelStream>;
}

// ============ OpenAI Chat Completions ============

pub struct OpenAiChatModel {
    client: OpenAiClient,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = build_request_body(&self.model, request, false);
        let response = self.client.post("/chat/completions", &body).await?;
        let json: Value = response.json().await?;
        parse_completion(&json)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ModelStream> {
        let body = build_request_body(&self.model, request, true);
        let response = self.client.post("/chat/completions", &body).await?;
        let bytes = response.bytes_stream().boxed();

        let events = futures::stream::unfold(
            (bytes, SseDecoder::default(), VecDeque::new(), false),
            |(mut bytes, mut decoder, mut pending, mut finished)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (bytes, decoder, pending, finished)));
                    }
                    if finished {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => match decoder.push(&chunk) {
                            Ok(decoded) => pending.extend(decoded),
                            Err(e) => {
                                finished = true;
                                return Some((Err(e), (bytes, decoder, pending, finished)));
                            }
                        },
                        Some(Err(e)) => {
                            finished = true;
                            return Some((Err(e.into()), (bytes, decoder, pending, finished)));
                        }
                        None => {
                            pending.extend(decoder.finish());
                            finished = true;
                        }
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}

/// Build the model named by `[model].provider`.
pub fn create_chat_model(config: &ModelConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => {
            let client = OpenAiClient::new(config)?;
            Ok(Arc::new(OpenAiChatModel::new(
                client,
                config.chat_model.clone(),
            )))
        }
        other => bail!("Unknown model provider: {}", other),
    }
}

// ============ Wire format ============

fn message_to_json(message: &Message) -> Value {
    let mut obj = json!({ "role": message.role.as_str() });
    if message.role == Role::Assistant && !message.tool_calls.is_empty() {
        obj["content"] = if message.content.is_empty() {
            Value::Null
        } else {
            Value::String(message.content.clone())
        };
        obj["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": arguments_to_string(&call.arguments),
                    }
                })
            })
            .collect();
    } else {
        obj["content"] = Value::String(message.content.clone());
    }
    if let Some(id) = &message.tool_call_id {
        obj["tool_call_id"] = Value::String(id.clone());
    }
    if let Some(name) = &message.name {
        obj["name"] = Value::String(name.clone());
    }
    obj
}

fn arguments_to_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Parse tool-call argument text. Text that is not JSON is kept verbatim so
/// parameter validation can report it.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub(crate) fn build_request_body(default_model: &str, request: &ChatRequest, stream: bool) -> Value {
    let options = &request.options;
    let mut body = json!({
        "model": options.model.as_deref().unwrap_or(default_model),
        "messages": request.messages.iter().map(message_to_json).collect::<Vec<_>>(),
    });

    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = options.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if !options.stop_sequences.is_empty() {
        body["stop"] = json!(options.stop_sequences);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn parse_usage(json: &Value) -> Option<Usage> {
    let usage = json.get("usage").filter(|u| u.is_object())?;
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    })
}

fn provider_error(json: &Value) -> Option<GatewayError> {
    let error = json.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(GatewayError::model(message))
}

pub(crate) fn parse_completion(json: &Value) -> Result<ChatResponse> {
    if let Some(err) = provider_error(json) {
        return Err(err);
    }
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| GatewayError::model("invalid completion response: missing choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| GatewayError::model("invalid completion response: missing message"))?;

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: parse_arguments(
                        call["function"]["arguments"].as_str().unwrap_or_default(),
                    ),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        usage: parse_usage(json),
        model: json["model"].as_str().map(str::to_string),
        ..Default::default()
    })
}

// ============ SSE decoding ============

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for a chat-completions event stream.
///
/// Bytes are buffered until a full line is available, so UTF-8 sequences
/// and JSON payloads split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
    finished: bool,
}

impl SseDecoder {
    /// Feed raw bytes and return the events completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<ModelEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events)?;
        }
        Ok(events)
    }

    /// Flush anything still buffered and emit the closing events.
    pub fn finish(&mut self) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).to_string();
            if let Err(e) = self.handle_line(line.trim(), &mut events) {
                tracing::warn!(error = %e, "discarding malformed trailing stream event");
            }
        }
        self.flush_tool_calls(&mut events);
        events.push(ModelEvent::Finish {
            reason: self.finish_reason.take(),
            usage: self.usage.take(),
        });
        self.finished = true;
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<ModelEvent>) -> Result<()> {
        let Some(data) = line.strip_prefix("data:") else {
            // Comments, `event:` and `id:` fields carry nothing we use.
            return Ok(());
        };
        let data = data.trim();
        if data.is_empty() || self.done {
            return Ok(());
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let json: Value = serde_json::from_str(data)
            .map_err(|e| GatewayError::model(format!("malformed stream event: {}", e)))?;
        if let Some(err) = provider_error(&json) {
            return Err(err);
        }
        if let Some(usage) = parse_usage(&json) {
            self.usage = Some(usage);
        }

        let Some(choice) = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return Ok(());
        };

        let delta = &choice["delta"];
        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                events.push(ModelEvent::Delta(content.to_string()));
            }
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                let partial = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    partial.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    partial.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    partial.arguments.push_str(args);
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
            self.flush_tool_calls(events);
        }
        Ok(())
    }

    fn flush_tool_calls(&mut self, events: &mut Vec<ModelEvent>) {
        if self.tool_calls.is_empty() {
            return;
        }
        let calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|partial| ToolCall {
                id: partial.id,
                name: partial.name,
                arguments: parse_arguments(&partial.arguments),
            })
            .collect();
        events.push(ModelEvent::ToolCalls(calls));
    }
}
