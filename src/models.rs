//! Core data models used throughout the gateway.
//!
//! These types represent the documents that flow through the ingestion and
//! retrieval pipelines, and the conversation turns, requests, and responses
//! that flow through the chat pipelines.

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use crate::error::GatewayError;

// ============ Documents ============

/// Scalar metadata value attached to a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{}", b),
            MetaValue::Number(n) => write!(f, "{}", n),
            MetaValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::String(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::String(s)
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        MetaValue::Number(n)
    }
}

impl From<usize> for MetaValue {
    fn from(n: usize) -> Self {
        MetaValue::Number(n as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// Open-ended key/value metadata. Ordered so serialized output is stable.
pub type Metadata = BTreeMap<String, MetaValue>;

/// A unit of text flowing through ingestion and retrieval.
///
/// `score` is only populated on documents returned from a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Document {
    /// Creates a document with a fresh random id.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            metadata: Metadata::new(),
            score: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

// ============ Conversation turns ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments. Unparseable argument text is kept as a string.
    pub arguments: Value,
}

/// One conversation turn.
///
/// Assistant turns may carry `tool_calls`; tool turns carry the id of the
/// call they answer in `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that requests tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// Tool turn answering the call with id `call_id`.
    pub fn tool_result(call_id: &str, name: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            name: Some(name.to_string()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

// ============ Options & prompts ============

/// Per-request model options. Unset fields fall back to the mode defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "stop")]
    pub stop_sequences: Vec<String>,
}

impl ChatOptions {
    /// Returns `self` with every field that is set in `overrides` replaced.
    pub fn merged_with(&self, overrides: &ChatOptions) -> ChatOptions {
        ChatOptions {
            model: overrides.model.clone().or_else(|| self.model.clone()),
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            stop_sequences: if overrides.stop_sequences.is_empty() {
                self.stop_sequences.clone()
            } else {
                overrides.stop_sequences.clone()
            },
        }
    }
}

/// What the caller asks: an optional system prompt, the user prompt, and options.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
    pub options: Option<ChatOptions>,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Function schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A request flowing through the advisor chain towards the model.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub options: ChatOptions,
    pub tools: Vec<ToolSchema>,
    pub conversation_id: String,
    pub filter_expression: Option<String>,
}

impl ChatRequest {
    /// The content of the most recent user turn, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

// ============ Responses ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Whether a RAG answer was grounded in retrieved context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grounding {
    Grounded,
    EmptyContext,
}

/// Result or error of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Result(Value),
    Error(String),
}

/// One executed tool call, kept for the duration of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub outcome: ToolOutcome,
}

impl ToolInvocation {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<Grounding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ============ Streams ============

/// Incremental event produced by a streaming model call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A text fragment.
    Delta(String),
    /// Fully assembled tool calls, emitted once the model finishes requesting them.
    ToolCalls(Vec<ToolCall>),
    Finish {
        reason: Option<String>,
        usage: Option<Usage>,
    },
}

/// Lazy, single-pass stream of model events.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, GatewayError>> + Send>>;

/// Lazy, single-pass stream of text fragments returned to callers.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_merge_prefers_overrides() {
        let defaults = ChatOptions {
            model: Some("gpt-4o-mini".to_string()),
            temperature: Some(0.0),
            ..Default::default()
        };
        let overrides = ChatOptions {
            temperature: Some(0.7),
            ..Default::default()
        };
        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(merged.temperature, Some(0.7));
    }

    #[test]
    fn test_options_accept_camel_case() {
        let opts: ChatOptions =
            serde_json::from_str(r#"{"temperature": 0.5, "maxTokens": 128, "topP": 0.9}"#)
                .unwrap();
        assert_eq!(opts.max_tokens, Some(128));
        assert_eq!(opts.top_p, Some(0.9));
    }

    #[test]
    fn test_meta_value_untagged() {
        let meta: Metadata =
            serde_json::from_str(r#"{"source": "a.md", "page": 3, "draft": false}"#).unwrap();
        assert_eq!(meta["source"], MetaValue::String("a.md".to_string()));
        assert_eq!(meta["page"], MetaValue::Number(3.0));
        assert_eq!(meta["draft"], MetaValue::Bool(false));
    }

    #[test]
    fn test_last_user_text() {
        let req = ChatRequest {
            messages: vec![
                Message::system("be brief"),
                Message::user("first"),
                Message::assistant("ok"),
                Message::user("second"),
            ],
            ..Default::default()
        };
        assert_eq!(req.last_user_text(), Some("second"));
    }
}
