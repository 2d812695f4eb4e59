//! Request orchestration across chat modes.
//!
//! [`Gateway`] is the single entry point for the HTTP server and the CLI.
//! It validates the request, picks the [`ChatClient`] for the requested
//! [`ChatMode`], and returns either the whole response or a stream of text
//! fragments.
//!
//! | Mode | Chain |
//! |------|-------|
//! | `plain` | memory → logger → model |
//! | `rag` | memory → retrieval → logger → model |
//! | `tool` | memory → logger → tool dispatcher → model |

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::advisor::ChatClient;
use crate::error::{GatewayError, Result};
use crate::memory::ConversationMemory;
use crate::models::{ChatResponse, ModelEvent, Prompt, TokenStream, ToolSchema};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Plain,
    Rag,
    Tool,
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChatMode::Plain => "plain",
            ChatMode::Rag => "rag",
            ChatMode::Tool => "tool",
        })
    }
}

/// Per-request settings beyond the prompt itself.
#[derive(Debug, Clone, Default)]
pub struct RequestExtras {
    /// Metadata filter applied to retrieval. Only used in RAG mode.
    pub filter_expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Emotion {
    VeryNegative,
    Negative,
    Neutral,
    Positive,
    VeryPositive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionEvaluation {
    pub emotion: Emotion,
    #[serde(default)]
    pub reason: Vec<String>,
}

const EMOTION_FORMAT: &str = "Respond only with a JSON object of the form \
{\"emotion\": one of \"VERY_NEGATIVE\", \"NEGATIVE\", \"NEUTRAL\", \"POSITIVE\", \"VERY_POSITIVE\", \
\"reason\": [short strings explaining the choice]}. Do not wrap it in markdown.";

pub struct Gateway {
    plain: Option<ChatClient>,
    rag: Option<ChatClient>,
    tool: Option<ChatClient>,
    /// Plain client without memory, for one-shot questions.
    one_shot: ChatClient,
    memory: Arc<ConversationMemory>,
    tools: Arc<ToolRegistry>,
}

impl Gateway {
    pub fn new(one_shot: ChatClient, memory: Arc<ConversationMemory>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            plain: None,
            rag: None,
            tool: None,
            one_shot,
            memory,
            tools,
        }
    }

    /// Enable `mode`, served by `client`.
    pub fn with_mode(mut self, mode: ChatMode, client: ChatClient) -> Self {
        match mode {
            ChatMode::Plain => self.plain = Some(client),
            ChatMode::Rag => self.rag = Some(client),
            ChatMode::Tool => self.tool = Some(client),
        }
        self
    }

    pub fn is_enabled(&self, mode: ChatMode) -> bool {
        self.client(mode).is_ok()
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools.schemas()
    }

    fn client(&self, mode: ChatMode) -> Result<&ChatClient> {
        let client = match mode {
            ChatMode::Plain => self.plain.as_ref(),
            ChatMode::Rag => self.rag.as_ref(),
            ChatMode::Tool => self.tool.as_ref(),
        };
        client.ok_or_else(|| GatewayError::invalid(format!("{} mode is disabled", mode)))
    }

    fn prepare<'a>(
        &'a self,
        prompt: &Prompt,
        conversation_id: &str,
        mode: ChatMode,
        extras: RequestExtras,
    ) -> Result<(&'a ChatClient, Option<String>)> {
        if conversation_id.trim().is_empty() {
            return Err(GatewayError::invalid("conversationId must not be blank"));
        }
        if prompt.user.trim().is_empty() {
            return Err(GatewayError::invalid("userPrompt must not be blank"));
        }
        let client = self.client(mode)?;
        let filter = match mode {
            ChatMode::Rag => extras.filter_expression,
            _ => {
                if extras.filter_expression.is_some() {
                    tracing::debug!(%mode, "ignoring filterExpression outside rag mode");
                }
                None
            }
        };
        Ok((client, filter))
    }

    pub async fn call(
        &self,
        prompt: Prompt,
        conversation_id: &str,
        mode: ChatMode,
        extras: RequestExtras,
    ) -> Result<ChatResponse> {
        let (client, filter) = self.prepare(&prompt, conversation_id, mode, extras)?;
        client.call(prompt, conversation_id, filter).await
    }

    /// Stream text fragments as the model produces them.
    ///
    /// The conversation is committed to memory only once the returned
    /// stream has been drained. Dropping it cancels the request.
    pub async fn stream(
        &self,
        prompt: Prompt,
        conversation_id: &str,
        mode: ChatMode,
        extras: RequestExtras,
    ) -> Result<TokenStream> {
        let (client, filter) = self.prepare(&prompt, conversation_id, mode, extras)?;
        let events = client.stream(prompt, conversation_id, filter).await?;
        Ok(text_fragments(events))
    }

    /// Drop a conversation's memory. Returns false if it held nothing.
    pub async fn forget(&self, conversation_id: &str) -> Result<bool> {
        if conversation_id.trim().is_empty() {
            return Err(GatewayError::invalid("conversationId must not be blank"));
        }
        Ok(self.memory.forget(conversation_id).await)
    }

    /// Single question without conversation memory.
    pub async fn ask(&self, user_prompt: &str) -> Result<String> {
        if user_prompt.trim().is_empty() {
            return Err(GatewayError::invalid("userPrompt must not be blank"));
        }
        let response = self.one_shot.call(Prompt::new(user_prompt), "one-shot", None).await?;
        Ok(response.content)
    }

    /// Classify the sentiment of the user prompt (plain mode).
    pub async fn evaluate_emotion(&self, prompt: Prompt, conversation_id: &str) -> Result<EmotionEvaluation> {
        let prompt = Prompt {
            user: format!("{}\n\n{}", prompt.user, EMOTION_FORMAT),
            ..prompt
        };
        let response = self
            .call(prompt, conversation_id, ChatMode::Plain, RequestExtras::default())
            .await?;
        parse_emotion(&response.content)
    }
}

fn text_fragments(events: crate::models::ModelStream) -> TokenStream {
    events
        .filter_map(|event| async move {
            match event {
                Ok(ModelEvent::Delta(text)) if !text.is_empty() => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
        .boxed()
}

/// Parse the model's JSON verdict, tolerating a surrounding code fence.
pub fn parse_emotion(reply: &str) -> Result<EmotionEvaluation> {
    let trimmed = reply.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(body)
        .map_err(|e| GatewayError::model(format!("unparseable emotion evaluation: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::MemoryAdvisor;
    use crate::test_support::ScriptedModel;

    fn gateway(reply: &str) -> (Gateway, Arc<ScriptedModel>) {
        let model = ScriptedModel::constant(reply);
        let memory = Arc::new(ConversationMemory::new(10, true));
        let plain = ChatClient::builder(model.clone())
            .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
            .build();
        let gateway = Gateway::new(
            ChatClient::builder(model.clone()).build(),
            memory,
            Arc::new(ToolRegistry::new()),
        )
        .with_mode(ChatMode::Plain, plain);
        (gateway, model)
    }

    #[test]
    fn test_parse_emotion() {
        let fenced = "```json\n{\"emotion\": \"VERY_POSITIVE\", \"reason\": [\"loves it\"]}\n```";
        let eval = parse_emotion(fenced).unwrap();
        assert_eq!(eval.emotion, Emotion::VeryPositive);
        assert_eq!(eval.reason, vec!["loves it"]);

        assert_eq!(parse_emotion("not json").unwrap_err().code(), "model_provider_error");
    }

    #[tokio::test]
    async fn test_blank_inputs_rejected() {
        let (gateway, model) = gateway("hi");
        let err = gateway
            .call(Prompt::new("  "), "c1", ChatMode::Plain, RequestExtras::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        let err = gateway
            .call(Prompt::new("hello"), "", ChatMode::Plain, RequestExtras::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        assert!(model.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_mode_rejected() {
        let (gateway, _) = gateway("hi");
        assert!(!gateway.is_enabled(ChatMode::Rag));
        let err = gateway
            .call(Prompt::new("hello"), "c1", ChatMode::Tool, RequestExtras::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "tool mode is disabled");
    }

    #[tokio::test]
    async fn test_stream_yields_text_and_commits() {
        let (gateway, _) = gateway("alpha beta");
        let stream = gateway
            .stream(Prompt::new("hello"), "c1", ChatMode::Plain, RequestExtras::default())
            .await
            .unwrap();
        let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(fragments, vec!["alpha ", "beta"]);
        assert_eq!(gateway.memory().read("c1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_conversation() {
        let (gateway, _) = gateway("noted");
        gateway
            .call(Prompt::new("remember me"), "c1", ChatMode::Plain, RequestExtras::default())
            .await
            .unwrap();
        assert!(gateway.forget("c1").await.unwrap());
        assert_eq!(gateway.memory().conversations(), 0);
        assert!(!gateway.forget("c1").await.unwrap());
        assert_eq!(gateway.forget("  ").await.unwrap_err().code(), "bad_request");
    }

    #[tokio::test]
    async fn test_ask_skips_memory() {
        let (gateway, _) = gateway("42");
        assert_eq!(gateway.ask("meaning?").await.unwrap(), "42");
        assert_eq!(gateway.memory().conversations(), 0);
    }

    #[tokio::test]
    async fn test_evaluate_emotion() {
        let (gateway, model) = gateway(r#"{"emotion": "NEGATIVE", "reason": ["rain"]}"#);
        let eval = gateway
            .evaluate_emotion(Prompt::new("I hate rainy days"), "c1")
            .await
            .unwrap();
        assert_eq!(eval.emotion, Emotion::Negative);
        assert!(model.recorded()[0].messages[0].content.contains("VERY_NEGATIVE"));
    }
}
