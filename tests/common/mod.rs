#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rag_gateway::app::App;
use rag_gateway::config::parse_config;
use rag_gateway::embedding::EmbeddingModel;
use rag_gateway::error::{GatewayError, Result};
use rag_gateway::llm::ChatModel;
use rag_gateway::models::{ChatRequest, ChatResponse, ModelEvent, ModelStream};
use rag_gateway::tools::ToolRegistry;

/// Embeds text as its lowercase ASCII letter counts.
pub struct LetterEmbedding;

#[async_trait]
impl EmbeddingModel for LetterEmbedding {
    fn model_name(&self) -> &str {
        "letters"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 26];
                for c in text.chars().flat_map(|c| c.to_lowercase()) {
                    if c.is_ascii_lowercase() {
                        v[(c as u8 - b'a') as usize] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

type Responder = Box<dyn Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync>;

/// Chat model driven by a closure; records every request it receives.
pub struct ScriptedModel {
    responder: Responder,
    delay: Option<Duration>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(responder: impl Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync + 'static) -> Arc<Self> {
        Self::build(responder, None)
    }

    pub fn slow(
        delay: Duration,
        responder: impl Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(responder, Some(delay))
    }

    fn build(
        responder: impl Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync + 'static,
        delay: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn replies(replies: Vec<ChatResponse>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| GatewayError::model("no scripted reply left"))
        })
    }

    pub fn constant(text: &str) -> Arc<Self> {
        let text = text.to_string();
        Self::new(move |_| Ok(ChatResponse::text(text.clone())))
    }

    pub fn recorded(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(request)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ModelStream> {
        let response = self.generate(request).await?;
        let mut events: Vec<Result<ModelEvent>> = response
            .content
            .split_inclusive(' ')
            .map(|piece| Ok(ModelEvent::Delta(piece.to_string())))
            .collect();
        if !response.tool_calls.is_empty() {
            events.push(Ok(ModelEvent::ToolCalls(response.tool_calls)));
        }
        events.push(Ok(ModelEvent::Finish {
            reason: response.finish_reason,
            usage: None,
        }));
        Ok(futures::stream::iter(events).boxed())
    }
}

/// Streams one fragment and then fails, like a dropped provider connection.
pub struct BrokenStreamModel;

#[async_trait]
impl ChatModel for BrokenStreamModel {
    fn model_name(&self) -> &str {
        "broken"
    }

    async fn generate(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Err(GatewayError::model("connection reset"))
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<ModelStream> {
        let events: Vec<Result<ModelEvent>> = vec![
            Ok(ModelEvent::Delta("partial ".to_string())),
            Err(GatewayError::model("connection reset")),
        ];
        Ok(futures::stream::iter(events).boxed())
    }
}

/// Config for tests: no query expansion or translation, no enrichment,
/// documents read from `root`.
pub fn test_config(root: &Path, extra: &str) -> rag_gateway::config::Config {
    let toml = format!(
        r#"
[chunking]
chunk_size = 4
chunk_overlap = 2

[enrichment]
enabled = false

[ingest]
root = "{}"
include_globs = ["**/*.txt", "**/*.md"]

[retrieval]
expand = false
target_language = ""
similarity_threshold = 0.5
top_k = 3

{}
"#,
        root.display().to_string().replace('\\', "/"),
        extra
    );
    parse_config(&toml).unwrap()
}

pub fn app(root: &Path, extra: &str, model: Arc<dyn ChatModel>, tools: ToolRegistry) -> App {
    App::with_models(test_config(root, extra), model, Arc::new(LetterEmbedding), tools).unwrap()
}
