//! Deterministic fakes shared by unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::embedding::EmbeddingModel;
use crate::error::{GatewayError, Result};
use crate::llm::ChatModel;
use crate::models::{ChatRequest, ChatResponse, ModelEvent, ModelStream};

/// Embeds text as its 26 lowercase ASCII letter counts.
pub struct LetterEmbedding;

pub fn letter_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for c in text.chars().flat_map(|c| c.to_lowercase()) {
        if c.is_ascii_lowercase() {
            v[(c as u8 - b'a') as usize] += 1.0;
        }
    }
    v
}

#[async_trait]
impl EmbeddingModel for LetterEmbedding {
    fn model_name(&self) -> &str {
        "letters"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| letter_vector(t)).collect())
    }
}

pub struct FailingEmbedding;

#[async_trait]
impl EmbeddingModel for FailingEmbedding {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(GatewayError::model("embedding service unavailable"))
    }
}

type Responder = Box<dyn Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync>;

/// Chat model whose replies are computed by a closure. Every request is
/// recorded for later inspection.
pub struct ScriptedModel {
    responder: Responder,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(responder: impl Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Replies with `replies` in order, then fails.
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

    /// Always replies with `text`.
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
