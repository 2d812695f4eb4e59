//! Ordered advisor chain around model calls.
//!
//! An [`Advisor`] is middleware: it receives the request and the rest of the
//! [`Chain`], may rewrite the request, calls the chain, and may inspect or
//! rewrite the response. A [`ChatClient`] owns its advisors sorted by
//! [`order`](Advisor::order), lowest first, so the lowest order is the
//! outermost layer.
//!
//! ```text
//! ChatClient::call
//!   └─▶ MemoryAdvisor (-1000)     history in, turns committed out
//!        └─▶ RetrievalAdvisor (0) last user turn replaced by the augmented prompt
//!             └─▶ LoggerAdvisor (1000)
//!                  └─▶ terminal: ChatModel (or ToolDispatcher)
//! ```
//!
//! Streaming follows the same chain. Stream advisors wrap the returned
//! [`ModelStream`] rather than a finished response, so work that needs the
//! whole answer (committing to memory) happens when the stream is drained.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::llm::ChatModel;
use crate::memory::{ConversationMemory, WindowGuard};
use crate::models::{
    ChatOptions, ChatRequest, ChatResponse, Message, ModelEvent, ModelStream, Prompt, Role,
};
use crate::rag::{RetrievalOrchestrator, RetrievalStage};

pub const MEMORY_ORDER: i32 = -1000;
pub const RETRIEVAL_ORDER: i32 = 0;
pub const LOGGER_ORDER: i32 = 1000;

#[async_trait]
pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    /// Position in the chain. Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    async fn advise_call(&self, request: ChatRequest, chain: Chain<'_>) -> Result<ChatResponse> {
        chain.next_call(request).await
    }

    async fn advise_stream(&self, request: ChatRequest, chain: Chain<'_>) -> Result<ModelStream> {
        chain.next_stream(request).await
    }
}

/// The advisors still to run, followed by the terminal model.
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    advisors: &'a [Arc<dyn Advisor>],
    terminal: &'a dyn ChatModel,
}

impl<'a> Chain<'a> {
    pub fn new(advisors: &'a [Arc<dyn Advisor>], terminal: &'a dyn ChatModel) -> Self {
        Self { advisors, terminal }
    }

    pub async fn next_call(self, request: ChatRequest) -> Result<ChatResponse> {
        match self.advisors.split_first() {
            Some((advisor, rest)) => {
                advisor
                    .advise_call(request, Chain::new(rest, self.terminal))
                    .await
            }
            None => self.terminal.generate(&request).await,
        }
    }

    pub async fn next_stream(self, request: ChatRequest) -> Result<ModelStream> {
        match self.advisors.split_first() {
            Some((advisor, rest)) => {
                advisor
                    .advise_stream(request, Chain::new(rest, self.terminal))
                    .await
            }
            None => self.terminal.stream(&request).await,
        }
    }
}

// ============ Memory ============

/// Prepends conversation history and commits the exchange afterwards.
///
/// The conversation's window stays locked from the history read until the
/// commit, so requests on one conversation run one at a time. A failed call
/// commits nothing. A stream commits only once it has been fully drained
/// without error; dropping it early leaves memory untouched.
pub struct MemoryAdvisor {
    memory: Arc<ConversationMemory>,
}

impl MemoryAdvisor {
    pub fn new(memory: Arc<ConversationMemory>) -> Self {
        Self { memory }
    }
}

/// Newest system turn first, then stored history, then the new turns.
fn assemble(history: Vec<Message>, new_turns: &[Message]) -> Vec<Message> {
    let system = new_turns
        .iter()
        .rev()
        .find(|m| m.role == Role::System)
        .or_else(|| history.iter().rev().find(|m| m.role == Role::System))
        .cloned();

    let mut messages = Vec::with_capacity(history.len() + new_turns.len() + 1);
    messages.extend(system);
    messages.extend(history.into_iter().filter(|m| m.role != Role::System));
    messages.extend(new_turns.iter().filter(|m| m.role != Role::System).cloned());
    messages
}

fn commit(window: &mut WindowGuard, new_turns: Vec<Message>, answer: String) -> Result<()> {
    window.extend(new_turns)?;
    window.push(Message::assistant(answer))
}

#[async_trait]
impl Advisor for MemoryAdvisor {
    fn name(&self) -> &str {
        "memory"
    }

    fn order(&self) -> i32 {
        MEMORY_ORDER
    }

    async fn advise_call(&self, mut request: ChatRequest, chain: Chain<'_>) -> Result<ChatResponse> {
        let mut window = self.memory.lock(&request.conversation_id).await;
        let new_turns = std::mem::take(&mut request.messages);
        request.messages = assemble(window.turns(), &new_turns);

        let response = chain.next_call(request).await?;
        commit(&mut window, new_turns, response.content.clone())?;
        Ok(response)
    }

    async fn advise_stream(&self, mut request: ChatRequest, chain: Chain<'_>) -> Result<ModelStream> {
        let window = self.memory.lock(&request.conversation_id).await;
        let new_turns = std::mem::take(&mut request.messages);
        request.messages = assemble(window.turns(), &new_turns);

        let inner = chain.next_stream(request).await?;
        let state = CommitOnDrain {
            inner,
            window: Some(window),
            new_turns,
            answer: String::new(),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            // `window` is taken once the stream has ended or failed
            state.window.as_ref()?;
            match state.inner.next().await {
                Some(Ok(event)) => {
                    match &event {
                        ModelEvent::Delta(text) => state.answer.push_str(text),
                        // text of a tool-call round is not part of the answer
                        ModelEvent::ToolCalls(_) => state.answer.clear(),
                        ModelEvent::Finish { .. } => {}
                    }
                    Some((Ok(event), state))
                }
                Some(Err(e)) => {
                    state.window = None;
                    Some((Err(e), state))
                }
                None => {
                    let mut window = state.window.take()?;
                    let new_turns = std::mem::take(&mut state.new_turns);
                    let answer = std::mem::take(&mut state.answer);
                    match commit(&mut window, new_turns, answer) {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), state)),
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct CommitOnDrain {
    inner: ModelStream,
    window: Option<WindowGuard>,
    new_turns: Vec<Message>,
    answer: String,
}

// ============ Retrieval ============

/// Replaces the last user turn with a context-augmented prompt.
pub struct RetrievalAdvisor {
    orchestrator: Arc<RetrievalOrchestrator>,
}

impl RetrievalAdvisor {
    pub fn new(orchestrator: Arc<RetrievalOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn augment(&self, request: &mut ChatRequest) -> Result<crate::rag::RetrievalOutcome> {
        let turn = request
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| GatewayError::invalid("request has no user message"))?;

        let outcome = self
            .orchestrator
            .run(&turn.content, request.filter_expression.as_deref())
            .await?;
        turn.content = outcome.prompt.clone();
        tracing::debug!(
            stage = %RetrievalStage::Dispatched,
            documents = outcome.documents.len(),
            "retrieval stage"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl Advisor for RetrievalAdvisor {
    fn name(&self) -> &str {
        "retrieval"
    }

    fn order(&self) -> i32 {
        RETRIEVAL_ORDER
    }

    async fn advise_call(&self, mut request: ChatRequest, chain: Chain<'_>) -> Result<ChatResponse> {
        let outcome = self.augment(&mut request).await?;
        let mut response = chain.next_call(request).await?;
        response.documents = outcome.documents;
        response.grounding = Some(outcome.grounding);
        Ok(response)
    }

    async fn advise_stream(&self, mut request: ChatRequest, chain: Chain<'_>) -> Result<ModelStream> {
        self.augment(&mut request).await?;
        chain.next_stream(request).await
    }
}

// ============ Logging ============

pub struct LoggerAdvisor;

#[async_trait]
impl Advisor for LoggerAdvisor {
    fn name(&self) -> &str {
        "logger"
    }

    fn order(&self) -> i32 {
        LOGGER_ORDER
    }

    async fn advise_call(&self, request: ChatRequest, chain: Chain<'_>) -> Result<ChatResponse> {
        log_request(&request, false);
        let response = chain.next_call(request).await?;
        tracing::debug!(
            chars = response.content.chars().count(),
            finish_reason = response.finish_reason.as_deref().unwrap_or("-"),
            tool_calls = response.tool_calls.len(),
            "model response"
        );
        Ok(response)
    }

    async fn advise_stream(&self, request: ChatRequest, chain: Chain<'_>) -> Result<ModelStream> {
        log_request(&request, true);
        chain.next_stream(request).await
    }
}

fn log_request(request: &ChatRequest, stream: bool) {
    let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
    tracing::debug!(
        conversation = %request.conversation_id,
        messages = request.messages.len(),
        roles = ?roles,
        tools = request.tools.len(),
        stream,
        "model request"
    );
}

// ============ ChatClient ============

/// A model plus its advisors and default options. One client is built per
/// chat mode at startup and shared by every request.
pub struct ChatClient {
    terminal: Arc<dyn ChatModel>,
    advisors: Vec<Arc<dyn Advisor>>,
    default_options: ChatOptions,
    default_system: Option<String>,
}

pub struct ChatClientBuilder {
    terminal: Arc<dyn ChatModel>,
    advisors: Vec<Arc<dyn Advisor>>,
    default_options: ChatOptions,
    default_system: Option<String>,
}

impl ChatClientBuilder {
    pub fn advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisors.push(advisor);
        self
    }

    pub fn default_options(mut self, options: ChatOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn default_system(mut self, system: impl Into<String>) -> Self {
        self.default_system = Some(system.into());
        self
    }

    pub fn build(mut self) -> ChatClient {
        // stable: equal orders keep registration order
        self.advisors.sort_by_key(|a| a.order());
        ChatClient {
            terminal: self.terminal,
            advisors: self.advisors,
            default_options: self.default_options,
            default_system: self.default_system,
        }
    }
}

impl ChatClient {
    /// Start building a client whose chain ends in `terminal`.
    pub fn builder(terminal: Arc<dyn ChatModel>) -> ChatClientBuilder {
        ChatClientBuilder {
            terminal,
            advisors: Vec::new(),
            default_options: ChatOptions::default(),
            default_system: None,
        }
    }

    pub fn advisor_names(&self) -> Vec<&str> {
        self.advisors.iter().map(|a| a.name()).collect()
    }

    pub fn request(&self, prompt: Prompt, conversation_id: &str, filter_expression: Option<String>) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = prompt.system.or_else(|| self.default_system.clone()) {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt.user));

        let options = match &prompt.options {
            Some(overrides) => self.default_options.merged_with(overrides),
            None => self.default_options.clone(),
        };

        ChatRequest {
            messages,
            options,
            tools: Vec::new(),
            conversation_id: conversation_id.to_string(),
            filter_expression,
        }
    }

    pub async fn call(
        &self,
        prompt: Prompt,
        conversation_id: &str,
        filter_expression: Option<String>,
    ) -> Result<ChatResponse> {
        let request = self.request(prompt, conversation_id, filter_expression);
        Chain::new(&self.advisors, self.terminal.as_ref())
            .next_call(request)
            .await
    }

    pub async fn stream(
        &self,
        prompt: Prompt,
        conversation_id: &str,
        filter_expression: Option<String>,
    ) -> Result<ModelStream> {
        let request = self.request(prompt, conversation_id, filter_expression);
        Chain::new(&self.advisors, self.terminal.as_ref())
            .next_stream(request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatResponse;
    use crate::test_support::ScriptedModel;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Advisor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn advise_call(&self, request: ChatRequest, chain: Chain<'_>) -> Result<ChatResponse> {
            self.log.lock().unwrap().push(format!("{}:in", self.name));
            let response = chain.next_call(request).await;
            self.log.lock().unwrap().push(format!("{}:out", self.name));
            response
        }
    }

    #[tokio::test]
    async fn test_advisors_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let advisor = |name, order| -> Arc<dyn Advisor> {
            Arc::new(Recording {
                name,
                order,
                log: log.clone(),
            })
        };
        let client = ChatClient::builder(ScriptedModel::constant("ok"))
            .advisor(advisor("late", 10))
            .advisor(advisor("early", -10))
            .advisor(advisor("middle-a", 0))
            .advisor(advisor("middle-b", 0))
            .build();

        assert_eq!(client.advisor_names(), vec!["early", "middle-a", "middle-b", "late"]);
        client.call(Prompt::new("hi"), "c", None).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "early:in", "middle-a:in", "middle-b:in", "late:in", "late:out", "middle-b:out",
                "middle-a:out", "early:out"
            ]
        );
    }

    #[tokio::test]
    async fn test_request_options_override_defaults() {
        let model = ScriptedModel::constant("ok");
        let client = ChatClient::builder(model.clone())
            .default_options(ChatOptions {
                temperature: Some(0.0),
                max_tokens: Some(100),
                ..Default::default()
            })
            .default_system("be brief")
            .build();

        let prompt = Prompt::new("hi").with_options(ChatOptions {
            temperature: Some(0.9),
            ..Default::default()
        });
        client.call(prompt, "c", None).await.unwrap();

        let sent = &model.recorded()[0];
        assert_eq!(sent.options.temperature, Some(0.9));
        assert_eq!(sent.options.max_tokens, Some(100));
        assert_eq!(sent.messages[0], Message::system("be brief"));
    }

    #[tokio::test]
    async fn test_memory_advisor_prepends_history() {
        let memory = Arc::new(ConversationMemory::new(10, true));
        let model = ScriptedModel::new(|req| Ok(ChatResponse::text(format!("seen {}", req.messages.len()))));
        let client = ChatClient::builder(model.clone())
            .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
            .build();

        client
            .call(Prompt::new("first").with_system("rules"), "c1", None)
            .await
            .unwrap();
        let second = client.call(Prompt::new("second"), "c1", None).await.unwrap();
        assert_eq!(second.content, "seen 4");

        let sent = &model.recorded()[1].messages;
        let roles: Vec<Role> = sent.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);

        let stored = memory.read("c1").await;
        let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["rules", "first", "seen 2", "second", "seen 4"]);
    }

    #[tokio::test]
    async fn test_failed_call_commits_nothing() {
        let memory = Arc::new(ConversationMemory::new(10, true));
        let client = ChatClient::builder(ScriptedModel::new(|_| Err(GatewayError::model("down"))))
            .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
            .build();
        assert!(client.call(Prompt::new("hello"), "c1", None).await.is_err());
        assert!(memory.read("c1").await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_commits_after_drain_only() {
        let memory = Arc::new(ConversationMemory::new(10, true));
        let client = ChatClient::builder(ScriptedModel::constant("one two three"))
            .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
            .build();

        // abandoned after the first fragment
        let mut stream = client.stream(Prompt::new("hi"), "c1", None).await.unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);
        assert!(memory.read("c1").await.is_empty());

        let stream = client.stream(Prompt::new("hi"), "c1", None).await.unwrap();
        let events: Vec<_> = stream.collect().await;
        assert!(events.iter().all(|e| e.is_ok()));
        let stored = memory.read("c1").await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "one two three");
    }
}
