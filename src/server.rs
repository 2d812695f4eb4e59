//! HTTP server.
//!
//! Thin transport over [`Gateway`]: request bodies become [`Prompt`]s,
//! responses are JSON, and streams are Server-Sent Events with one text
//! fragment per event.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/ai?userPrompt=` | One-shot plain answer, no memory |
//! | `POST` | `/chat/call`, `/chat/stream` | Plain mode |
//! | `POST` | `/chat/emotion` | Sentiment of the user prompt |
//! | `POST` | `/rag/call`, `/rag/stream` | RAG mode |
//! | `POST` | `/tool/call`, `/tool/stream` | Tool mode |
//! | `GET`  | `/tools/list` | Registered tool schemas |
//! | `DELETE` | `/conversations/{conversationId}` | Forget a conversation's memory |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "userPrompt must not be blank" } }
//! ```
//!
//! `bad_request` and `empty_context` map to 400, `model_provider_error` to
//! 502, everything else to 500. A stream that fails after it started ends
//! with an `error` event carrying the same `{code, message}` object.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;
use crate::chat::{ChatMode, EmotionEvaluation, Gateway, RequestExtras};
use crate::error::GatewayError;
use crate::models::{ChatOptions, ChatResponse, Prompt, TokenStream, ToolSchema};

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

/// Serve the gateway on `[server].bind` until the process is terminated.
pub async fn run_server(app: &App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = build_router(app.gateway.clone());

    println!("rag gateway listening on http://{}", bind_addr);
    for tool in app.tools.tools() {
        println!("  tool {}: {}", tool.name(), tool.description());
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ai", get(handle_ai))
        .route("/chat/call", post(handle_chat_call))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/chat/emotion", post(handle_chat_emotion))
        .route("/rag/call", post(handle_rag_call))
        .route("/rag/stream", post(handle_rag_stream))
        .route("/tool/call", post(handle_tool_call))
        .route("/tool/stream", post(handle_tool_stream))
        .route("/tools/list", get(handle_list_tools))
        .route("/conversations/{conversation_id}", delete(handle_forget))
        .layer(cors)
        .with_state(AppState { gateway })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InvalidRequest(_) | GatewayError::EmptyContext => StatusCode::BAD_REQUEST,
        GatewayError::ModelProvider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: rejection.body_text(),
        }
    }
}

// ============ Request body ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptBody {
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    user_prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    chat_options: Option<ChatOptions>,
    #[serde(default)]
    filter_expression: Option<String>,
}

impl PromptBody {
    fn into_parts(self) -> (Prompt, String, RequestExtras) {
        let mut prompt = Prompt::new(self.user_prompt);
        if let Some(system) = self.system_prompt.filter(|s| !s.trim().is_empty()) {
            prompt = prompt.with_system(system);
        }
        if let Some(options) = self.chat_options {
            prompt = prompt.with_options(options);
        }
        let extras = RequestExtras {
            filter_expression: self.filter_expression.filter(|f| !f.trim().is_empty()),
        };
        (prompt, self.conversation_id, extras)
    }
}

type Body = Result<Json<PromptBody>, JsonRejection>;

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /ai ============

#[derive(Deserialize)]
struct AiQuery {
    #[serde(rename = "userPrompt", default)]
    user_prompt: String,
}

async fn handle_ai(State(state): State<AppState>, Query(query): Query<AiQuery>) -> Result<String, AppError> {
    Ok(state.gateway.ask(&query.user_prompt).await?)
}

// ============ Calls ============

async fn call(state: AppState, mode: ChatMode, body: Body) -> Result<Json<ChatResponse>, AppError> {
    let Json(body) = body?;
    let (prompt, conversation_id, extras) = body.into_parts();
    let response = state
        .gateway
        .call(prompt, &conversation_id, mode, extras)
        .await?;
    Ok(Json(response))
}

async fn handle_chat_call(State(state): State<AppState>, body: Body) -> Result<Json<ChatResponse>, AppError> {
    call(state, ChatMode::Plain, body).await
}

async fn handle_rag_call(State(state): State<AppState>, body: Body) -> Result<Json<ChatResponse>, AppError> {
    call(state, ChatMode::Rag, body).await
}

async fn handle_tool_call(State(state): State<AppState>, body: Body) -> Result<Json<ChatResponse>, AppError> {
    call(state, ChatMode::Tool, body).await
}

async fn handle_chat_emotion(
    State(state): State<AppState>,
    body: Body,
) -> Result<Json<EmotionEvaluation>, AppError> {
    let Json(body) = body?;
    let (prompt, conversation_id, _) = body.into_parts();
    let evaluation = state.gateway.evaluate_emotion(prompt, &conversation_id).await?;
    Ok(Json(evaluation))
}

// ============ Streams ============

async fn stream(state: AppState, mode: ChatMode, body: Body) -> Result<Response, AppError> {
    let Json(body) = body?;
    let (prompt, conversation_id, extras) = body.into_parts();
    let tokens = state
        .gateway
        .stream(prompt, &conversation_id, mode, extras)
        .await?;
    Ok(Sse::new(sse_events(tokens))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// One `message` event per fragment; a failure ends the stream with an
/// `error` event.
fn sse_events(tokens: TokenStream) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    futures::stream::unfold(Some(tokens), |tokens| async move {
        let mut tokens = tokens?;
        match tokens.next().await? {
            // SSE cannot carry carriage returns
            Ok(text) => Some((Ok(Event::default().data(text.replace('\r', ""))), Some(tokens))),
            Err(err) => {
                tracing::warn!(code = err.code(), error = %err, "stream failed");
                let detail = ErrorDetail {
                    code: err.code().to_string(),
                    message: err.to_string().replace('\r', ""),
                };
                let event = Event::default()
                    .event("error")
                    .json_data(&detail)
                    .unwrap_or_else(|_| Event::default().event("error").data(err.code()));
                Some((Ok(event), None))
            }
        }
    })
}

async fn handle_chat_stream(State(state): State<AppState>, body: Body) -> Result<Response, AppError> {
    stream(state, ChatMode::Plain, body).await
}

async fn handle_rag_stream(State(state): State<AppState>, body: Body) -> Result<Response, AppError> {
    stream(state, ChatMode::Rag, body).await
}

async fn handle_tool_stream(State(state): State<AppState>, body: Body) -> Result<Response, AppError> {
    stream(state, ChatMode::Tool, body).await
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolSchema>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.gateway.tool_schemas(),
    })
}

// ============ DELETE /conversations/{conversationId} ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ForgetResponse {
    conversation_id: String,
    forgotten: bool,
}

async fn handle_forget(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ForgetResponse>, AppError> {
    let forgotten = state.gateway.forget(&conversation_id).await?;
    Ok(Json(ForgetResponse {
        conversation_id,
        forgotten,
    }))
}
