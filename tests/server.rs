mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use common::{app, BrokenStreamModel, ScriptedModel};
use rag_gateway::app::App;
use rag_gateway::config::WeatherToolConfig;
use rag_gateway::llm::ChatModel;
use rag_gateway::models::ChatResponse;
use rag_gateway::server::build_router;
use rag_gateway::tools::ToolRegistry;

/// Start the router on an ephemeral port; returns the base URL.
async fn spawn_server(app: &App) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(app.gateway.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn test_app(model: Arc<dyn ChatModel>) -> (tempfile::TempDir, App) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("letters.txt"), "ABCDEFGHIJ").unwrap();
    let tools = ToolRegistry::from_config(&WeatherToolConfig::default()).unwrap();
    let app = app(dir.path(), "", model, tools);
    (dir, app)
}

#[tokio::test]
async fn test_health() {
    let (_dir, app) = test_app(ScriptedModel::constant("ok"));
    let base = spawn_server(&app).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_chat_call_returns_answer() {
    let (_dir, app) = test_app(ScriptedModel::constant("Hello!"));
    let base = spawn_server(&app).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/chat/call", base))
        .json(&json!({"conversationId": "c1", "userPrompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"], "Hello!");
    assert_eq!(app.gateway.memory().read("c1").await.len(), 2);
}

#[tokio::test]
async fn test_chat_call_honours_system_prompt_and_options() {
    let model = ScriptedModel::new(|req| {
        let system = req.messages[0].content.clone();
        let temperature = req.options.temperature.unwrap_or_default();
        Ok(ChatResponse::text(format!("{} @ {}", system, temperature)))
    });
    let (_dir, app) = test_app(model);
    let base = spawn_server(&app).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/chat/call", base))
        .json(&json!({
            "conversationId": "c2",
            "userPrompt": "hi",
            "systemPrompt": "Be brief.",
            "chatOptions": {"temperature": 0.25}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["content"], "Be brief. @ 0.25");
}

#[tokio::test]
async fn test_chat_stream_emits_sse_fragments() {
    let (_dir, app) = test_app(ScriptedModel::constant("one two"));
    let base = spawn_server(&app).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/chat/stream", base))
        .json(&json!({"conversationId": "s1", "userPrompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = resp.text().await.unwrap();
    assert!(text.contains("data: one "));
    assert!(text.contains("data: two"));
    assert!(!text.contains("event: error"));
    assert_eq!(app.gateway.memory().read("s1").await.len(), 2);
}

#[tokio::test]
async fn test_blank_prompt_is_bad_request() {
    let (_dir, app) = test_app(ScriptedModel::constant("unused"));
    let base = spawn_server(&app).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/chat/call", base))
        .json(&json!({"conversationId": "c1", "userPrompt": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let (_dir, app) = test_app(ScriptedModel::constant("unused"));
    let base = spawn_server(&app).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/chat/call", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_invalid_filter_is_bad_request() {
    let (_dir, app) = test_app(ScriptedModel::constant("unused"));
    let base = spawn_server(&app).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/rag/call", base))
        .json(&json!({
            "conversationId": "r1",
            "userPrompt": "abcd",
            "filterExpression": "source =="
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(app.gateway.memory().read("r1").await.is_empty());
}

#[tokio::test]
async fn test_rag_call_returns_documents() {
    let (_dir, app) = test_app(ScriptedModel::constant("grounded"));
    app.ingest(false).await.unwrap();
    let base = spawn_server(&app).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/rag/call", base))
        .json(&json!({"conversationId": "r2", "userPrompt": "abcd"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["content"], "grounded");
    assert_eq!(body["grounding"], "grounded");
    assert_eq!(body["documents"][0]["text"], "ABCD");
}

#[tokio::test]
async fn test_model_failure_is_bad_gateway() {
    let (_dir, app) = test_app(Arc::new(BrokenStreamModel));
    let base = spawn_server(&app).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/chat/call", base))
        .json(&json!({"conversationId": "b1", "userPrompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "model_provider_error");
}

#[tokio::test]
async fn test_stream_failure_ends_with_error_event() {
    let (_dir, app) = test_app(Arc::new(BrokenStreamModel));
    let base = spawn_server(&app).await;

    let text = reqwest::Client::new()
        .post(format!("{}/chat/stream", base))
        .json(&json!({"conversationId": "b2", "userPrompt": "hi"}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("data: partial "));
    assert!(text.contains("event: error"));
    assert!(text.contains("model_provider_error"));
    assert!(app.gateway.memory().read("b2").await.is_empty());
}

#[tokio::test]
async fn test_one_shot_ai_endpoint_keeps_no_memory() {
    let (_dir, app) = test_app(ScriptedModel::constant("quick answer"));
    let base = spawn_server(&app).await;

    let resp = reqwest::get(format!("{}/ai?userPrompt=hello", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "quick answer");
    assert_eq!(app.gateway.memory().conversations(), 0);
}

#[tokio::test]
async fn test_emotion_endpoint_parses_evaluation() {
    let model = ScriptedModel::constant(r#"{"emotion": "POSITIVE", "reason": ["sounds happy"]}"#);
    let (_dir, app) = test_app(model);
    let base = spawn_server(&app).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/chat/emotion", base))
        .json(&json!({"conversationId": "e1", "userPrompt": "What a lovely day!"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["emotion"], "POSITIVE");
    assert_eq!(body["reason"][0], "sounds happy");
}

#[tokio::test]
async fn test_list_tools() {
    let (_dir, app) = test_app(ScriptedModel::constant("unused"));
    let base = spawn_server(&app).await;

    let body: Value = reqwest::get(format!("{}/tools/list", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["getWeather", "getWeatherDetails"]);
    assert_eq!(body["tools"][0]["parameters"]["type"], "object");
}

#[tokio::test]
async fn test_delete_conversation_forgets_memory() {
    let (_dir, app) = test_app(ScriptedModel::constant("Hello!"));
    let base = spawn_server(&app).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/chat/call", base))
        .json(&json!({"conversationId": "d1", "userPrompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(app.gateway.memory().conversations(), 1);

    let resp = client.delete(format!("{}/conversations/d1", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["conversationId"], "d1");
    assert_eq!(body["forgotten"], true);
    assert!(app.gateway.memory().read("d1").await.is_empty());
    assert_eq!(app.gateway.memory().conversations(), 0);

    let again: Value = client
        .delete(format!("{}/conversations/d1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["forgotten"], false);
}
