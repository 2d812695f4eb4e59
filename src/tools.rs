//! Model-callable tools and the dispatch loop.
//!
//! A [`Tool`] exposes a name, a description, and a JSON Schema for its
//! parameters. The [`ToolRegistry`] holds every tool offered to the model.
//!
//! [`ToolDispatcher`] wraps a [`ChatModel`] and itself implements
//! [`ChatModel`], so it can sit at the end of an advisor chain:
//!
//! ```text
//! model ──tool calls──▶ validate + execute ──tool turns──▶ model ──▶ … ──▶ final answer
//! ```
//!
//! Tool failures (bad arguments, unknown tool, handler error) become tool
//! turns carrying the error text so the model can recover, unless
//! `fail_on_error` is set. After `max_iterations` rounds the model is asked
//! one last time without tools.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::WeatherToolConfig;
use crate::error::{GatewayError, Result};
use crate::llm::ChatModel;
use crate::models::{
    ChatRequest, ChatResponse, Message, ModelEvent, ModelStream, ToolCall, ToolInvocation,
    ToolOutcome, ToolSchema,
};

// ============ Tool trait ============

/// Per-invocation context handed to tools.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model calls the tool by.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema (`type: "object"`) for the arguments.
    fn parameters_schema(&self) -> Value;

    /// Hand the result straight back to the caller instead of to the model.
    fn return_direct(&self) -> bool {
        false
    }

    /// Run the tool. `params` has already been validated against the schema.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the built-in weather tools, if enabled.
    pub fn from_config(config: &WeatherToolConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        if config.enabled {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()?;
            registry.register(Box::new(WeatherTool::new(http.clone(), config)));
            registry.register(Box::new(WeatherDetailsTool::new(http, config)));
        }
        Ok(registry)
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Function schemas advertised to the model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

/// Check `params` against a tool's JSON Schema.
///
/// Verifies required keys, primitive types, and `enum` membership, and
/// fills in `default` values for absent properties.
pub fn validate_params(schema: &Value, params: &Value) -> anyhow::Result<Value> {
    let provided = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => bail!("arguments must be a JSON object, got {}", json_type_name(other)),
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();
    let required = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
        .unwrap_or_default();

    for field in required {
        if !provided.contains_key(field) {
            bail!("missing required parameter: {}", field);
        }
    }

    let mut result = provided.clone();
    for (name, prop) in &properties {
        let Some(value) = provided.get(name) else {
            if let Some(default) = prop.get("default") {
                result.insert(name.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                bail!(
                    "parameter '{}' must be of type '{}', got {}",
                    name,
                    expected,
                    json_type_name(value)
                );
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                let allowed: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                bail!(
                    "parameter '{}' must be one of [{}], got {}",
                    name,
                    allowed.join(", "),
                    value
                );
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============ Weather tools ============

/// One-line summary template understood by wttr.in.
const WEATHER_SUMMARY_FORMAT: &str = "현재 %l의 날씨는 %C 상태이며, 기온은 %t, 체감 기온은 %f, 풍속은 %W, 습도는 %h, 강수량은 %p입니다.";

fn location_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "location": { "type": "string", "description": "Location name, e.g. Seoul" }
        },
        "required": ["location"]
    })
}

fn location_param(params: &Value) -> anyhow::Result<String> {
    let location = params
        .get("location")
        .and_then(|l| l.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if location.is_empty() {
        bail!("location must not be blank");
    }
    Ok(location.to_string())
}

/// URL of the wttr.in page for `location`, which becomes a single
/// percent-encoded path segment.
pub fn weather_url(base_url: &str, location: &str) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base_url)
        .with_context(|| format!("invalid weather base_url: {}", base_url))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("weather base_url cannot take a path: {}", base_url))?
        .pop_if_empty()
        .push(location);
    Ok(url)
}

async fn fetch_weather(
    http: &reqwest::Client,
    base_url: &str,
    location: &str,
    lang: &str,
    format: &str,
) -> anyhow::Result<reqwest::Response> {
    let response = http
        .get(weather_url(base_url, location)?)
        .query(&[("lang", lang), ("format", format)])
        .send()
        .await
        .with_context(|| format!("weather request for '{}' failed", location))?;
    let status = response.status();
    if !status.is_success() {
        bail!("weather service returned {} for '{}'", status, location);
    }
    Ok(response)
}

/// `getWeather`: current conditions as one sentence.
pub struct WeatherTool {
    http: reqwest::Client,
    base_url: String,
    lang: String,
    return_direct: bool,
}

impl WeatherTool {
    pub fn new(http: reqwest::Client, config: &WeatherToolConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.clone(),
            lang: config.lang.clone(),
            return_direct: config.return_direct,
        }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "getWeather"
    }

    fn description(&self) -> &str {
        "Look up the current weather for a location."
    }

    fn parameters_schema(&self) -> Value {
        location_schema()
    }

    fn return_direct(&self) -> bool {
        self.return_direct
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let location = location_param(&params)?;
        let response =
            fetch_weather(&self.http, &self.base_url, &location, &self.lang, WEATHER_SUMMARY_FORMAT)
                .await?;
        let text = response.text().await?;
        Ok(Value::String(text.trim().to_string()))
    }
}

/// `getWeatherDetails`: three-day forecast with sun and moon data.
pub struct WeatherDetailsTool {
    http: reqwest::Client,
    base_url: String,
    lang: String,
}

impl WeatherDetailsTool {
    pub fn new(http: reqwest::Client, config: &WeatherToolConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.clone(),
            lang: config.lang.clone(),
        }
    }
}

#[async_trait]
impl Tool for WeatherDetailsTool {
    fn name(&self) -> &str {
        "getWeatherDetails"
    }

    fn description(&self) -> &str {
        "Look up a three-day forecast for a location, including sunrise, sunset, moonrise, moonset, and moon phase."
    }

    fn parameters_schema(&self) -> Value {
        location_schema()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let location = location_param(&params)?;
        let response = fetch_weather(&self.http, &self.base_url, &location, &self.lang, "j1").await?;
        let report: WeatherReport = response
            .json()
            .await
            .with_context(|| format!("unexpected forecast format for '{}'", location))?;
        Ok(serde_json::to_value(report)?)
    }
}

/// Subset of wttr.in's `format=j1` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeatherReport {
    pub weather: Vec<DailyForecast>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyForecast {
    pub date: String,
    #[serde(default)]
    pub astronomy: Vec<Astronomy>,
    #[serde(rename(deserialize = "avgtempC"), deserialize_with = "lenient_number")]
    pub avg_temp_c: f64,
    #[serde(rename(deserialize = "maxtempC"), deserialize_with = "lenient_number")]
    pub max_temp_c: f64,
    #[serde(rename(deserialize = "mintempC"), deserialize_with = "lenient_number")]
    pub min_temp_c: f64,
    #[serde(rename(deserialize = "sunHour"), default, deserialize_with = "lenient_number")]
    pub sun_hour: f64,
    #[serde(rename(deserialize = "totalSnow_cm"), default, deserialize_with = "lenient_number")]
    pub total_snow_cm: f64,
    #[serde(rename(deserialize = "uvIndex"), default, deserialize_with = "lenient_number")]
    pub uv_index: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Astronomy {
    #[serde(default, deserialize_with = "lenient_number")]
    pub moon_illumination: f64,
    #[serde(default)]
    pub moon_phase: String,
    #[serde(default)]
    pub moonrise: String,
    #[serde(default)]
    pub moonset: String,
    #[serde(default)]
    pub sunrise: String,
    #[serde(default)]
    pub sunset: String,
}

/// wttr.in sends numbers as strings.
fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range")),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, got {}",
            json_type_name(&other)
        ))),
    }
}

// ============ Dispatcher ============

/// Outcome of executing one round of tool calls.
struct Round {
    turns: Vec<Message>,
    invocations: Vec<ToolInvocation>,
    /// Set when every call succeeded and every tool returns directly.
    direct: Option<String>,
}

#[derive(Clone)]
pub struct ToolDispatcher {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    max_iterations: usize,
    fail_on_error: bool,
}

impl ToolDispatcher {
    pub fn new(model: Arc<dyn ChatModel>, registry: Arc<ToolRegistry>, max_iterations: usize, fail_on_error: bool) -> Self {
        Self {
            model,
            registry,
            max_iterations: max_iterations.max(1),
            fail_on_error,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn prepare(&self, request: &ChatRequest) -> ChatRequest {
        let mut request = request.clone();
        if request.tools.is_empty() {
            request.tools = self.registry.schemas();
        }
        request
    }

    async fn invoke(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<(Value, bool)> {
        let Some(tool) = self.registry.find(&call.name) else {
            bail!("unknown tool: {}", call.name);
        };
        let params = validate_params(&tool.parameters_schema(), &call.arguments)?;
        let value = tool.execute(params, ctx).await?;
        Ok((value, tool.return_direct()))
    }

    /// Execute `calls` in order and build the tool turns answering them.
    async fn run_round(&self, calls: &[ToolCall], conversation_id: &str) -> Result<Round> {
        let ctx = ToolContext {
            conversation_id: conversation_id.to_string(),
        };
        let mut round = Round {
            turns: Vec::with_capacity(calls.len()),
            invocations: Vec::with_capacity(calls.len()),
            direct: None,
        };
        let mut all_direct = !calls.is_empty();
        let mut direct_parts = Vec::new();

        for call in calls {
            match self.invoke(call, &ctx).await {
                Ok((value, return_direct)) => {
                    tracing::info!(tool = %call.name, "tool executed");
                    let content = match &value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    all_direct &= return_direct;
                    direct_parts.push(content.clone());
                    round.turns.push(Message::tool_result(&call.id, &call.name, content));
                    round.invocations.push(ToolInvocation {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        outcome: ToolOutcome::Result(value),
                    });
                }
                Err(e) => {
                    let err = GatewayError::tool(&call.name, format!("{:#}", e));
                    if self.fail_on_error {
                        return Err(err);
                    }
                    tracing::warn!(tool = %call.name, error = %err, "tool failed, returning error to model");
                    all_direct = false;
                    round
                        .turns
                        .push(Message::tool_result(&call.id, &call.name, format!("Error: {}", err)));
                    round.invocations.push(ToolInvocation {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        outcome: ToolOutcome::Error(err.to_string()),
                    });
                }
            }
        }

        if all_direct {
            round.direct = Some(direct_parts.join("\n"));
        }
        Ok(round)
    }

    /// Runs the rounds until they finish or the receiver is dropped; the
    /// latter cancels any in-flight model stream or tool call.
    async fn stream_loop(self, request: ChatRequest, tx: mpsc::Sender<Result<ModelEvent>>) {
        tokio::select! {
            result = self.forward_rounds(request, &tx) => {
                if let Err(e) = result {
                    let _ = tx.send(Err(e)).await;
                }
            }
            _ = tx.closed() => {
                tracing::debug!("stream dropped, cancelling tool loop");
            }
        }
    }

    /// Streaming counterpart of [`generate`](ChatModel::generate).
    ///
    /// A round that ends in tool calls is closed with a
    /// [`ModelEvent::ToolCalls`] event, so consumers can discard the text
    /// streamed during it.
    async fn forward_rounds(&self, request: ChatRequest, tx: &mpsc::Sender<Result<ModelEvent>>) -> Result<()> {
        let mut request = self.prepare(&request);

        for iteration in 0..=self.max_iterations {
            if iteration == self.max_iterations {
                tracing::warn!(max_iterations = self.max_iterations, "tool loop bound reached, asking for a final answer");
                request.tools.clear();
            }

            let mut events = self.model.stream(&request).await?;
            let mut content = String::new();
            let mut calls = Vec::new();
            let mut finish = None;

            while let Some(event) = events.next().await {
                match event? {
                    ModelEvent::Delta(text) => {
                        content.push_str(&text);
                        if tx.send(Ok(ModelEvent::Delta(text))).await.is_err() {
                            return Ok(());
                        }
                    }
                    ModelEvent::ToolCalls(more) => calls.extend(more),
                    event @ ModelEvent::Finish { .. } => finish = Some(event),
                }
            }

            if calls.is_empty() || request.tools.is_empty() {
                let finish = finish.unwrap_or(ModelEvent::Finish {
                    reason: Some("stop".to_string()),
                    usage: None,
                });
                let _ = tx.send(Ok(finish)).await;
                return Ok(());
            }

            if tx.send(Ok(ModelEvent::ToolCalls(calls.clone()))).await.is_err() {
                return Ok(());
            }
            let round = self.run_round(&calls, &request.conversation_id).await?;
            if let Some(direct) = round.direct {
                if tx.send(Ok(ModelEvent::Delta(direct))).await.is_err() {
                    return Ok(());
                }
                let _ = tx
                    .send(Ok(ModelEvent::Finish {
                        reason: Some("return_direct".to_string()),
                        usage: None,
                    }))
                    .await;
                return Ok(());
            }
            request.messages.push(Message::assistant_tool_calls(content, calls));
            request.messages.extend(round.turns);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatModel for ToolDispatcher {
    fn model_name(&self) -> &str {
        self.model.model_name()
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut request = self.prepare(request);
        let mut invocations = Vec::new();

        for _ in 0..self.max_iterations {
            let response = self.model.generate(&request).await?;
            if !response.has_tool_calls() {
                return Ok(ChatResponse {
                    tool_invocations: invocations,
                    ..response
                });
            }

            let round = self.run_round(&response.tool_calls, &request.conversation_id).await?;
            invocations.extend(round.invocations);
            if let Some(direct) = round.direct {
                return Ok(ChatResponse {
                    content: direct,
                    finish_reason: Some("return_direct".to_string()),
                    model: response.model,
                    tool_invocations: invocations,
                    ..Default::default()
                });
            }
            request
                .messages
                .push(Message::assistant_tool_calls(response.content, response.tool_calls));
            request.messages.extend(round.turns);
        }

        tracing::warn!(max_iterations = self.max_iterations, "tool loop bound reached, asking for a final answer");
        request.tools.clear();
        let response = self.model.generate(&request).await?;
        Ok(ChatResponse {
            tool_calls: Vec::new(),
            tool_invocations: invocations,
            ..response
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ModelStream> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.clone().stream_loop(request.clone(), tx));
        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}
