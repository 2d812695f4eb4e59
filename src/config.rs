//! TOML configuration.
//!
//! Every section is optional; missing values fall back to the defaults
//! documented on each field's `default_*` function. All settings are fixed at
//! process start. Only `filterExpression` and chat options vary per request.
//!
//! ```toml
//! [model]
//! chat_model = "gpt-4o-mini"
//! embedding_model = "text-embedding-3-small"
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [retrieval]
//! similarity_threshold = 0.3
//! top_k = 3
//! target_language = "korean"
//!
//! [ingest]
//! enabled = true
//! root = "./docs"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::ChunkMode;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub modes: ModesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ============ [model] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            dims: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_batch_size() -> usize {
    64
}

// ============ [chunking] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub mode: ChunkMode,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            mode: ChunkMode::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

// ============ [enrichment] ============

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keyword_count")]
    pub keyword_count: usize,
    /// Maximum number of keyword requests in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyword_count: default_keyword_count(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_keyword_count() -> usize {
    4
}
fn default_concurrency() -> usize {
    4
}

// ============ [ingest] ============

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Run ingestion once when `serve` starts.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ingest_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Also write every ingested batch to the JSON debug log.
    #[serde(default)]
    pub debug_sink: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_ingest_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            debug_sink: false,
        }
    }
}

fn default_ingest_root() -> PathBuf {
    PathBuf::from("./docs")
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.docx".to_string(),
    ]
}

// ============ [vector_store] ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VectorStoreConfig {
    /// JSON file the in-memory index is loaded from and saved to.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ============ [retrieval] ============

/// What to do when retrieval returns no documents.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmptyContextPolicy {
    /// Pass the query through unchanged; the model answers from its own knowledge.
    #[default]
    Allow,
    /// Replace the query with an instruction to decline politely.
    Decline,
    /// Fail the request.
    Fail,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub expand: bool,
    #[serde(default = "default_number_of_queries")]
    pub number_of_queries: usize,
    #[serde(default)]
    pub include_original: bool,
    /// Language queries are translated into. Empty disables translation.
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default)]
    pub empty_context: EmptyContextPolicy,
    /// Print retrieved documents to stdout (interactive use).
    #[serde(default)]
    pub print_results: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
            expand: true,
            number_of_queries: default_number_of_queries(),
            include_original: false,
            target_language: default_target_language(),
            empty_context: EmptyContextPolicy::default(),
            print_results: false,
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.3
}
fn default_top_k() -> usize {
    3
}
fn default_number_of_queries() -> usize {
    3
}
fn default_target_language() -> String {
    "korean".to_string()
}

// ============ [memory] ============

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Exempt system turns from eviction.
    #[serde(default = "default_true")]
    pub retain_system: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            retain_system: true,
        }
    }
}

fn default_max_messages() -> usize {
    10
}

// ============ [tools] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Fail the request instead of feeding tool errors back to the model.
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default)]
    pub weather: WeatherToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            fail_on_error: false,
            weather: WeatherToolConfig::default(),
        }
    }
}

fn default_max_iterations() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeatherToolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_weather_url")]
    pub base_url: String,
    #[serde(default = "default_weather_lang")]
    pub lang: String,
    /// Return the weather summary to the caller without another model round.
    #[serde(default)]
    pub return_direct: bool,
}

impl Default for WeatherToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_weather_url(),
            lang: default_weather_lang(),
            return_direct: false,
        }
    }
}

fn default_weather_url() -> String {
    "https://wttr.in".to_string()
}
fn default_weather_lang() -> String {
    "ko".to_string()
}

// ============ [chat] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// System prompt used by tool mode when the request has none.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub plain_temperature: Option<f32>,
    #[serde(default = "default_rag_temperature")]
    pub rag_temperature: f32,
    #[serde(default = "default_tool_temperature")]
    pub tool_temperature: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            plain_temperature: None,
            rag_temperature: default_rag_temperature(),
            tool_temperature: default_tool_temperature(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the question, \
     and answer in the language of the question."
        .to_string()
}
fn default_rag_temperature() -> f32 {
    0.0
}
fn default_tool_temperature() -> f32 {
    0.2
}

// ============ [modes] / [server] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ModesConfig {
    #[serde(default = "default_true")]
    pub plain: bool,
    #[serde(default = "default_true")]
    pub rag: bool,
    #[serde(default = "default_true")]
    pub tool: bool,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            plain: true,
            rag: true,
            tool: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap == 0
        || config.chunking.chunk_overlap >= config.chunking.chunk_size
    {
        anyhow::bail!("chunking.chunk_overlap must be > 0 and < chunking.chunk_size");
    }

    // Validate enrichment
    if config.enrichment.keyword_count == 0 {
        anyhow::bail!("enrichment.keyword_count must be > 0");
    }
    if config.enrichment.concurrency == 0 {
        anyhow::bail!("enrichment.concurrency must be > 0");
    }

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.number_of_queries < 1 {
        anyhow::bail!("retrieval.number_of_queries must be >= 1");
    }

    // Validate memory and tools
    if config.memory.max_messages < 1 {
        anyhow::bail!("memory.max_messages must be >= 1");
    }
    if config.tools.max_iterations < 1 {
        anyhow::bail!("tools.max_iterations must be >= 1");
    }

    if config.model.batch_size == 0 {
        anyhow::bail!("model.batch_size must be > 0");
    }
    if config.model.dims == Some(0) {
        anyhow::bail!("model.dims must be > 0 when set");
    }
    match config.model.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown model provider: '{}'. Must be openai.", other),
    }

    Ok(())
}
