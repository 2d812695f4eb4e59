//! Error taxonomy for the gateway pipelines.
//!
//! Ingestion-time errors ([`GatewayError::Extraction`], [`GatewayError::IndexWrite`])
//! abort the whole run. Query-time errors surface to the caller as a single
//! failed call or as a terminal `error` event on a stream. Tool failures are
//! normally folded back into the conversation and only appear here when the
//! dispatcher is configured to treat them as fatal.
//!
//! Every variant carries a stable machine-readable [`code`](GatewayError::code)
//! used by the HTTP error contract.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("extraction failed for {location}: {message}")]
    Extraction { location: String, message: String },

    #[error("index write failed: {0}")]
    IndexWrite(String),

    #[error("model provider error: {0}")]
    ModelProvider(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("tool '{name}' failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("no documents matched the query and empty context is not allowed")]
    EmptyContext,

    #[error("conversation memory exceeded its window: {0}")]
    MemoryCapacity(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Extraction { .. } => "extraction_error",
            GatewayError::IndexWrite(_) => "index_write_error",
            GatewayError::ModelProvider(_) => "model_provider_error",
            GatewayError::Retrieval(_) => "retrieval_error",
            GatewayError::ToolExecution { .. } => "tool_execution_error",
            GatewayError::EmptyContext => "empty_context",
            GatewayError::MemoryCapacity(_) => "memory_capacity_violation",
            GatewayError::InvalidRequest(_) => "bad_request",
            GatewayError::Config(_) => "config_error",
        }
    }

    pub fn model(message: impl Into<String>) -> Self {
        GatewayError::ModelProvider(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        GatewayError::InvalidRequest(message.into())
    }

    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::ToolExecution {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::ModelProvider(err.to_string())
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
