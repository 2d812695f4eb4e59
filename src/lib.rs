//! # RAG Gateway
//!
//! A conversational AI gateway: documents are ingested into a vector index,
//! and chat requests are answered by a language model in one of three modes
//! (plain, retrieval-augmented, or tool-calling) with per-conversation
//! memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────────┐   ┌─────────────┐
//! │  Reader  │──▶│ Chunk ─▶ Enrich ─▶ Sink │──▶│ VectorIndex │
//! └──────────┘   └────────────────────────┘   └──────┬──────┘
//!                                                    │
//!       ┌─────────────┐    ┌─────────────────────────┴───┐
//!       │ HTTP / CLI  │──▶ │ Gateway ─▶ advisors ─▶ model │
//!       └─────────────┘    └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`extract`], [`reader`] | Source extraction (PDF, OOXML, text) |
//! | [`chunk`] | Text chunking |
//! | [`enrich`] | Keyword enrichment |
//! | [`ingest`] | Ingestion pipeline and sinks |
//! | [`embedding`], [`llm`], [`openai`] | Model provider abstraction |
//! | [`filter`] | Metadata filter expressions |
//! | [`vector_store`] | Vector index |
//! | [`memory`] | Conversation memory |
//! | [`rag`] | Query-time retrieval pipeline |
//! | [`advisor`] | Advisor chain and chat clients |
//! | [`tools`] | Tool registry and dispatch loop |
//! | [`chat`] | Mode selection and request handling |
//! | [`app`] | Startup wiring |
//! | [`server`] | HTTP server |

pub mod advisor;
pub mod app;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod filter;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod models;
pub mod openai;
pub mod rag;
pub mod reader;
pub mod server;
pub mod tools;
pub mod vector_store;

#[cfg(test)]
mod test_support;
