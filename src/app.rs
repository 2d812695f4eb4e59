//! Startup wiring.
//!
//! Builds every long-lived component from [`Config`] once: the model
//! clients, the vector index, conversation memory, the tool registry, and
//! one [`ChatClient`] per enabled mode. Components are passed explicitly
//! to whatever needs them.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::advisor::{ChatClient, LoggerAdvisor, MemoryAdvisor, RetrievalAdvisor};
use crate::chat::{ChatMode, Gateway};
use crate::chunk::TextSplitter;
use crate::config::Config;
use crate::embedding::{create_embedding_model, EmbeddingModel};
use crate::enrich::KeywordEnricher;
use crate::ingest::{IngestReport, IngestionPipeline, JsonLogWriter, VectorIndexWriter};
use crate::llm::{create_chat_model, ChatModel};
use crate::memory::ConversationMemory;
use crate::models::ChatOptions;
use crate::rag::{
    ContextualQueryAugmenter, MultiQueryExpander, RetrievalOrchestrator, SearchResultPrinter,
    TranslationQueryTransformer, VectorStoreRetriever,
};
use crate::reader::FilesystemReader;
use crate::tools::{ToolDispatcher, ToolRegistry};
use crate::vector_store::InMemoryVectorIndex;

pub struct App {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    pub index: Arc<InMemoryVectorIndex>,
    pub tools: Arc<ToolRegistry>,
    chat_model: Arc<dyn ChatModel>,
}

impl App {
    /// Build from config with the configured model provider.
    pub fn from_config(config: Config) -> Result<Self> {
        let chat_model = create_chat_model(&config.model)?;
        let embedder = create_embedding_model(&config.model)?;
        let tools = ToolRegistry::from_config(&config.tools.weather)?;
        Self::with_models(config, chat_model, embedder, tools)
    }

    /// Build from config around the given models and tools.
    pub fn with_models(
        config: Config,
        chat_model: Arc<dyn ChatModel>,
        embedder: Arc<dyn EmbeddingModel>,
        tools: ToolRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let tools = Arc::new(tools);

        let index = Arc::new(InMemoryVectorIndex::new(
            embedder.clone(),
            config.model.batch_size,
        ));
        if let Some(path) = &config.vector_store.path {
            index.load(path)?;
        }

        let memory = Arc::new(ConversationMemory::new(
            config.memory.max_messages,
            config.memory.retain_system,
        ));
        let memory_advisor = Arc::new(MemoryAdvisor::new(memory.clone()));
        let logger = Arc::new(LoggerAdvisor);

        let one_shot = ChatClient::builder(chat_model.clone())
            .default_options(ChatOptions {
                temperature: config.chat.plain_temperature,
                ..Default::default()
            })
            .advisor(logger.clone())
            .build();
        let mut gateway = Gateway::new(one_shot, memory, tools.clone());

        if config.modes.plain {
            let client = ChatClient::builder(chat_model.clone())
                .default_options(ChatOptions {
                    temperature: config.chat.plain_temperature,
                    ..Default::default()
                })
                .advisor(memory_advisor.clone())
                .advisor(logger.clone())
                .build();
            gateway = gateway.with_mode(ChatMode::Plain, client);
        }

        if config.modes.rag {
            let orchestrator = retrieval_orchestrator(&config, chat_model.clone(), embedder, index.clone());
            let client = ChatClient::builder(chat_model.clone())
                .default_options(ChatOptions {
                    temperature: Some(config.chat.rag_temperature),
                    ..Default::default()
                })
                .advisor(memory_advisor.clone())
                .advisor(Arc::new(RetrievalAdvisor::new(Arc::new(orchestrator))))
                .advisor(logger.clone())
                .build();
            gateway = gateway.with_mode(ChatMode::Rag, client);
        }

        if config.modes.tool {
            let dispatcher = ToolDispatcher::new(
                chat_model.clone(),
                tools.clone(),
                config.tools.max_iterations,
                config.tools.fail_on_error,
            );
            let client = ChatClient::builder(Arc::new(dispatcher))
                .default_options(ChatOptions {
                    temperature: Some(config.chat.tool_temperature),
                    ..Default::default()
                })
                .default_system(config.chat.system_prompt.clone())
                .advisor(memory_advisor)
                .advisor(logger)
                .build();
            gateway = gateway.with_mode(ChatMode::Tool, client);
        }

        Ok(Self {
            config,
            gateway: Arc::new(gateway),
            index,
            tools,
            chat_model,
        })
    }

    pub fn ingestion_pipeline(&self) -> Result<IngestionPipeline> {
        let chunking = &self.config.chunking;
        let reader = FilesystemReader::from_config(&self.config.ingest)?;
        let mut pipeline = IngestionPipeline::new(
            Arc::new(reader),
            TextSplitter::new(chunking.chunk_size, chunking.chunk_overlap, chunking.mode),
        );
        let enrichment = &self.config.enrichment;
        if enrichment.enabled {
            pipeline = pipeline.with_enricher(KeywordEnricher::new(
                self.chat_model.clone(),
                enrichment.keyword_count,
                enrichment.concurrency,
            ));
        }
        if self.config.ingest.debug_sink {
            pipeline = pipeline.with_writer(Arc::new(JsonLogWriter));
        }
        Ok(pipeline.with_writer(Arc::new(VectorIndexWriter::new(self.index.clone()))))
    }

    /// Ingest `[ingest].root` and persist the index if a path is configured.
    pub async fn ingest(&self, dry_run: bool) -> Result<IngestReport> {
        let pipeline = self.ingestion_pipeline()?;
        let sources: Vec<PathBuf> = vec![self.config.ingest.root.clone()];

        if dry_run {
            return Ok(pipeline.dry_run(&sources).await?);
        }
        let report = pipeline.run(&sources).await?;
        if let Some(path) = &self.config.vector_store.path {
            self.index.save(path)?;
        }
        Ok(report)
    }
}

fn retrieval_orchestrator(
    config: &Config,
    chat_model: Arc<dyn ChatModel>,
    embedder: Arc<dyn EmbeddingModel>,
    index: Arc<InMemoryVectorIndex>,
) -> RetrievalOrchestrator {
    let retrieval = &config.retrieval;
    let retriever = VectorStoreRetriever::new(
        embedder,
        index,
        retrieval.top_k,
        retrieval.similarity_threshold,
    );
    let mut orchestrator = RetrievalOrchestrator::new(
        Arc::new(retriever),
        ContextualQueryAugmenter::new(retrieval.empty_context),
        retrieval.top_k,
    );
    if retrieval.expand {
        orchestrator = orchestrator.with_expander(Arc::new(MultiQueryExpander::new(
            chat_model.clone(),
            retrieval.number_of_queries,
            retrieval.include_original,
        )));
    }
    if !retrieval.target_language.trim().is_empty() {
        orchestrator = orchestrator.with_transformer(Arc::new(TranslationQueryTransformer::new(
            chat_model,
            retrieval.target_language.trim(),
        )));
    }
    if retrieval.print_results {
        orchestrator = orchestrator.with_post_processor(Arc::new(SearchResultPrinter));
    }
    orchestrator
}
