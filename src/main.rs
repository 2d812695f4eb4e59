//! # RAG Gateway CLI (`ragw`)
//!
//! ## Usage
//!
//! ```bash
//! ragw --config ./config/ragw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragw serve` | Start the HTTP gateway (ingesting first if `[ingest].enabled`) |
//! | `ragw ingest` | Extract, chunk, enrich, and index `[ingest].root` |
//! | `ragw chat` | Interactive chat in the terminal |
//! | `ragw tools` | List the tools offered to the model |
//!
//! ## Examples
//!
//! ```bash
//! # Check what would be ingested
//! ragw ingest --dry-run
//!
//! # Ask questions against the indexed documents
//! ragw chat --mode rag --filter "source == 'handbook.pdf'"
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use rag_gateway::app::App;
use rag_gateway::chat::{ChatMode, RequestExtras};
use rag_gateway::config::load_config;
use rag_gateway::models::Prompt;
use rag_gateway::server::run_server;

/// RAG Gateway: retrieval-augmented chat, tool calling, and document
/// ingestion over an OpenAI-compatible model provider.
#[derive(Parser)]
#[command(name = "ragw", version, about = "Retrieval-augmented chat gateway")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway.
    ///
    /// Runs one ingestion pass first when `[ingest].enabled` is set.
    Serve,

    /// Ingest documents from `[ingest].root` into the vector index.
    Ingest {
        /// Extract and chunk only; report counts without enriching or writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Chat interactively. Type `/clear` to forget the conversation and
    /// `exit` to quit.
    Chat {
        #[arg(long, value_enum, default_value_t = ChatMode::Rag)]
        mode: ChatMode,

        /// Conversation id used for memory.
        #[arg(long, default_value = "cli")]
        conversation: String,

        /// Metadata filter expression (rag mode only).
        #[arg(long)]
        filter: Option<String>,
    },

    /// List the tools offered to the model.
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let app = App::from_config(config)?;
            if app.config.ingest.enabled {
                app.ingest(false).await?.print();
            }
            run_server(&app).await?;
        }
        Commands::Ingest { dry_run } => {
            let app = App::from_config(config)?;
            app.ingest(dry_run).await?.print();
        }
        Commands::Chat {
            mode,
            conversation,
            filter,
        } => {
            let app = App::from_config(config)?;
            chat_loop(&app, mode, &conversation, filter).await?;
        }
        Commands::Tools => {
            let app = App::from_config(config)?;
            if app.tools.is_empty() {
                println!("No tools registered.");
            }
            for tool in app.tools.tools() {
                println!("{}", tool.name());
                println!("  {}", tool.description());
                println!("  parameters: {}", tool.parameters_schema());
            }
        }
    }

    Ok(())
}

async fn chat_loop(app: &App, mode: ChatMode, conversation: &str, filter: Option<String>) -> anyhow::Result<()> {
    println!(
        "chat ({} mode, conversation '{}'). Type `/clear` to forget it, `exit` to quit.",
        mode, conversation
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\nUser: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if line == "/clear" {
            app.gateway.forget(conversation).await?;
            println!("conversation '{}' cleared", conversation);
            continue;
        }

        let extras = RequestExtras {
            filter_expression: filter.clone(),
        };
        let mut fragments = match app.gateway.stream(Prompt::new(line), conversation, mode, extras).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("error: {}", e);
                continue;
            }
        };

        print!("\nAssistant: ");
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    print!("{}", text);
                    std::io::stdout().flush()?;
                }
                Err(e) => {
                    eprintln!("\nerror: {}", e);
                    break;
                }
            }
        }
        println!();
    }

    Ok(())
}
