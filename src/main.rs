use anyhow::{Context, Result};
use clap::Parser;
use doctype_query::config::{LlmConfig, LlmProvider};
use doctype_query::execution::SqliteRecordStore;
use doctype_query::{EntityCatalog, PipelineConfig, QueryPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doctype-query")]
#[command(about = "Answer natural-language questions about ERP records")]
struct Args {
    /// The question, e.g. "how many purchase orders are submitted?"
    query: String,

    /// Entity catalog JSON (default: bundled ERP catalog)
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    /// SQLite database file (default: in-memory)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Planning backend: openrouter, gemini or rules
    #[arg(long)]
    provider: Option<LlmProvider>,

    /// Model name for the planning backend
    #[arg(long)]
    model: Option<String>,

    /// API key (or set OPENROUTER_API_KEY / GEMINI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Insert a few demo records before answering
    #[arg(long)]
    seed: bool,

    /// Print compact JSON instead of pretty JSON
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;

    if let Some(provider) = args.provider {
        let key = args.api_key.clone().or_else(|| config.llm.api_key.clone());
        config.llm = match (provider, key) {
            (LlmProvider::Gemini, Some(key)) => LlmConfig::gemini(key),
            (LlmProvider::OpenRouter, Some(key)) => LlmConfig::openrouter(key),
            (provider, key) => LlmConfig {
                provider,
                api_key: key,
                ..LlmConfig::default()
            },
        };
    } else if let Some(key) = args.api_key.clone() {
        config.llm.api_key = Some(key);
        if config.llm.provider == LlmProvider::Rules {
            config.llm = LlmConfig::openrouter(config.llm.api_key.take().unwrap_or_default());
        }
    }
    if let Some(model) = args.model {
        config.llm.model = model;
    }

    let catalog = match &args.catalog {
        Some(path) => EntityCatalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => EntityCatalog::builtin()?,
    };
    let catalog = Arc::new(catalog);

    let store = match &args.database {
        Some(path) => SqliteRecordStore::open(path, catalog.clone())?,
        None => SqliteRecordStore::in_memory(catalog.clone())?,
    };
    if args.seed {
        store.seed_demo_data()?;
    }

    info!("Planning with {:?} ({} entities in catalog)", config.llm.provider, catalog.len());
    let pipeline = QueryPipeline::from_config(&config, catalog, Arc::new(store))?;
    let response = pipeline.process(&args.query).await;

    let rendered = if args.compact {
        serde_json::to_string(&response)?
    } else {
        serde_json::to_string_pretty(&response)?
    };
    println!("{}", rendered);

    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}
