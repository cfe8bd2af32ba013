use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use triage::chat::TriageEngine;
use triage::cli::CommonArgs;
use triage::db::Database;
use triage::index::open_index;
use triage::llm::build_embedder;
use triage::{run_server, AppConfig};

#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(about = "Serve the clinical triage chat API")]
struct Cli {
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    log_dir: Option<std::path::PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut overrides = cli.common.overrides();
    overrides.bind_addr = cli.bind;
    overrides.log_dir = cli.log_dir;
    let config = AppConfig::load(overrides)?;

    let db = Database::new(&config).await?;
    let embedder = build_embedder(&config.models);
    let (index, status) = open_index(&config, embedder, &db).await?;
    tracing::info!(
        loaded = status.loaded,
        parents = status.stats.parent_count,
        chunks = status.stats.chunk_count,
        "index ready"
    );

    let engine = TriageEngine::from_config(&config, Arc::new(index))?;
    tracing::info!(
        conversational = config.pipeline.conversational,
        rerank = config.pipeline.rerank,
        budget_forcing = config.pipeline.budget_forcing,
        nodes = ?engine.graph().nodes(),
        "engine ready"
    );

    run_server(config, engine).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
