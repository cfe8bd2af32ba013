use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use triage::cli::CommonArgs;
use triage::config::AppConfig;
use triage::db::Database;
use triage::index::open_index;
use triage::llm::build_embedder;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Build or refresh the persisted condition index")]
struct Cli {
    /// Rebuild even when a persisted index exists.
    #[arg(long, default_value_t = false)]
    force: bool,
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut overrides = cli.common.overrides();
    if cli.force {
        overrides.force_create = Some(true);
    }
    let config = AppConfig::load(overrides)?;

    let db = Database::new(&config).await?;
    let (_, status) = open_index(&config, build_embedder(&config.models), &db).await?;

    if status.loaded {
        println!(
            "Index already present. parents={} chunks={} (use --force to rebuild)",
            status.stats.parent_count, status.stats.chunk_count
        );
    } else {
        println!(
            "Index built. backend={} parents={} chunks={}",
            config.index.backend.as_str(),
            status.stats.parent_count,
            status.stats.chunk_count
        );
    }

    if let Some(manifest) = db.latest_manifest().await? {
        println!(
            "Latest manifest: sha256={} at {}",
            manifest.source_hash, manifest.created_at
        );
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
