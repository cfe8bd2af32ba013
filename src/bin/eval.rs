use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use triage::chat::TriageEngine;
use triage::cli::CommonArgs;
use triage::config::AppConfig;
use triage::db::Database;
use triage::evaluate::{evaluate, read_records, timestamped_path, EvalOptions};
use triage::index::open_index;
use triage::judgment::AnswerFormat;
use triage::llm::build_embedder;

#[derive(Parser, Debug)]
#[command(name = "eval")]
#[command(about = "Run a rate-limited triage evaluation over a JSONL file")]
struct Cli {
    #[arg(long)]
    input: PathBuf,
    /// Must end in `.jsonl`; a timestamp is added to the name.
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value = "general_symptoms_description")]
    query_field: String,
    #[arg(long, default_value = "condition_title")]
    target_document_field: String,
    /// `tool`, `s1` or `deepseek_r1`. Defaults to `s1` with budget forcing.
    #[arg(long)]
    answer_format: Option<AnswerFormat>,
    #[arg(long, default_value_t = false)]
    generate_only: bool,
    #[arg(long, default_value_t = 60)]
    max_queries_per_minute: u32,
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let output = timestamped_path(&cli.output)?;
    let records = read_records(&cli.input)?;
    if records.is_empty() {
        anyhow::bail!("no records found in {}", cli.input.display());
    }

    let config = AppConfig::load(cli.common.overrides())?;
    let answer_format = cli.answer_format.unwrap_or(if config.pipeline.budget_forcing {
        AnswerFormat::S1
    } else {
        AnswerFormat::ToolCall
    });

    let db = Database::new(&config).await?;
    let (index, _) = open_index(&config, build_embedder(&config.models), &db).await?;
    let mut engine = TriageEngine::from_config(&config, Arc::new(index))?;
    if answer_format == AnswerFormat::ToolCall {
        engine = engine.with_judgment_tool();
    }

    let options = EvalOptions {
        query_field: cli.query_field,
        target_document_field: cli.target_document_field,
        answer_format,
        generate_only: cli.generate_only,
        max_queries_per_minute: cli.max_queries_per_minute,
    };

    println!("Writing results to {}", output.display());
    let summary = evaluate(&engine, records, &output, &options).await?;

    println!("Eval records: {}", summary.total);
    if !options.generate_only {
        for line in summary.lines() {
            println!("{line}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
