use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::chat::TriageEngine;
use crate::error::ConfigError;
use crate::judgment::{grade, parse, AnswerFormat, Judgment};
use crate::models::{FailedTurn, QueryOutcome, TurnSummary};

pub type Record = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub query_field: String,
    pub target_document_field: String,
    pub answer_format: AnswerFormat,
    pub generate_only: bool,
    pub max_queries_per_minute: u32,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            query_field: "general_symptoms_description".to_string(),
            target_document_field: "condition_title".to_string(),
            answer_format: AnswerFormat::ToolCall,
            generate_only: false,
            max_queries_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalSummary {
    pub total: usize,
    pub retriever_matches: usize,
    pub reranked_retriever_matches: usize,
    pub condition_matches: usize,
    pub severity_matches: usize,
}

impl EvalSummary {
    fn add(&mut self, result: &Record) {
        let flag = |key: &str| result.get(key).and_then(Value::as_bool).unwrap_or(false) as usize;
        self.total += 1;
        self.retriever_matches += flag("retriever_match");
        self.reranked_retriever_matches += flag("reranked_retriever_match");
        self.condition_matches += flag("conditions_match");
        self.severity_matches += flag("severity_match");
    }

    pub fn lines(&self) -> Vec<String> {
        [
            ("retriever matches", self.retriever_matches),
            ("reranked retriever matches", self.reranked_retriever_matches),
            ("condition matches", self.condition_matches),
            ("severity matches", self.severity_matches),
        ]
        .iter()
        .map(|(label, sum)| {
            let pct = if self.total == 0 {
                0.0
            } else {
                *sum as f64 / self.total as f64 * 100.0
            };
            format!("Proportion of {label}: {sum}/{} = {pct:.2}%", self.total)
        })
        .collect()
    }
}

pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed opening {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

pub fn timestamped_path(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return Err(ConfigError::InvalidValue {
            key: "output".to_string(),
            value: path.display().to_string(),
        });
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    Ok(path.with_file_name(format!("{stem}_{stamp}.jsonl")))
}

fn field_str(record: &Record, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn scores_sorted(scores: &[Option<f32>]) -> bool {
    scores.windows(2).all(|w| w[0] <= w[1])
}

fn answered_fields(summary: &TurnSummary) -> Record {
    let mut fields = Record::new();
    fields.insert("retrieved_documents_sources".into(), json!(summary.retrieved_sources));
    fields.insert("retrieved_documents_scores".into(), json!(summary.retrieved_scores));
    fields.insert(
        "retrieved_documents_scores_sorted".into(),
        json!(scores_sorted(&summary.retrieved_scores)),
    );
    fields.insert("reranked_documents_sources".into(), json!(summary.reranked_sources));
    fields.insert("reranked_documents_scores".into(), json!(summary.reranked_scores));
    fields.insert(
        "reranked_documents_scores_sorted".into(),
        if summary.reranked_scores.is_empty() {
            Value::Null
        } else {
            json!(scores_sorted(&summary.reranked_scores))
        },
    );
    fields.insert("reranker_response".into(), json!(summary.reranker_response));
    fields.insert(
        "reranker_response_processed".into(),
        json!(summary.reranker_parsed_titles),
    );
    fields.insert("reranker_success".into(), json!(summary.reranker_success));
    fields.insert("system_prompt".into(), json!(summary.system_prompt));
    fields.insert("rag_message".into(), json!(summary.rag_message));
    fields.insert("rag_answer".into(), json!(summary.answer));
    fields.insert(
        "rag_tool_calls".into(),
        if summary.judgment_tool_calls.is_empty() {
            Value::Null
        } else {
            json!(summary.judgment_tool_calls)
        },
    );
    fields
}

fn failed_fields(failed: &FailedTurn) -> Record {
    let mut fields = Record::new();
    fields.insert("retrieved_documents_sources".into(), json!(failed.retrieved_sources));
    fields.insert("retrieved_documents_scores".into(), json!(failed.retrieved_scores));
    fields.insert(
        "retrieved_documents_scores_sorted".into(),
        json!(scores_sorted(&failed.retrieved_scores)),
    );
    fields.insert("reranked_documents_sources".into(), json!([]));
    fields.insert("reranked_documents_scores".into(), json!([]));
    fields.insert("reranked_documents_scores_sorted".into(), Value::Null);
    fields.insert("reranker_response".into(), Value::Null);
    fields.insert("reranker_response_processed".into(), Value::Null);
    fields.insert("reranker_success".into(), Value::Null);
    fields.insert("error".into(), json!(failed.error));
    fields
}

fn sources(result: &Record, key: &str) -> Vec<String> {
    result
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub async fn process_record(
    engine: &TriageEngine,
    item: Record,
    options: &EvalOptions,
) -> Result<Record> {
    let query = field_str(&item, &options.query_field)
        .with_context(|| format!("record has no {} field", options.query_field))?;
    let target = field_str(&item, &options.target_document_field).unwrap_or_default();
    let target_severity = field_str(&item, "severity_level").unwrap_or_default();
    let demographics = field_str(&item, "general_demographics");

    // Every record gets a thread of its own, so records never queue on one
    // thread lock and nothing outlives the record.
    let thread_id = uuid::Uuid::new_v4().to_string();
    engine.clear_history(&thread_id).await;
    let outcome = engine.query(&thread_id, &query, demographics).await;
    engine.clear_history(&thread_id).await;
    debug!(thread_id = %thread_id, "cleared evaluation thread");

    let (fields, judgment) = match &outcome {
        QueryOutcome::Answered(summary) => {
            let text = summary.clinical_judgment.as_deref().unwrap_or_default();
            let judgment = parse(options.answer_format, text, &summary.judgment_tool_calls);
            (answered_fields(summary), judgment)
        }
        QueryOutcome::Failed(failed) => {
            error!(query = %query, error = %failed.error, "evaluation query failed");
            (failed_fields(failed), Judgment::default())
        }
    };

    let mut result = item;
    result.insert("query_field".into(), json!(options.query_field));
    result.insert(
        "target_document_field".into(),
        json!(options.target_document_field),
    );
    result.extend(fields);

    if !options.generate_only {
        let retrieved = sources(&result, "retrieved_documents_sources");
        let reranked = sources(&result, "reranked_documents_sources");
        let verdict = grade(&judgment, &target, &target_severity, &retrieved, &reranked);

        result.insert("conditions_match".into(), json!(verdict.conditions_match));
        result.insert("severity_match".into(), json!(verdict.severity_match));
        result.insert("retriever_match".into(), json!(retrieved.contains(&target)));
        result.insert(
            "reranked_retriever_match".into(),
            json!(reranked.contains(&target)),
        );
        result.insert("parsed_condition".into(), json!(judgment.condition));
        result.insert("parsed_severity_level".into(), json!(judgment.severity));
    }
    Ok(result)
}

async fn append_line(output: &Path, lock: &Mutex<()>, result: &Record) -> Result<()> {
    let mut line = serde_json::to_string(result)?;
    line.push('\n');

    let _guard = lock.lock().await;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .await
        .with_context(|| format!("opening {}", output.display()))?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

pub async fn evaluate(
    engine: &TriageEngine,
    records: Vec<Record>,
    output: &Path,
    options: &EvalOptions,
) -> Result<EvalSummary> {
    let interval = Duration::from_secs_f64(60.0 / options.max_queries_per_minute.max(1) as f64);
    info!(
        records = records.len(),
        interval_secs = interval.as_secs_f64(),
        output = %output.display(),
        "starting evaluation"
    );

    let lock = Arc::new(Mutex::new(()));
    let mut tasks = Vec::with_capacity(records.len());
    for item in records {
        tokio::time::sleep(interval).await;

        let engine = engine.clone();
        let options = options.clone();
        let output = output.to_path_buf();
        let lock = lock.clone();
        tasks.push(tokio::spawn(async move {
            let result = process_record(&engine, item, &options).await?;
            append_line(&output, &lock, &result).await?;
            Ok::<_, anyhow::Error>(result)
        }));
    }

    let mut summary = EvalSummary::default();
    for task in tasks {
        match task.await? {
            Ok(result) => summary.add(&result),
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "evaluation record skipped");
            }
        }
    }
    info!(total = summary.total, "all evaluation tasks completed");
    Ok(summary)
}
