use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use triage::chat::{ClinicalModel, EngineModels, TriageEngine};
use triage::config::{AppConfig, ConfigOverrides};
use triage::db::Database;
use triage::index::{open_index, SearchMode};
use triage::llm::{ChatModel, Embedder, TextStream, ToolSpec};
use triage::models::{Message, QueryOutcome, Role, ToolCall};
use triage::prompts::PromptSet;
use triage::retrieval::ScoredRetriever;

const VOCAB: [&str; 6] = ["wheeze", "breath", "rash", "itch", "fever", "chills"];

struct VocabEmbedder;

#[async_trait]
impl Embedder for VocabEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                let mut v: Vec<f32> = VOCAB.iter().map(|w| lower.matches(w).count() as f32).collect();
                v.push(0.01);
                v
            })
            .collect())
    }
}

struct Agent;

#[async_trait]
impl ChatModel for Agent {
    fn name(&self) -> &str {
        "agent"
    }

    async fn invoke(&self, _messages: &[Message]) -> Result<Message> {
        Ok(Message::assistant("This may be asthma. Are you short of breath right now?"))
    }

    async fn stream(&self, messages: &[Message]) -> Result<TextStream> {
        let reply = self.invoke(messages).await?.content;
        Ok(Box::pin(futures::stream::iter(vec![Ok(reply)])))
    }

    async fn invoke_with_tools(&self, messages: &[Message], _tools: &[ToolSpec]) -> Result<Message> {
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if last.to_lowercase().starts_with("hello") {
            return Ok(Message::assistant("Hello! What symptoms are you having?"));
        }
        let mut reply = Message::assistant("");
        reply.tool_calls.push(ToolCall {
            id: "call_0".into(),
            name: "retrieve".into(),
            arguments: json!({ "query": last }),
        });
        Ok(reply)
    }
}

struct Clinician;

#[async_trait]
impl ChatModel for Clinician {
    fn name(&self) -> &str {
        "clinician"
    }

    async fn invoke(&self, _messages: &[Message]) -> Result<Message> {
        Ok(Message::assistant("(asthma, Urgent Primary Care)"))
    }

    async fn stream(&self, messages: &[Message]) -> Result<TextStream> {
        let reply = self.invoke(messages).await?.content;
        Ok(Box::pin(futures::stream::iter(vec![Ok(reply)])))
    }
}

async fn setup(dir: &std::path::Path) -> (AppConfig, Database) {
    let conditions = dir.join("conditions.jsonl");
    let lines = [
        json!({"condition_title": "asthma", "condition_content": "wheeze and short of breath"}),
        json!({"condition_title": "eczema", "condition_content": "dry skin rash with itch"}),
        json!({"condition_title": "flu", "condition_content": "fever and chills"}),
    ];
    let body: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    std::fs::write(&conditions, body.join("\n")).unwrap();

    let config = AppConfig::from_overrides(ConfigOverrides {
        data_dir: Some(dir.to_path_buf()),
        conditions_file: Some(conditions),
        trust_source: Some(true),
        k: Some(2),
        conversational: Some(true),
        ..Default::default()
    })
    .unwrap();
    let db = Database::new(&config).await.unwrap();
    (config, db)
}

async fn engine(config: &AppConfig, db: &Database) -> TriageEngine {
    let (index, _) = open_index(config, Arc::new(VocabEmbedder), db).await.unwrap();
    TriageEngine::new(
        config,
        Arc::new(index),
        EngineModels {
            agent: Arc::new(Agent),
            clinical: ClinicalModel::Plain(Arc::new(Clinician)),
            judge: Arc::new(Agent),
        },
        PromptSet::defaults(true),
    )
}

#[tokio::test]
async fn conversation_over_a_persisted_index() {
    let dir = tempfile::tempdir().unwrap();
    let (config, db) = setup(dir.path()).await;
    let engine = engine(&config, &db).await;

    let greeting = engine.query("t1", "Hello", None).await;
    let QueryOutcome::Answered(greeting) = greeting else {
        panic!("greeting failed");
    };
    assert!(!greeting.retrieved);

    let turn = engine
        .query("t1", "I wheeze and I am out of breath", Some("62, female".into()))
        .await;
    let QueryOutcome::Answered(turn) = turn else {
        panic!("symptom turn failed");
    };
    assert!(turn.retrieved);
    assert_eq!(turn.retrieved_sources[0], "asthma");
    assert_eq!(
        turn.clinical_judgment.as_deref(),
        Some("(asthma, Urgent Primary Care)")
    );
    assert!(turn.answer.ends_with("right now?"));

    let history = engine.get_history("t1").await.unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );

    engine.clear_history("t1").await;
    assert!(engine.get_history("t1").await.is_none());
}

#[tokio::test]
async fn second_start_loads_instead_of_rebuilding() {
    let dir = tempfile::tempdir().unwrap();
    let (config, db) = setup(dir.path()).await;

    let sources = |hits: Vec<triage::models::RetrievalHit>| {
        hits.iter()
            .map(|h| (h.document.id.clone(), h.source().to_string()))
            .collect::<Vec<_>>()
    };

    let (built, first) = open_index(&config, Arc::new(VocabEmbedder), &db).await.unwrap();
    assert!(!first.loaded);
    assert_eq!(first.stats.parent_count, 3);
    let fresh = ScoredRetriever::new(Arc::new(built), 3, SearchMode::Similarity)
        .retrieve("a rash and a fever")
        .await
        .unwrap();

    let (loaded, second) = open_index(&config, Arc::new(VocabEmbedder), &db).await.unwrap();
    assert!(second.loaded);
    assert_eq!(second.stats.parent_count, 3);
    assert_eq!(second.stats.chunk_count, first.stats.chunk_count);
    let reloaded = ScoredRetriever::new(Arc::new(loaded), 3, SearchMode::Similarity)
        .retrieve("a rash and a fever")
        .await
        .unwrap();

    assert_eq!(sources(reloaded), sources(fresh));
}

#[tokio::test]
async fn threads_run_side_by_side() {
    let dir = tempfile::tempdir().unwrap();
    let (config, db) = setup(dir.path()).await;
    let engine = engine(&config, &db).await;

    let (a, b) = tokio::join!(
        engine.query("a", "itchy rash on my arm", None),
        engine.query("b", "fever and chills since yesterday", None),
    );
    assert_eq!(a.answer().map(|s| s.is_empty()), Some(false));
    assert_eq!(b.answer().map(|s| s.is_empty()), Some(false));

    let state_a = engine.state("a").await.unwrap();
    let state_b = engine.state("b").await.unwrap();
    assert_eq!(state_a.context[0][0].source(), "eczema");
    assert_eq!(state_b.context[0][0].source(), "flu");
    assert_eq!(engine.thread_ids().await, vec!["a".to_string(), "b".to_string()]);
}
