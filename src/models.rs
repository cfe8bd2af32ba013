use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Metadata = BTreeMap<String, String>;

pub const SOURCE_KEY: &str = "source";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ParentDocument {
    pub fn source(&self) -> &str {
        self.metadata
            .get(SOURCE_KEY)
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildChunk {
    pub id: String,
    pub text: String,
    pub parent_id: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubDocument {
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalHit {
    pub document: ParentDocument,
    #[serde(default)]
    pub sub_docs: Vec<SubDocument>,
}

impl RetrievalHit {
    pub fn unscored(document: ParentDocument) -> Self {
        Self {
            document,
            sub_docs: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        self.document.source()
    }

    /// Score of the first matching chunk, not necessarily the best one.
    pub fn representative_score(&self) -> Option<f32> {
        self.sub_docs.first().map(|sub| sub.score)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalArtifact {
    pub query: String,
    pub context: Vec<RetrievalHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<RetrievalArtifact>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            artifact: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        artifact: Option<RetrievalArtifact>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            artifact,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_conversational(&self) -> bool {
        match self.role {
            Role::User => true,
            Role::Assistant => !self.has_tool_calls() && !self.content.trim().is_empty(),
            Role::System | Role::Tool => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankResult {
    pub selected_docs: Vec<RetrievalHit>,
    pub raw_response: Option<String>,
    pub parsed_titles: Vec<String>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub condition_title: String,
    pub condition_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub source_hash: String,
    pub backend: String,
    pub parent_count: i64,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_thread_id")]
    pub thread_id: String,
    #[serde(default)]
    pub demographics: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearHistoryRequest {
    #[serde(default = "default_thread_id")]
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_thread_id")]
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: QueryOutcome,
    pub thread_id: String,
    pub demographics: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadIdsResponse {
    pub thread_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadIdResponse {
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearHistoryResponse {
    pub status: String,
    pub thread_id: String,
}

/// Result of one turn as seen by callers. Recoverable failures are data, not
/// HTTP errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered(TurnSummary),
    Failed(FailedTurn),
}

impl QueryOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            QueryOutcome::Answered(summary) => Some(summary.answer.as_str()),
            QueryOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnSummary {
    pub answer: String,
    pub retrieved: bool,
    pub retriever_query: Option<String>,
    pub retrieved_sources: Vec<String>,
    pub retrieved_scores: Vec<Option<f32>>,
    pub reranked_sources: Vec<String>,
    pub reranked_scores: Vec<Option<f32>>,
    pub reranker_response: Option<String>,
    pub reranker_parsed_titles: Vec<String>,
    pub reranker_success: Option<bool>,
    pub clinical_judgment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub judgment_tool_calls: Vec<ToolCall>,
    pub system_prompt: Option<String>,
    pub rag_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedTurn {
    pub error: String,
    pub retrieved_sources: Vec<String>,
    pub retrieved_scores: Vec<Option<f32>>,
}

pub fn default_thread_id() -> String {
    "0".to_string()
}

pub fn sources_and_scores(hits: &[RetrievalHit]) -> (Vec<String>, Vec<Option<f32>>) {
    hits.iter()
        .map(|hit| (hit.source().to_string(), hit.representative_score()))
        .unzip()
}
