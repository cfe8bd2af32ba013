use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::llm::ToolSpec;
use crate::models::{Message, RetrievalArtifact, ToolCall};
use crate::retrieval::{format_tool_content, ScoredRetriever};

pub const RETRIEVE_TOOL: &str = "retrieve";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    Retrieve { query: String },
}

impl ToolCommand {
    pub fn from_call(call: &ToolCall) -> Result<Self> {
        match call.name.as_str() {
            RETRIEVE_TOOL => {
                let query = call
                    .arguments
                    .get("query")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("retrieve call {} has no query", call.id))?;
                Ok(ToolCommand::Retrieve {
                    query: query.to_string(),
                })
            }
            other => anyhow::bail!("unknown tool requested: {other}"),
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    retriever: ScoredRetriever,
}

impl ToolRegistry {
    pub fn new(retriever: ScoredRetriever) -> Self {
        Self { retriever }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: RETRIEVE_TOOL.to_string(),
            description: "Retrieve documents from the vector store based on the query."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The query to retrieve documents for."
                    }
                },
                "required": ["query"]
            }),
        }]
    }

    pub async fn dispatch(&self, call: &ToolCall) -> Result<Message> {
        match ToolCommand::from_call(call)? {
            ToolCommand::Retrieve { query } => {
                let context = self.retriever.retrieve(&query).await?;
                info!(query = %query, documents = context.len(), "retrieve tool ran");
                let content = format_tool_content(&context);
                Ok(Message::tool(
                    call.id.clone(),
                    content,
                    Some(RetrievalArtifact { query, context }),
                ))
            }
        }
    }
}
