use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported vector backend: {0} (expected 'flat' or 'qdrant')")]
    UnsupportedBackend(String),

    #[error("unknown search type: {0} (expected 'similarity', 'similarity_score_threshold' or 'mmr')")]
    UnknownSearchType(String),

    #[error("LLM provider is not specified")]
    MissingProvider,

    #[error("LLM model name is not specified")]
    MissingModelName,

    #[error("Unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("Budget forcing requires a raw-completion backend, but provider '{0}' only serves structured chat")]
    BudgetForcingUnsupported(String),

    #[error("conversational mode needs a tool-calling agent model, but provider '{0}' cannot bind tools")]
    ToolCallingUnsupported(String),

    #[error("the number of documents ({documents}) and metadata entries ({metadatas}) must be the same")]
    MetadataMismatch { documents: usize, metadatas: usize },

    #[error("persisted index at {0} is not marked as trusted; set TRIAGE_TRUST_SOURCE=true only for indexes you built yourself")]
    UntrustedSource(String),

    #[error("{0} must be specified to load a persisted index")]
    MissingPersistLocation(&'static str),

    #[error("template {template} has unexpected placeholders: {placeholders:?}")]
    InvalidPlaceholders {
        template: String,
        placeholders: Vec<String>,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// A query-time failure inside the retrieval path. Carried up to the engine
/// boundary so the caller can fall back to a retrieval-only answer.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector search failed ({backend}): {message}")]
    Search { backend: String, message: String },

    #[error("parent store lookup failed: {0}")]
    ParentStore(String),
}
