use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::decoding::DecodingBudget;
use crate::error::ConfigError;

pub const CONFIG_PATH_ENV: &str = "TRIAGE_CONFIG";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorBackendKind {
    Flat,
    Qdrant,
}

impl VectorBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VectorBackendKind::Flat => "flat",
            VectorBackendKind::Qdrant => "qdrant",
        }
    }
}

impl FromStr for VectorBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(VectorBackendKind::Flat),
            "qdrant" => Ok(VectorBackendKind::Qdrant),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentStoreKind {
    Memory,
    Sqlite,
}

impl FromStr for ParentStoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(ParentStoreKind::Memory),
            "sqlite" => Ok(ParentStoreKind::Sqlite),
            other => Err(ConfigError::InvalidValue {
                key: "parent_store".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub conditions_file: PathBuf,
    pub backend: VectorBackendKind,
    pub persist_dir: PathBuf,
    pub parent_store: ParentStoreKind,
    pub trust_source: bool,
    pub force_create: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub batch_size: usize,
    pub qdrant_url: String,
    pub qdrant_collection: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchType {
    Similarity,
    SimilarityScoreThreshold,
    Mmr,
}

impl FromStr for SearchType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "similarity" => Ok(SearchType::Similarity),
            "similarity_score_threshold" => Ok(SearchType::SimilarityScoreThreshold),
            "mmr" => Ok(SearchType::Mmr),
            other => Err(ConfigError::UnknownSearchType(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub search_type: SearchType,
    pub k: usize,
    pub fetch_k: usize,
    pub lambda_mult: f32,
    pub score_threshold: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelEndpoint {
    pub provider: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub clinical: ModelEndpoint,
    pub agent: ModelEndpoint,
    pub rerank: ModelEndpoint,
    pub embedding_model: String,
    pub embedding_base_url: String,
    pub api_key: Option<String>,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub conversational: bool,
    pub rerank: bool,
    pub rerank_k: usize,
    pub budget_forcing: bool,
    pub max_concurrent_generations: usize,
    pub prompt_template: Option<PathBuf>,
    pub system_prompt: Option<PathBuf>,
    pub rerank_prompt: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub models: ModelConfig,
    pub pipeline: PipelineConfig,
    pub decoding: DecodingBudget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigLayer {
    File,
    Environment,
    Cli,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub bind_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub conditions_file: Option<PathBuf>,
    pub vector_backend: Option<String>,
    pub persist_dir: Option<PathBuf>,
    pub parent_store: Option<String>,
    pub trust_source: Option<bool>,
    pub force_create: Option<bool>,
    pub search_type: Option<String>,
    pub k: Option<usize>,
    pub fetch_k: Option<usize>,
    pub lambda_mult: Option<f32>,
    pub score_threshold: Option<f32>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub index_batch_size: Option<usize>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub agent_provider: Option<String>,
    pub agent_model: Option<String>,
    pub agent_base_url: Option<String>,
    pub rerank_provider: Option<String>,
    pub rerank_model: Option<String>,
    pub rerank_base_url: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_base_url: Option<String>,
    pub qdrant_url: Option<String>,
    pub qdrant_collection: Option<String>,
    pub conversational: Option<bool>,
    pub rerank: Option<bool>,
    pub rerank_k: Option<usize>,
    pub budget_forcing: Option<bool>,
    pub max_thinking_tokens: Option<i64>,
    pub max_continuation_rounds: Option<usize>,
    pub max_answer_tokens: Option<usize>,
    pub ignore_string: Option<String>,
    pub prompt_template: Option<PathBuf>,
    pub system_prompt: Option<PathBuf>,
    pub rerank_prompt: Option<PathBuf>,
    pub seed: Option<u64>,
    pub max_concurrent_generations: Option<usize>,
    pub openai_api_key: Option<String>,
}

macro_rules! merge_fields {
    ($base:ident, $top:ident, [$($field:ident),* $(,)?]) => {
        $(
            if $top.$field.is_some() {
                $base.$field = $top.$field;
            }
        )*
    };
}

impl ConfigOverrides {
    pub fn merge(mut self, top: ConfigOverrides) -> Self {
        merge_fields!(
            self,
            top,
            [
                bind_addr,
                data_dir,
                log_dir,
                conditions_file,
                vector_backend,
                persist_dir,
                parent_store,
                trust_source,
                force_create,
                search_type,
                k,
                fetch_k,
                lambda_mult,
                score_threshold,
                chunk_size,
                chunk_overlap,
                index_batch_size,
                llm_provider,
                llm_model,
                llm_base_url,
                agent_provider,
                agent_model,
                agent_base_url,
                rerank_provider,
                rerank_model,
                rerank_base_url,
                embedding_model,
                embedding_base_url,
                qdrant_url,
                qdrant_collection,
                conversational,
                rerank,
                rerank_k,
                budget_forcing,
                max_thinking_tokens,
                max_continuation_rounds,
                max_answer_tokens,
                ignore_string,
                prompt_template,
                system_prompt,
                rerank_prompt,
                seed,
                max_concurrent_generations,
                openai_api_key,
            ]
        );
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path = |key: &str| text(key).map(PathBuf::from);

        Ok(Self {
            bind_addr: text("TRIAGE_BIND"),
            data_dir: path("TRIAGE_DATA_DIR"),
            log_dir: path("TRIAGE_LOG_DIR"),
            conditions_file: path("TRIAGE_CONDITIONS_FILE"),
            vector_backend: text("TRIAGE_VECTOR_BACKEND"),
            persist_dir: path("TRIAGE_PERSIST_DIR"),
            parent_store: text("TRIAGE_PARENT_STORE"),
            trust_source: parse_opt(&lookup, "TRIAGE_TRUST_SOURCE", parse_bool)?,
            force_create: parse_opt(&lookup, "TRIAGE_FORCE_CREATE", parse_bool)?,
            search_type: text("TRIAGE_SEARCH_TYPE"),
            k: parse_opt(&lookup, "TRIAGE_K", parse_num)?,
            fetch_k: parse_opt(&lookup, "TRIAGE_FETCH_K", parse_num)?,
            lambda_mult: parse_opt(&lookup, "TRIAGE_LAMBDA_MULT", parse_num)?,
            score_threshold: parse_opt(&lookup, "TRIAGE_SCORE_THRESHOLD", parse_num)?,
            chunk_size: parse_opt(&lookup, "TRIAGE_CHUNK_SIZE", parse_num)?,
            chunk_overlap: parse_opt(&lookup, "TRIAGE_CHUNK_OVERLAP", parse_num)?,
            index_batch_size: parse_opt(&lookup, "TRIAGE_INDEX_BATCH_SIZE", parse_num)?,
            llm_provider: text("TRIAGE_LLM_PROVIDER"),
            llm_model: text("TRIAGE_LLM_MODEL"),
            llm_base_url: text("TRIAGE_LLM_BASE_URL"),
            agent_provider: text("TRIAGE_AGENT_PROVIDER"),
            agent_model: text("TRIAGE_AGENT_MODEL"),
            agent_base_url: text("TRIAGE_AGENT_BASE_URL"),
            rerank_provider: text("TRIAGE_RERANK_PROVIDER"),
            rerank_model: text("TRIAGE_RERANK_MODEL"),
            rerank_base_url: text("TRIAGE_RERANK_BASE_URL"),
            embedding_model: text("TRIAGE_EMBEDDING_MODEL"),
            embedding_base_url: text("TRIAGE_EMBEDDING_BASE_URL"),
            qdrant_url: text("TRIAGE_QDRANT_URL"),
            qdrant_collection: text("TRIAGE_QDRANT_COLLECTION"),
            conversational: parse_opt(&lookup, "TRIAGE_CONVERSATIONAL", parse_bool)?,
            rerank: parse_opt(&lookup, "TRIAGE_RERANK", parse_bool)?,
            rerank_k: parse_opt(&lookup, "TRIAGE_RERANK_K", parse_num)?,
            budget_forcing: parse_opt(&lookup, "TRIAGE_BUDGET_FORCING", parse_bool)?,
            max_thinking_tokens: parse_opt(&lookup, "TRIAGE_MAX_THINKING_TOKENS", parse_num)?,
            max_continuation_rounds: parse_opt(
                &lookup,
                "TRIAGE_MAX_CONTINUATION_ROUNDS",
                parse_num,
            )?,
            max_answer_tokens: parse_opt(&lookup, "TRIAGE_MAX_ANSWER_TOKENS", parse_num)?,
            ignore_string: lookup("TRIAGE_IGNORE_STRING"),
            prompt_template: path("TRIAGE_PROMPT_TEMPLATE"),
            system_prompt: path("TRIAGE_SYSTEM_PROMPT"),
            rerank_prompt: path("TRIAGE_RERANK_PROMPT"),
            seed: parse_opt(&lookup, "TRIAGE_SEED", parse_num)?,
            max_concurrent_generations: parse_opt(
                &lookup,
                "TRIAGE_MAX_CONCURRENT_GENERATIONS",
                parse_num,
            )?,
            openai_api_key: text("OPENAI_API_KEY"),
        })
    }
}

/// Folds layers by precedence, regardless of the order they were passed in.
pub fn fold_layers(mut layers: Vec<(ConfigLayer, ConfigOverrides)>) -> ConfigOverrides {
    layers.sort_by_key(|(layer, _)| *layer);
    layers
        .into_iter()
        .fold(ConfigOverrides::default(), |acc, (_, top)| acc.merge(top))
}

impl AppConfig {
    /// Defaults < `TRIAGE_CONFIG` file < `TRIAGE_*` environment < `cli`.
    pub fn load(cli: ConfigOverrides) -> Result<Self> {
        let mut layers = Vec::with_capacity(3);
        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                layers.push((ConfigLayer::File, ConfigOverrides::from_file(Path::new(&path))?));
            }
        }
        layers.push((ConfigLayer::Environment, ConfigOverrides::from_env()?));
        layers.push((ConfigLayer::Cli, cli));

        let config = Self::from_overrides(fold_layers(layers))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_overrides(o: ConfigOverrides) -> Result<Self, ConfigError> {
        let data_dir = o.data_dir.unwrap_or_else(|| PathBuf::from("./data"));

        let clinical = ModelEndpoint {
            provider: o.llm_provider.unwrap_or_else(|| "ollama".to_string()),
            model: o.llm_model.unwrap_or_else(|| "qwen2.5:7b-instruct".to_string()),
            base_url: o
                .llm_base_url
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
        };
        let inherit = |provider: Option<String>, model: Option<String>, base_url: Option<String>| {
            ModelEndpoint {
                provider: provider.unwrap_or_else(|| clinical.provider.clone()),
                model: model.unwrap_or_else(|| clinical.model.clone()),
                base_url: base_url.unwrap_or_else(|| clinical.base_url.clone()),
            }
        };
        let agent = inherit(o.agent_provider, o.agent_model, o.agent_base_url);
        let rerank = inherit(o.rerank_provider, o.rerank_model, o.rerank_base_url);

        let mut decoding = DecodingBudget::default();
        if let Some(tokens) = o.max_thinking_tokens {
            decoding.max_thinking_tokens = tokens;
        }
        if let Some(rounds) = o.max_continuation_rounds {
            decoding.max_continuation_rounds = rounds;
        }
        if let Some(tokens) = o.max_answer_tokens {
            decoding.max_answer_tokens = tokens;
        }
        if let Some(ignore) = o.ignore_string {
            decoding.ignore_string = ignore;
        }

        Ok(Self {
            server: ServerConfig {
                bind_addr: o.bind_addr.unwrap_or_else(|| "0.0.0.0:8000".to_string()),
                log_dir: o.log_dir.unwrap_or_else(|| data_dir.join("request_logs")),
                data_dir: data_dir.clone(),
            },
            index: IndexConfig {
                conditions_file: o
                    .conditions_file
                    .unwrap_or_else(|| data_dir.join("conditions.jsonl")),
                backend: o
                    .vector_backend
                    .as_deref()
                    .unwrap_or("flat")
                    .parse()?,
                persist_dir: o.persist_dir.unwrap_or_else(|| data_dir.join("index")),
                parent_store: o.parent_store.as_deref().unwrap_or("sqlite").parse()?,
                trust_source: o.trust_source.unwrap_or(false),
                force_create: o.force_create.unwrap_or(false),
                chunk_size: o.chunk_size.unwrap_or(256),
                chunk_overlap: o.chunk_overlap.unwrap_or(50),
                batch_size: o.index_batch_size.unwrap_or(64),
                qdrant_url: o
                    .qdrant_url
                    .unwrap_or_else(|| "http://127.0.0.1:6333".to_string()),
                qdrant_collection: o
                    .qdrant_collection
                    .unwrap_or_else(|| "condition_chunks".to_string()),
            },
            search: SearchConfig {
                search_type: o.search_type.as_deref().unwrap_or("similarity").parse()?,
                k: o.k.unwrap_or(4),
                fetch_k: o.fetch_k.unwrap_or(20),
                lambda_mult: o.lambda_mult.unwrap_or(0.5),
                score_threshold: o.score_threshold.unwrap_or(0.0),
            },
            models: ModelConfig {
                embedding_model: o
                    .embedding_model
                    .unwrap_or_else(|| "nomic-embed-text".to_string()),
                embedding_base_url: o
                    .embedding_base_url
                    .unwrap_or_else(|| clinical.base_url.clone()),
                clinical,
                agent,
                rerank,
                api_key: o.openai_api_key,
                seed: o.seed,
            },
            pipeline: PipelineConfig {
                conversational: o.conversational.unwrap_or(true),
                rerank: o.rerank.unwrap_or(false),
                rerank_k: o.rerank_k.unwrap_or(2),
                budget_forcing: o.budget_forcing.unwrap_or(false),
                max_concurrent_generations: o.max_concurrent_generations.unwrap_or(1),
                prompt_template: o.prompt_template,
                system_prompt: o.system_prompt,
                rerank_prompt: o.rerank_prompt,
            },
            decoding,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for endpoint in [&self.models.clinical, &self.models.agent, &self.models.rerank] {
            crate::llm::check_provider(&endpoint.provider, &endpoint.model)?;
        }

        if self.pipeline.budget_forcing
            && !crate::llm::supports_completion(&self.models.clinical.provider)
        {
            return Err(ConfigError::BudgetForcingUnsupported(
                self.models.clinical.provider.clone(),
            ));
        }

        if self.pipeline.conversational
            && !crate::llm::supports_tools(&self.models.agent.provider)
        {
            return Err(ConfigError::ToolCallingUnsupported(
                self.models.agent.provider.clone(),
            ));
        }

        if self.search.k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "k".to_string(),
                value: "0".to_string(),
            });
        }

        if self.pipeline.rerank && self.pipeline.rerank_k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rerank_k".to_string(),
                value: "0 (rerank needs at least one document)".to_string(),
            });
        }

        if self.index.chunk_overlap >= self.index.chunk_size {
            return Err(ConfigError::InvalidValue {
                key: "chunk_overlap".to_string(),
                value: format!(
                    "{} (must be smaller than chunk_size {})",
                    self.index.chunk_overlap, self.index.chunk_size
                ),
            });
        }

        Ok(())
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.server.data_dir.join("triage.sqlite3").display()
        )
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.index.persist_dir.join("flat_index.json")
    }
}

fn parse_opt<F, T>(
    lookup: &F,
    key: &str,
    parse: fn(&str, &str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => parse(key, raw.trim()).map(Some),
        _ => Ok(None),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
