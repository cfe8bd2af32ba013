use std::path::PathBuf;

use clap::Args;

use crate::config::ConfigOverrides;

/// Flags shared by every binary. Each one maps onto the top configuration
/// layer, so anything left unset falls through to env, file and defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long)]
    pub conditions_file: Option<PathBuf>,
    /// `flat` or `qdrant`.
    #[arg(long)]
    pub vector_backend: Option<String>,
    #[arg(long)]
    pub persist_dir: Option<PathBuf>,
    /// Allow loading a persisted flat-index snapshot.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub trust_source: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub force_create: Option<bool>,
    /// `similarity`, `similarity_score_threshold` or `mmr`.
    #[arg(long)]
    pub search_type: Option<String>,
    #[arg(long)]
    pub k: Option<usize>,
    #[arg(long)]
    pub llm_provider: Option<String>,
    #[arg(long)]
    pub llm_model: Option<String>,
    #[arg(long)]
    pub llm_base_url: Option<String>,
    #[arg(long)]
    pub agent_provider: Option<String>,
    #[arg(long)]
    pub agent_model: Option<String>,
    #[arg(long)]
    pub rerank_provider: Option<String>,
    #[arg(long)]
    pub rerank_model: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub conversational: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub rerank: Option<bool>,
    #[arg(long)]
    pub rerank_k: Option<usize>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub budget_forcing: Option<bool>,
    #[arg(long)]
    pub max_thinking_tokens: Option<i64>,
    #[arg(long)]
    pub prompt_template: Option<PathBuf>,
    #[arg(long)]
    pub system_prompt: Option<PathBuf>,
    #[arg(long)]
    pub rerank_prompt: Option<PathBuf>,
    #[arg(long)]
    pub seed: Option<u64>,
}

impl CommonArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        let args = self.clone();
        ConfigOverrides {
            data_dir: args.data_dir,
            conditions_file: args.conditions_file,
            vector_backend: args.vector_backend,
            persist_dir: args.persist_dir,
            trust_source: args.trust_source,
            force_create: args.force_create,
            search_type: args.search_type,
            k: args.k,
            llm_provider: args.llm_provider,
            llm_model: args.llm_model,
            llm_base_url: args.llm_base_url,
            agent_provider: args.agent_provider,
            agent_model: args.agent_model,
            rerank_provider: args.rerank_provider,
            rerank_model: args.rerank_model,
            conversational: args.conversational,
            rerank: args.rerank,
            rerank_k: args.rerank_k,
            budget_forcing: args.budget_forcing,
            max_thinking_tokens: args.max_thinking_tokens,
            prompt_template: args.prompt_template,
            system_prompt: args.system_prompt,
            rerank_prompt: args.rerank_prompt,
            seed: args.seed,
            ..ConfigOverrides::default()
        }
    }
}
