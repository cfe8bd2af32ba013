use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::PipelineConfig;
use crate::error::ConfigError;

pub const ALLOWED_PLACEHOLDERS: [&str; 8] = [
    "context",
    "question",
    "demographics",
    "sources",
    "symptoms_description",
    "document_titles",
    "document_text",
    "k",
];

pub const RETRIEVER_TOOL_PROMPT: &str = "You are a helpful clinical AI assistant deployed in the United Kingdom

You are provided a tool that can retrieve context from a knowledge base taken from NHS condition web pages which provide information about various medical conditions.
You should ALWAYS use the tool to find relevant information to answer the patient's question rather than relying on your own knowledge.
If you are confused or unsure about the user's question, you should use the tool to find relevant information or ask the user for more information or ask further details about their symptoms.
If the user provides follow up information, you should ALWAYS use the tool to find new relevant information to answer the user's question given the conversation history.
You should only not use the tool in very simple messages that do not require any context like \"Hello\" or \"Thank you\", or when the user is just writing something random.

You can also ask the user for more information or ask further details about their symptoms.
If you are going to reply to the user, always conclude with a question to keep the conversation going to help the user or ask for more details about their symptoms.
In your response, only reply in English and always refer to the user in the second person.

Decide to use the tool at the start. Do not use the tool after you have already started your response.";

pub const ROUTER_RESPONSE_PROMPT: &str = "You are a helpful clinical AI assistant deployed in the United Kingdom.

Our specialist clinical reasoning model has analysed the patient's symptoms against NHS condition information. The analysis will be provided to you.

Your task is to:
1. Interpret the clinical analysis (which includes the likely condition and severity)
2. Communicate findings to the patient clearly and empathetically
3. Recommend the next action based on the severity assessment
4. Ask relevant follow-up questions to gather more information

Guidelines:
- Do NOT reveal that a separate model performed the analysis
- Do NOT repeat the analysis as a raw (condition, severity) pair
- Do NOT mention similarity scores or technical details
- Explain conditions in simple, accessible language
- Always refer to the user in the second person
- Reply in English only
- Conclude with a question to keep the conversation going

Severity-to-action mapping:
- \"Self-care\": Suggest home care / over-the-counter medication, see GP if symptoms persist
- \"Urgent Primary Care\": Suggest seeing a GP or urgent care centre as soon as possible
- \"A&E\": Suggest going to A&E or calling 999 immediately";

pub const CLINICAL_SYSTEM_PROMPT: &str = "You are a clinical triage assistant deployed in the United Kingdom.
You are given a patient's description of their symptoms, optional demographic details, and reference documents taken from NHS condition pages.
Identify the single most likely condition and decide how urgently the patient should seek care.

Severity must be one of: \"Self-care\", \"Urgent Primary Care\", \"A&E\".
Only choose a condition from the sources provided. If none of them fit, use \"inconclusive\" as the condition.
Answer with a single tuple of the form (condition_name, severity_level) and nothing else.";

pub const CLINICAL_USER_PROMPT: &str = "Patient demographics: {demographics}

Symptoms: {question}

Reference documents:
{context}";

pub const CONVERSATIONAL_SYSTEM_PROMPT: &str = "You are a clinical reasoning model deployed in the United Kingdom.
Using the conversation so far, the patient demographics and the NHS condition documents below, identify the most likely condition and how urgently the patient should seek care.

Severity must be one of: \"Self-care\", \"Urgent Primary Care\", \"A&E\".
Only choose a condition from these sources: {sources}. If none of them fit, use \"inconclusive\" as the condition.
Reply with a single structured prediction of the form (condition_name, severity_level).
Do not write a conversational response or ask follow-up questions; another assistant will talk to the patient.

Patient demographics: {demographics}

Reference documents:
{context}";

pub const CONVERSATIONAL_USER_PROMPT: &str = "{question}";

pub const RERANK_PROMPT: &str = "You are helping a clinician shortlist NHS condition pages for a patient.

Patient symptoms:
{symptoms_description}

Candidate documents: {document_titles}

{document_text}

Choose the {k} documents most relevant to the patient's symptoms.
Reply with exactly {k} document titles, copied from the candidate list, separated by commas and nothing else.";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{(\w+)\}").unwrap_or_else(|_| Regex::new("^$").unwrap())
    })
}

pub fn placeholders(text: &str) -> BTreeSet<String> {
    placeholder_re()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    name: String,
    text: String,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let text = text.into();
        let invalid: Vec<String> = placeholders(&text)
            .into_iter()
            .filter(|p| !ALLOWED_PLACEHOLDERS.contains(&p.as_str()))
            .collect();
        if !invalid.is_empty() {
            return Err(ConfigError::InvalidPlaceholders {
                template: name,
                placeholders: invalid,
            });
        }
        Ok(Self { name, text })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading prompt template {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), text)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Substitutes known placeholders in one pass. Values are inserted
    /// verbatim, so braces inside them are never re-expanded.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        placeholder_re()
            .replace_all(&self.text, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                vars.iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: PromptTemplate,
    pub user: PromptTemplate,
    pub rerank: PromptTemplate,
    pub retriever_tool: String,
    pub router: String,
}

impl PromptSet {
    pub fn defaults(conversational: bool) -> Self {
        let (system, user) = if conversational {
            (CONVERSATIONAL_SYSTEM_PROMPT, CONVERSATIONAL_USER_PROMPT)
        } else {
            (CLINICAL_SYSTEM_PROMPT, CLINICAL_USER_PROMPT)
        };
        Self {
            system: builtin("system", system),
            user: builtin("user", user),
            rerank: builtin("rerank", RERANK_PROMPT),
            retriever_tool: RETRIEVER_TOOL_PROMPT.to_string(),
            router: ROUTER_RESPONSE_PROMPT.to_string(),
        }
    }

    pub fn load(pipeline: &PipelineConfig) -> Result<Self> {
        let mut set = Self::defaults(pipeline.conversational);
        if let Some(path) = &pipeline.system_prompt {
            set.system = PromptTemplate::from_file(path)?;
        }
        if let Some(path) = &pipeline.prompt_template {
            set.user = PromptTemplate::from_file(path)?;
        }
        if let Some(path) = &pipeline.rerank_prompt {
            set.rerank = PromptTemplate::from_file(path)?;
        }
        Ok(set)
    }
}

fn builtin(name: &str, text: &str) -> PromptTemplate {
    PromptTemplate {
        name: name.to_string(),
        text: text.to_string(),
    }
}
