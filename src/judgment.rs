use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::ConfigError;
use crate::llm::ToolSpec;
use crate::models::ToolCall;

pub const SUBMIT_TOOL_NAME: &str = "submit_condition_recommendation";
pub const INCONCLUSIVE: &str = "inconclusive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerFormat {
    ToolCall,
    S1,
    DeepseekR1,
}

impl FromStr for AnswerFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tool" | "tool_call" => Ok(AnswerFormat::ToolCall),
            "s1" => Ok(AnswerFormat::S1),
            "deepseek_r1" | "deepseek-r1" => Ok(AnswerFormat::DeepseekR1),
            other => Err(ConfigError::InvalidValue {
                key: "answer_format".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    pub condition: String,
    pub severity: String,
}

impl Judgment {
    pub fn is_empty(&self) -> bool {
        self.condition.is_empty() && self.severity.is_empty()
    }

    pub fn is_inconclusive(&self) -> bool {
        self.condition == INCONCLUSIVE
    }
}

pub fn submit_condition_tool() -> ToolSpec {
    ToolSpec {
        name: SUBMIT_TOOL_NAME.to_string(),
        description: "Submit a condition recommendation and severity level.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "condition": {
                    "type": "string",
                    "description": "Name of the condition. This must be one of the sources provided or \"inconclusive\" if you are not confident."
                },
                "severity_level": {
                    "type": "string",
                    "description": "Severity level of the condition. One of \"Self-care\", \"Urgent Primary Care\", \"A&E\"."
                }
            },
            "required": ["condition", "severity_level"]
        }),
    }
}

fn s1_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\(([^)]*), ([^)]+)\)").unwrap_or_else(|_| Regex::new("^$").unwrap())
    })
}

fn r1_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\(([^,]+), ([^)]+)\)").unwrap_or_else(|_| Regex::new("^$").unwrap())
    })
}

pub fn parse_s1(text: &str) -> Judgment {
    let after = text.rsplit("<|im_start|>answer").next().unwrap_or(text);
    match s1_re().captures(after) {
        Some(caps) => Judgment {
            condition: caps[1].trim().trim_matches('"').to_string(),
            severity: caps[2].trim().trim_matches('"').to_string(),
        },
        None => {
            warn!(text, "could not extract condition and severity from s1 answer");
            Judgment::default()
        }
    }
}

pub fn parse_deepseek_r1(text: &str) -> Judgment {
    let after = text.rsplit("</think>").next().unwrap_or(text);
    match r1_re().captures(after) {
        Some(caps) => Judgment {
            condition: caps[1].trim().to_string(),
            severity: caps[2].trim().to_string(),
        },
        None => {
            warn!(text, "could not extract condition and severity from r1 answer");
            Judgment::default()
        }
    }
}

/// Reads the submit call's arguments. Anything but exactly one call is
/// treated as no answer.
pub fn from_tool_calls(calls: &[ToolCall]) -> Judgment {
    let [call] = calls else {
        if !calls.is_empty() {
            warn!(calls = calls.len(), "expected a single submit call");
        }
        return Judgment::default();
    };

    let field = |key: &str| {
        call.arguments
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Judgment {
        condition: field("condition"),
        severity: field("severity_level"),
    }
}

pub fn parse(format: AnswerFormat, text: &str, tool_calls: &[ToolCall]) -> Judgment {
    match format {
        AnswerFormat::ToolCall => from_tool_calls(tool_calls),
        AnswerFormat::S1 => parse_s1(text),
        AnswerFormat::DeepseekR1 => parse_deepseek_r1(text),
    }
}

pub fn normalize_condition(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub conditions_match: bool,
    pub severity_match: bool,
}

/// Grades a judgment. An inconclusive answer is right exactly when the
/// target never reached the model: the reranked sources when reranking ran,
/// the retrieved sources otherwise.
pub fn grade(
    judgment: &Judgment,
    target_condition: &str,
    target_severity: &str,
    retrieved_sources: &[String],
    reranked_sources: &[String],
) -> Verdict {
    let conditions_match = if judgment.is_inconclusive() {
        let shown = if reranked_sources.is_empty() {
            retrieved_sources
        } else {
            reranked_sources
        };
        !shown.iter().any(|s| s == target_condition)
    } else {
        !judgment.condition.is_empty()
            && normalize_condition(&judgment.condition) == normalize_condition(target_condition)
    };

    Verdict {
        conditions_match,
        severity_match: !judgment.severity.is_empty()
            && judgment.severity.to_lowercase() == target_severity.to_lowercase(),
    }
}
