use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::ChatModel;
use crate::models::{Message, RerankResult, RetrievalHit};
use crate::prompts::PromptTemplate;

#[derive(Debug, Clone, Copy)]
pub enum RerankQuery<'a> {
    Question(&'a str),
    History(&'a [Message]),
}

impl RerankQuery<'_> {
    fn describe(&self) -> String {
        match self {
            RerankQuery::Question(question) => question.to_string(),
            RerankQuery::History(messages) => messages
                .iter()
                .filter(|m| m.is_conversational())
                .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

pub fn normalize_title(title: &str) -> String {
    title
        .trim()
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '`' | '(' | ')' | '[' | ']'))
        .collect::<String>()
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Narrows retrieved context to `k` documents with an LLM judge, falling back
/// to the retrieval order whenever the judge does not name exactly `k`.
#[derive(Clone)]
pub struct Reranker {
    judge: Arc<dyn ChatModel>,
    template: PromptTemplate,
    k: usize,
}

impl Reranker {
    pub fn new(judge: Arc<dyn ChatModel>, template: PromptTemplate, k: usize) -> Self {
        Self { judge, template, k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn render_prompt(&self, context: &[RetrievalHit], query: RerankQuery<'_>) -> String {
        let titles = context
            .iter()
            .map(|hit| normalize_title(hit.source()))
            .collect::<Vec<_>>()
            .join(", ");
        let text = context
            .iter()
            .map(|hit| {
                let score = hit
                    .representative_score()
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "n/a".to_string());
                format!(
                    "Title: {}\nScore: {}\nContent: {}",
                    normalize_title(hit.source()),
                    score,
                    hit.document.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let symptoms = query.describe();
        let k = self.k.to_string();

        self.template.render(&[
            ("symptoms_description", symptoms.as_str()),
            ("document_titles", titles.as_str()),
            ("document_text", text.as_str()),
            ("k", k.as_str()),
        ])
    }

    pub async fn rerank(&self, context: &[RetrievalHit], query: RerankQuery<'_>) -> RerankResult {
        if context.len() <= self.k {
            return RerankResult {
                selected_docs: context.to_vec(),
                raw_response: None,
                parsed_titles: Vec::new(),
                success: None,
            };
        }

        let prompt = self.render_prompt(context, query);
        let raw = match self.judge.invoke(&[Message::user(prompt)]).await {
            Ok(reply) => reply.content,
            Err(err) => {
                warn!(judge = self.judge.name(), error = %format!("{err:#}"), "rerank judge failed; keeping retrieval order");
                return self.fallback(context, None, Vec::new());
            }
        };

        let parsed = parse_titles(&raw);
        let wanted: HashSet<&str> = parsed.iter().map(String::as_str).collect();
        let selected: Vec<RetrievalHit> = context
            .iter()
            .filter(|hit| wanted.contains(normalize_title(hit.source()).as_str()))
            .cloned()
            .collect();

        if selected.len() == self.k {
            debug!(titles = ?parsed, "rerank accepted judge selection");
            RerankResult {
                selected_docs: selected,
                raw_response: Some(raw),
                parsed_titles: parsed,
                success: Some(true),
            }
        } else {
            warn!(
                matched = selected.len(),
                expected = self.k,
                response = %raw,
                "rerank judge output did not name exactly k documents; keeping retrieval order"
            );
            self.fallback(context, Some(raw), parsed)
        }
    }

    fn fallback(
        &self,
        context: &[RetrievalHit],
        raw_response: Option<String>,
        parsed_titles: Vec<String>,
    ) -> RerankResult {
        RerankResult {
            selected_docs: context.iter().take(self.k).cloned().collect(),
            raw_response,
            parsed_titles,
            success: Some(false),
        }
    }
}

pub fn parse_titles(response: &str) -> Vec<String> {
    response
        .split([',', '\n'])
        .map(normalize_title)
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::llm::TextStream;
    use crate::models::{Metadata, ParentDocument, SubDocument, SOURCE_KEY};
    use crate::prompts::RERANK_PROMPT;

    struct FixedJudge {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedJudge {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err("judge offline".to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for FixedJudge {
        fn name(&self) -> &str {
            "fixed-judge"
        }

        async fn invoke(&self, messages: &[Message]) -> Result<Message> {
            self.prompts
                .lock()
                .unwrap()
                .push(messages[0].content.clone());
            match &self.reply {
                Ok(text) => Ok(Message::assistant(text.clone())),
                Err(err) => anyhow::bail!("{err}"),
            }
        }

        async fn stream(&self, _messages: &[Message]) -> Result<TextStream> {
            anyhow::bail!("not used")
        }
    }

    fn hit(source: &str, score: f32) -> RetrievalHit {
        let mut metadata = Metadata::new();
        metadata.insert(SOURCE_KEY.to_string(), source.to_string());
        RetrievalHit {
            document: ParentDocument {
                id: source.to_string(),
                text: format!("{source} content"),
                metadata,
            },
            sub_docs: vec![SubDocument {
                text: source.to_string(),
                score,
            }],
        }
    }

    fn context() -> Vec<RetrievalHit> {
        vec![
            hit("headache", 0.2),
            hit("migraine", 0.3),
            hit("Cluster headaches", 0.4),
        ]
    }

    fn sources(result: &RerankResult) -> Vec<&str> {
        result.selected_docs.iter().map(|h| h.source()).collect()
    }

    fn reranker(judge: Arc<FixedJudge>, k: usize) -> Reranker {
        Reranker::new(judge, PromptTemplate::new("rerank", RERANK_PROMPT).unwrap(), k)
    }

    #[test]
    fn titles_normalize() {
        assert_eq!(normalize_title("  \"Cluster Headaches\" "), "cluster-headaches");
        assert_eq!(normalize_title("(Migraine)"), "migraine");
        assert_eq!(
            parse_titles("'cluster headaches', migraine,\n, "),
            vec!["cluster-headaches", "migraine"]
        );
    }

    #[tokio::test]
    async fn small_context_is_returned_untouched() {
        let judge = FixedJudge::replying("anything");
        let ctx = vec![hit("headache", 0.2), hit("migraine", 0.3)];
        let result = reranker(judge.clone(), 2)
            .rerank(&ctx, RerankQuery::Question("my head hurts"))
            .await;
        assert_eq!(result.selected_docs, ctx);
        assert_eq!(result.success, None);
        assert!(judge.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exact_match_keeps_original_relative_order() {
        let judge = FixedJudge::replying("Cluster Headaches, headache");
        let result = reranker(judge.clone(), 2)
            .rerank(&context(), RerankQuery::Question("my head hurts"))
            .await;
        assert_eq!(result.success, Some(true));
        assert_eq!(sources(&result), vec!["headache", "Cluster headaches"]);
        assert_eq!(result.parsed_titles, vec!["cluster-headaches", "headache"]);

        let prompt = judge.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("my head hurts"));
        assert!(prompt.contains("headache, migraine, cluster-headaches"));
        assert!(prompt.contains("Score: 0.400"));
        assert!(prompt.contains("exactly 2 document titles"));
    }

    #[tokio::test]
    async fn wrong_count_falls_back_to_prefix() {
        for reply in ["migraine", "headache, migraine, cluster headaches", "no idea", ""] {
            let result = reranker(FixedJudge::replying(reply), 2)
                .rerank(&context(), RerankQuery::Question("q"))
                .await;
            assert_eq!(result.success, Some(false), "{reply}");
            assert_eq!(sources(&result), vec!["headache", "migraine"]);
            assert_eq!(result.raw_response.as_deref(), Some(reply));
        }
    }

    #[tokio::test]
    async fn judge_failure_falls_back() {
        let result = reranker(FixedJudge::failing(), 1)
            .rerank(&context(), RerankQuery::Question("q"))
            .await;
        assert_eq!(result.success, Some(false));
        assert_eq!(sources(&result), vec!["headache"]);
        assert!(result.raw_response.is_none());
    }

    #[tokio::test]
    async fn history_query_uses_visible_turns() {
        let judge = FixedJudge::replying("migraine");
        let history = vec![
            Message::user("I keep getting headaches"),
            Message::tool("call_1", "Source: ...", None),
            Message::assistant("How long have they lasted?"),
            Message::user("About a week"),
        ];
        let result = reranker(judge.clone(), 1)
            .rerank(&context(), RerankQuery::History(&history))
            .await;
        assert_eq!(result.success, Some(true));

        let prompt = judge.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("user: I keep getting headaches\nassistant: How long have they lasted?\nuser: About a week"));
        assert!(!prompt.contains("Source: ..."));
    }
}
