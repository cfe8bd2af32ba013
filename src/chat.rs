use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::decoding::{BudgetForcedDecoder, Channel};
use crate::graph::{Graph, Node, Outcome};
use crate::index::{ChunkParentIndex, SearchMode};
use crate::judgment::submit_condition_tool;
use crate::llm::{build_chat_model, build_completion_model, ChatModel};
use crate::memory::{ConversationMemory, ConversationState};
use crate::models::{
    sources_and_scores, FailedTurn, Message, QueryOutcome, RetrievalHit, Role, ToolCall,
    TurnSummary,
};
use crate::prompts::PromptSet;
use crate::rerank::{RerankQuery, Reranker};
use crate::retrieval::{format_tool_content, ScoredRetriever};
use crate::tools::ToolRegistry;

const NO_DEMOGRAPHICS: &str = "Not provided";

#[derive(Clone)]
pub enum ClinicalModel {
    Plain(Arc<dyn ChatModel>),
    Forced(BudgetForcedDecoder),
}

#[derive(Clone)]
pub struct EngineModels {
    pub agent: Arc<dyn ChatModel>,
    pub clinical: ClinicalModel,
    pub judge: Arc<dyn ChatModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnEvent {
    pub node: Node,
    pub channel: Channel,
    pub text: String,
    pub visible: bool,
}

pub type TurnEventStream = Pin<Box<dyn Stream<Item = Result<TurnEvent>> + Send>>;

type Sink = Option<mpsc::Sender<Result<TurnEvent>>>;

#[derive(Default)]
struct TurnReport {
    answer: String,
    retrieved: bool,
    retriever_query: Option<String>,
    clinical_judgment: Option<String>,
    judgment_tool_calls: Vec<ToolCall>,
    system_prompt: Option<String>,
    rag_message: Option<String>,
}

#[derive(Clone)]
pub struct TriageEngine {
    models: EngineModels,
    retriever: ScoredRetriever,
    tools: ToolRegistry,
    reranker: Option<Reranker>,
    prompts: Arc<PromptSet>,
    graph: Graph,
    memory: Arc<ConversationMemory>,
    generation_limit: Arc<Semaphore>,
    judgment_tool: bool,
}

impl TriageEngine {
    pub fn new(
        config: &AppConfig,
        index: Arc<ChunkParentIndex>,
        models: EngineModels,
        prompts: PromptSet,
    ) -> Self {
        let retriever = ScoredRetriever::new(
            index,
            config.search.k,
            SearchMode::from_config(&config.search),
        );
        let reranker = config.pipeline.rerank.then(|| {
            Reranker::new(
                models.judge.clone(),
                prompts.rerank.clone(),
                config.pipeline.rerank_k,
            )
        });

        Self {
            tools: ToolRegistry::new(retriever.clone()),
            graph: Graph::new(config.pipeline.conversational, reranker.is_some()),
            retriever,
            reranker,
            models,
            prompts: Arc::new(prompts),
            memory: Arc::new(ConversationMemory::new()),
            generation_limit: Arc::new(Semaphore::new(
                config.pipeline.max_concurrent_generations.max(1),
            )),
            judgment_tool: false,
        }
    }

    pub fn from_config(config: &AppConfig, index: Arc<ChunkParentIndex>) -> Result<Self> {
        let clinical = if config.pipeline.budget_forcing {
            ClinicalModel::Forced(BudgetForcedDecoder::new(
                build_completion_model(&config.models.clinical, &config.models)?,
                config.decoding.clone(),
            ))
        } else {
            ClinicalModel::Plain(build_chat_model(&config.models.clinical, &config.models)?)
        };
        let models = EngineModels {
            agent: build_chat_model(&config.models.agent, &config.models)?,
            clinical,
            judge: build_chat_model(&config.models.rerank, &config.models)?,
        };
        let prompts = PromptSet::load(&config.pipeline)?;

        Ok(Self::new(config, index, models, prompts))
    }

    pub fn with_judgment_tool(mut self) -> Self {
        self.judgment_tool = true;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn retriever(&self) -> &ScoredRetriever {
        &self.retriever
    }

    pub async fn query(
        &self,
        thread_id: &str,
        question: &str,
        demographics: Option<String>,
    ) -> QueryOutcome {
        let started = Instant::now();
        let mut guard = self.memory.begin_turn(thread_id).await;
        let mut working = guard.clone();

        match self.run_turn(&mut working, question, demographics, &None).await {
            Ok(report) => {
                let summary = summarize(&working, report);
                *guard = working;
                info!(
                    thread_id,
                    retrieved = summary.retrieved,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "turn finished"
                );
                QueryOutcome::Answered(summary)
            }
            Err(err) => {
                drop(guard);
                self.degrade(thread_id, question, err).await
            }
        }
    }

    /// Runs a turn in the background and streams its output. The turn still
    /// completes and commits if the receiver goes away.
    pub fn query_stream(
        &self,
        thread_id: String,
        question: String,
        demographics: Option<String>,
    ) -> TurnEventStream {
        let (tx, mut rx) = mpsc::channel::<Result<TurnEvent>>(64);
        let engine = self.clone();

        tokio::spawn(async move {
            let mut guard = engine.memory.begin_turn(&thread_id).await;
            let mut working = guard.clone();
            let sink = Some(tx);
            match engine.run_turn(&mut working, &question, demographics, &sink).await {
                Ok(_) => *guard = working,
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(thread_id = %thread_id, error = %message, "streamed turn failed");
                    if let Some(tx) = &sink {
                        let _ = tx.send(Err(err)).await;
                    }
                }
            }
        });

        Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        })
    }

    pub fn query_stream_text(
        &self,
        thread_id: String,
        question: String,
        demographics: Option<String>,
    ) -> Pin<Box<dyn Stream<Item = Result<String>> + Send>> {
        let events = self.query_stream(thread_id, question, demographics);
        Box::pin(events.filter_map(|item| async move {
            match item {
                Ok(event) if event.visible => Some(Ok(event.text)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            }
        }))
    }

    pub async fn clear_history(&self, thread_id: &str) -> bool {
        self.memory.clear(thread_id).await
    }

    pub async fn get_history(&self, thread_id: &str) -> Option<Vec<Message>> {
        self.memory.history(thread_id).await
    }

    pub async fn state(&self, thread_id: &str) -> Option<ConversationState> {
        self.memory.get(thread_id).await
    }

    pub async fn thread_ids(&self) -> Vec<String> {
        self.memory.thread_ids().await
    }

    pub async fn has_thread(&self, thread_id: &str) -> bool {
        self.memory.contains(thread_id).await
    }

    async fn degrade(&self, thread_id: &str, question: &str, err: anyhow::Error) -> QueryOutcome {
        let message = format!("{err:#}");
        error!(thread_id, error = %message, "turn failed; answering with retrieval only");

        let (retrieved_sources, retrieved_scores) = match self.retriever.retrieve(question).await {
            Ok(hits) => sources_and_scores(&hits),
            Err(retrieval_err) => {
                warn!(error = %retrieval_err, "retrieval-only fallback also failed");
                (Vec::new(), Vec::new())
            }
        };
        QueryOutcome::Failed(FailedTurn {
            error: message,
            retrieved_sources,
            retrieved_scores,
        })
    }

    async fn run_turn(
        &self,
        state: &mut ConversationState,
        question: &str,
        demographics: Option<String>,
        sink: &Sink,
    ) -> Result<TurnReport> {
        if demographics.is_some() {
            state.demographics = demographics;
        }
        if self.graph.is_conversational() {
            state.messages.push(Message::user(question));
        }

        let mut report = TurnReport::default();
        let mut node = self.graph.start();
        while node != Node::End {
            let outcome = match node {
                Node::QueryOrRespond => self.query_or_respond(state, &mut report, sink).await?,
                Node::Tools => self.run_tools(state).await?,
                Node::ProcessToolResponse => {
                    process_tool_response(state);
                    report.retrieved = true;
                    report.retriever_query = state.retriever_queries.last().cloned();
                    Outcome::Continue
                }
                Node::Retrieve => {
                    let context = self.retriever.retrieve(question).await?;
                    push_round(state, question.to_string(), context);
                    report.retrieved = true;
                    report.retriever_query = Some(question.to_string());
                    Outcome::Continue
                }
                Node::RerankDocuments => {
                    self.rerank_documents(state, question).await;
                    Outcome::Continue
                }
                Node::Generate => self.generate(state, question, &mut report, sink).await?,
                Node::RouterRespond => self.router_respond(state, &mut report, sink).await?,
                Node::End => Outcome::Continue,
            };
            node = self.graph.transition(node, outcome);
        }

        Ok(report)
    }

    async fn query_or_respond(
        &self,
        state: &mut ConversationState,
        report: &mut TurnReport,
        sink: &Sink,
    ) -> Result<Outcome> {
        let mut messages = vec![Message::system(self.prompts.retriever_tool.clone())];
        messages.extend(state.messages.iter().cloned());

        let reply = self
            .models
            .agent
            .invoke_with_tools(&messages, &self.tools.specs())
            .await?;
        let outcome = if reply.has_tool_calls() {
            Outcome::ToolRequested
        } else {
            report.answer = reply.content.clone();
            self.emit(sink, Node::QueryOrRespond, Channel::Answer, &reply.content)
                .await;
            Outcome::DirectReply
        };
        state.messages.push(reply);
        Ok(outcome)
    }

    async fn run_tools(&self, state: &mut ConversationState) -> Result<Outcome> {
        let calls = state
            .messages
            .last()
            .map(|m| m.tool_calls.clone())
            .unwrap_or_default();
        for call in &calls {
            let message = self.tools.dispatch(call).await?;
            state.messages.push(message);
        }
        Ok(Outcome::Continue)
    }

    async fn rerank_documents(&self, state: &mut ConversationState, question: &str) {
        let Some(reranker) = &self.reranker else {
            return;
        };
        let context = state.latest_context().to_vec();
        let result = if self.graph.is_conversational() {
            reranker
                .rerank(&context, RerankQuery::History(&state.messages))
                .await
        } else {
            reranker.rerank(&context, RerankQuery::Question(question)).await
        };

        if let Some(slot) = state.reranked_context.last_mut() {
            *slot = Some(result.selected_docs);
        }
        if let Some(slot) = state.reranker_response.last_mut() {
            *slot = result.raw_response;
        }
        if let Some(slot) = state.reranker_parsed_titles.last_mut() {
            *slot = result.parsed_titles;
        }
        if let Some(slot) = state.reranker_success.last_mut() {
            *slot = result.success;
        }
    }

    async fn generate(
        &self,
        state: &mut ConversationState,
        question: &str,
        report: &mut TurnReport,
        sink: &Sink,
    ) -> Result<Outcome> {
        let context = state.generation_context();
        let serialized = format_tool_content(context);
        let sources = context
            .iter()
            .map(|hit| hit.source().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let demographics = state
            .demographics
            .clone()
            .unwrap_or_else(|| NO_DEMOGRAPHICS.to_string());

        let conversational = self.graph.is_conversational();
        let latest_user = if conversational {
            state
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_else(|| question.to_string())
        } else {
            question.to_string()
        };
        let vars = [
            ("context", serialized.as_str()),
            ("question", latest_user.as_str()),
            ("demographics", demographics.as_str()),
            ("sources", sources.as_str()),
        ];

        let system = Message::system(self.prompts.system.render(&vars));
        let user = Message::user(self.prompts.user.render(&vars));

        let mut prompt = vec![system.clone()];
        if conversational {
            // Earlier turns as the patient saw them; the latest question is
            // replaced by the rendered prompt.
            let history = state.visible_messages();
            let earlier = history.len().saturating_sub(1);
            prompt.extend(history.into_iter().take(earlier));
        }
        prompt.push(user.clone());

        report.system_prompt = Some(system.content.clone());
        report.rag_message = Some(user.content.clone());
        state.system_messages.push(system);
        if conversational {
            state.rag_input_messages.push(user);
        } else {
            state.messages.push(user);
        }

        let visible = self.graph.is_visible(Node::Generate);
        let judgment = {
            let _permit = self.generation_limit.acquire().await?;
            self.call_clinical(&prompt, visible, sink).await?
        };

        report.clinical_judgment = Some(judgment.content.clone());
        report.judgment_tool_calls = judgment.tool_calls.clone();
        if conversational {
            state.t0_reasoning.push(judgment.content);
        } else {
            report.answer = judgment.content.clone();
            state.messages.push(judgment);
        }
        Ok(Outcome::Continue)
    }

    async fn call_clinical(&self, prompt: &[Message], visible: bool, sink: &Sink) -> Result<Message> {
        match &self.models.clinical {
            ClinicalModel::Forced(decoder) => {
                if sink.is_none() {
                    return Ok(Message::assistant(decoder.decode_messages(prompt).await?.text));
                }
                let mut chunks = decoder.decode_messages_stream(prompt);
                let mut text = String::new();
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    text.push_str(&chunk.text);
                    self.emit_event(
                        sink,
                        TurnEvent {
                            node: Node::Generate,
                            channel: chunk.channel,
                            text: chunk.text,
                            visible,
                        },
                    )
                    .await;
                }
                Ok(Message::assistant(text))
            }
            ClinicalModel::Plain(model) => {
                if self.judgment_tool && !self.graph.is_conversational() {
                    return model
                        .invoke_with_tools(prompt, &[submit_condition_tool()])
                        .await;
                }
                self.chat(model.as_ref(), prompt, Node::Generate, visible, sink)
                    .await
            }
        }
    }

    async fn router_respond(
        &self,
        state: &mut ConversationState,
        report: &mut TurnReport,
        sink: &Sink,
    ) -> Result<Outcome> {
        let analysis = state.t0_reasoning.last().cloned().unwrap_or_default();
        let system = format!(
            "{}\n\nClinical analysis:\n{}",
            self.prompts.router, analysis
        );
        let mut prompt = vec![Message::system(system)];
        prompt.extend(state.visible_messages());

        let reply = {
            let _permit = self.generation_limit.acquire().await?;
            let visible = self.graph.is_visible(Node::RouterRespond);
            self.chat(self.models.agent.as_ref(), &prompt, Node::RouterRespond, visible, sink)
                .await?
        };
        report.answer = reply.content.clone();
        state.messages.push(reply);
        Ok(Outcome::Continue)
    }

    async fn chat(
        &self,
        model: &dyn ChatModel,
        prompt: &[Message],
        node: Node,
        visible: bool,
        sink: &Sink,
    ) -> Result<Message> {
        if sink.is_none() {
            return model.invoke(prompt).await;
        }

        let mut deltas = model.stream(prompt).await?;
        let mut text = String::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            text.push_str(&delta);
            self.emit_event(
                sink,
                TurnEvent {
                    node,
                    channel: Channel::Answer,
                    text: delta,
                    visible,
                },
            )
            .await;
        }
        Ok(Message::assistant(text))
    }

    async fn emit(&self, sink: &Sink, node: Node, channel: Channel, text: &str) {
        if text.is_empty() {
            return;
        }
        self.emit_event(
            sink,
            TurnEvent {
                node,
                channel,
                text: text.to_string(),
                visible: self.graph.is_visible(node),
            },
        )
        .await;
    }

    async fn emit_event(&self, sink: &Sink, event: TurnEvent) {
        if let Some(tx) = sink {
            // A closed receiver means the caller left; the turn carries on.
            let _ = tx.send(Ok(event)).await;
        }
    }
}

fn push_round(
    state: &mut ConversationState,
    query: String,
    context: Vec<RetrievalHit>,
) {
    state.retriever_queries.push(query);
    state.context.push(context);
    state.reranked_context.push(None);
    state.reranker_response.push(None);
    state.reranker_parsed_titles.push(Vec::new());
    state.reranker_success.push(None);
}

/// Takes the artifact of the latest tool result. No tool result means an
/// empty round, never an error.
fn process_tool_response(state: &mut ConversationState) {
    let artifact = state
        .messages
        .iter()
        .rev()
        .take_while(|m| m.role == Role::Tool)
        .find_map(|m| m.artifact.clone())
        .unwrap_or_default();
    push_round(state, artifact.query, artifact.context);
}

fn summarize(state: &ConversationState, report: TurnReport) -> TurnSummary {
    let mut summary = TurnSummary {
        answer: report.answer,
        retrieved: report.retrieved,
        retriever_query: report.retriever_query,
        clinical_judgment: report.clinical_judgment,
        judgment_tool_calls: report.judgment_tool_calls,
        system_prompt: report.system_prompt,
        rag_message: report.rag_message,
        ..TurnSummary::default()
    };

    if report.retrieved {
        (summary.retrieved_sources, summary.retrieved_scores) =
            sources_and_scores(state.latest_context());
        if let Some(reranked) = state.latest_reranked() {
            (summary.reranked_sources, summary.reranked_scores) = sources_and_scores(reranked);
        }
        summary.reranker_response = state.reranker_response.last().cloned().flatten();
        summary.reranker_parsed_titles = state
            .reranker_parsed_titles
            .last()
            .cloned()
            .unwrap_or_default();
        summary.reranker_success = state.reranker_success.last().copied().flatten();
    }
    summary
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::ConfigOverrides;
    use crate::decoding::DecodingBudget;
    use crate::docstore::InMemoryParentStore;
    use crate::index::flat::FlatIndex;
    use crate::index::tests::KeywordEmbedder;
    use crate::index::TextSplitter;
    use crate::llm::{
        Completion, CompletionChunk, CompletionModel, CompletionStream, TextStream, ToolSpec,
    };
    use crate::models::{Metadata, SOURCE_KEY};
    use crate::tools::RETRIEVE_TOOL;

    pub(crate) struct ScriptedChat {
        pub name: &'static str,
        pub reply: String,
        pub fail: bool,
        pub seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedChat {
        pub(crate) fn new(name: &'static str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: reply.to_string(),
                fail: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: String::new(),
                fail: true,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        fn name(&self) -> &str {
            self.name
        }

        async fn invoke(&self, messages: &[Message]) -> Result<Message> {
            self.seen.lock().unwrap().push(messages.to_vec());
            if self.fail {
                anyhow::bail!("{} is unavailable", self.name);
            }
            Ok(Message::assistant(self.reply.clone()))
        }

        async fn stream(&self, messages: &[Message]) -> Result<TextStream> {
            let reply = self.invoke(messages).await?.content;
            let words: Vec<Result<String>> = reply
                .split_inclusive(' ')
                .map(|w| Ok(w.to_string()))
                .collect();
            Ok(Box::pin(futures::stream::iter(words)))
        }

        async fn invoke_with_tools(
            &self,
            messages: &[Message],
            tools: &[ToolSpec],
        ) -> Result<Message> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let last = messages.last().map(|m| m.content.to_lowercase()).unwrap_or_default();
            let tool = &tools[0].name;
            if tool == RETRIEVE_TOOL && (last.contains("hello") || last.contains("thank")) {
                return Ok(Message::assistant("Hello! How can I help you today?"));
            }
            let arguments = if tool == RETRIEVE_TOOL {
                json!({ "query": last })
            } else {
                json!({ "condition": "flu", "severity_level": "Self-care" })
            };
            let mut reply = Message::assistant("");
            reply.tool_calls.push(ToolCall {
                id: "call_1".to_string(),
                name: tool.clone(),
                arguments,
            });
            Ok(reply)
        }
    }

    struct EchoCompletion;

    #[async_trait]
    impl CompletionModel for EchoCompletion {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            prompt: &str,
            _max_tokens: Option<usize>,
            _stop: &[String],
        ) -> Result<Completion> {
            Ok(if prompt.ends_with("<|im_start|>answer") {
                Completion { text: "(flu, Self-care)".into(), tokens: 2 }
            } else {
                Completion { text: " thinking about fever".into(), tokens: 3 }
            })
        }

        async fn complete_stream(
            &self,
            prompt: &str,
            max_tokens: Option<usize>,
            stop: &[String],
        ) -> Result<CompletionStream> {
            let done = self.complete(prompt, max_tokens, stop).await?;
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(CompletionChunk::Text(done.text)),
                Ok(CompletionChunk::Done { tokens: done.tokens }),
            ])))
        }
    }

    pub(crate) async fn condition_index() -> Arc<ChunkParentIndex> {
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(16, 0),
            Arc::new(FlatIndex::new("unused.json")),
            Arc::new(InMemoryParentStore::new()),
            8,
        );
        let meta = |source: &str| {
            let mut m = Metadata::new();
            m.insert(SOURCE_KEY.to_string(), source.to_string());
            m
        };
        index
            .build(
                vec![
                    "fever and chills".into(),
                    "sore throat".into(),
                    "itchy rash".into(),
                ],
                vec![meta("flu"), meta("tonsillitis"), meta("eczema")],
            )
            .await
            .unwrap();
        Arc::new(index)
    }

    pub(crate) fn config(conversational: bool, rerank: bool) -> AppConfig {
        AppConfig::from_overrides(ConfigOverrides {
            conversational: Some(conversational),
            rerank: Some(rerank),
            rerank_k: Some(1),
            k: Some(2),
            ..Default::default()
        })
        .unwrap()
    }

    pub(crate) async fn engine(
        conversational: bool,
        rerank: bool,
        clinical: ClinicalModel,
    ) -> TriageEngine {
        let config = config(conversational, rerank);
        let models = EngineModels {
            agent: ScriptedChat::new("agent", "It sounds like you may have the flu. How long have you felt this way?"),
            clinical,
            judge: ScriptedChat::new("judge", "flu"),
        };
        TriageEngine::new(
            &config,
            condition_index().await,
            models,
            PromptSet::defaults(conversational),
        )
    }

    fn plain(reply: &str) -> ClinicalModel {
        ClinicalModel::Plain(ScriptedChat::new("clinical", reply))
    }

    #[tokio::test]
    async fn greeting_ends_without_retrieval() {
        let engine = engine(true, false, plain("(flu, Self-care)")).await;
        let outcome = engine.query("t1", "Hello", None).await;

        let QueryOutcome::Answered(summary) = outcome else {
            panic!("greeting must not fail");
        };
        assert!(!summary.retrieved);
        assert_eq!(summary.answer, "Hello! How can I help you today?");
        assert!(summary.clinical_judgment.is_none());

        let state = engine.state("t1").await.unwrap();
        assert!(state.context.is_empty());
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn symptom_turn_routes_judgment_through_router() {
        let engine = engine(true, false, plain("(flu, Self-care)")).await;
        let outcome = engine
            .query("t1", "I have a fever and chills", Some("30 year old".into()))
            .await;

        let QueryOutcome::Answered(summary) = outcome else {
            panic!("turn failed");
        };
        assert!(summary.retrieved);
        assert_eq!(summary.retrieved_sources[0], "flu");
        assert_eq!(summary.clinical_judgment.as_deref(), Some("(flu, Self-care)"));
        assert!(summary.answer.starts_with("It sounds like"));
        assert!(summary.system_prompt.unwrap().contains("30 year old"));

        let state = engine.state("t1").await.unwrap();
        assert_eq!(state.t0_reasoning, vec!["(flu, Self-care)".to_string()]);
        let history = engine.get_history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| !m.content.contains("(flu, Self-care)")));
    }

    #[tokio::test]
    async fn non_conversational_turn_with_rerank() {
        let engine = engine(false, true, plain("(flu, Self-care)")).await;
        let QueryOutcome::Answered(summary) = engine.query("-", "fever and sore throat", None).await
        else {
            panic!("turn failed");
        };
        assert_eq!(summary.answer, "(flu, Self-care)");
        assert_eq!(summary.retrieved_sources.len(), 2);
        assert_eq!(summary.reranked_sources, vec!["flu".to_string()]);
        assert_eq!(summary.reranker_success, Some(true));
        assert!(summary.rag_message.unwrap().contains("fever and sore throat"));
    }

    #[tokio::test]
    async fn judgment_tool_is_bound_when_requested() {
        let engine = engine(false, false, plain("unused")).await.with_judgment_tool();
        let QueryOutcome::Answered(summary) = engine.query("-", "fever", None).await else {
            panic!("turn failed");
        };
        assert_eq!(summary.judgment_tool_calls.len(), 1);
        assert_eq!(summary.judgment_tool_calls[0].arguments["condition"], "flu");
    }

    #[tokio::test]
    async fn failures_degrade_to_retrieval_only() {
        let engine = engine(
            true,
            false,
            ClinicalModel::Plain(ScriptedChat::failing("clinical")),
        )
        .await;
        let outcome = engine.query("t1", "itchy rash", None).await;

        let QueryOutcome::Failed(failed) = outcome else {
            panic!("clinical failure must degrade");
        };
        assert!(failed.error.contains("clinical is unavailable"));
        assert_eq!(failed.retrieved_sources[0], "eczema");
        // Nothing from the failed turn is committed.
        assert!(engine.state("t1").await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn streamed_turn_matches_blocking_turn() {
        let engine = engine(true, false, plain("(flu, Self-care)")).await;
        let QueryOutcome::Answered(blocking) = engine.query("a", "fever", None).await else {
            panic!("turn failed");
        };

        let streamed: Vec<String> = engine
            .query_stream_text("b".into(), "fever".into(), None)
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(streamed.concat(), blocking.answer);

        let state = engine.state("b").await.unwrap();
        assert_eq!(state.t0_reasoning, vec!["(flu, Self-care)".to_string()]);
    }

    #[tokio::test]
    async fn forced_decoding_streams_thinking_then_answer() {
        let decoder = BudgetForcedDecoder::new(
            Arc::new(EchoCompletion),
            DecodingBudget {
                max_thinking_tokens: 3,
                ..DecodingBudget::default()
            },
        );
        let engine = engine(false, false, ClinicalModel::Forced(decoder)).await;

        let events: Vec<TurnEvent> = engine
            .query_stream("-".into(), "fever".into(), None)
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert!(events.iter().all(|e| e.node == Node::Generate && e.visible));
        let first_answer = events
            .iter()
            .position(|e| e.channel == Channel::Answer)
            .unwrap();
        assert!(events[..first_answer].iter().all(|e| e.channel == Channel::Thinking));

        let text: String = events.iter().map(|e| e.text.as_str()).collect();
        assert!(text.starts_with("<|im_start|>think"));
        assert!(text.ends_with("<|im_start|>answer(flu, Self-care)"));
    }

    #[tokio::test]
    async fn clearing_forgets_the_thread() {
        let engine = engine(true, false, plain("(flu, Self-care)")).await;
        engine.query("t1", "Hello", None).await;
        assert_eq!(engine.thread_ids().await, vec!["t1".to_string()]);

        assert!(engine.clear_history("t1").await);
        assert!(engine.get_history("t1").await.is_none());
    }
}
