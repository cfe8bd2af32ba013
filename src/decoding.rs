use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::llm::{estimate_tokens, CompletionChunk, CompletionModel};
use crate::models::Message;

pub const CHATML_START: &str = "<|im_start|>";
pub const CHATML_END: &str = "<|im_end|>";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasoningMarkers {
    pub think: String,
    pub answer: String,
    pub end_of_thinking: String,
    pub end_of_turn: String,
}

impl Default for ReasoningMarkers {
    fn default() -> Self {
        Self {
            think: "<|im_start|>think".to_string(),
            answer: "<|im_start|>answer".to_string(),
            end_of_thinking: "<|im_start|><|im_end|>".to_string(),
            end_of_turn: CHATML_END.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodingBudget {
    /// Zero or negative skips thinking entirely.
    pub max_thinking_tokens: i64,
    pub max_continuation_rounds: usize,
    /// Completion servers fall back to a tiny default when no cap is sent.
    pub max_answer_tokens: usize,
    pub ignore_string: String,
    pub stop_markers: ReasoningMarkers,
}

impl Default for DecodingBudget {
    fn default() -> Self {
        Self {
            max_thinking_tokens: 1024,
            max_continuation_rounds: 1,
            max_answer_tokens: 32768,
            ignore_string: "Wait".to_string(),
            stop_markers: ReasoningMarkers::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Thinking,
    Answer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodeChunk {
    pub channel: Channel,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedOutput {
    pub text: String,
    pub thinking_tokens: usize,
    pub thinking_rounds: usize,
    pub answer_tokens: usize,
}

pub type DecodeStream = Pin<Box<dyn Stream<Item = Result<DecodeChunk>> + Send>>;

pub fn render_chatml(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(CHATML_START);
        out.push_str(message.role.as_str());
        out.push('\n');
        out.push_str(&message.content);
        out.push_str(CHATML_END);
        out.push('\n');
    }
    out
}

pub fn render_reasoning_prompt(messages: &[Message]) -> String {
    let mut prompt = render_chatml(messages);
    prompt.push_str(CHATML_START);
    prompt.push_str("assistant\n");
    prompt
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Thinking,
    Answering,
    Done,
}

enum Step {
    Generate {
        channel: Channel,
        prefix: String,
        max_tokens: Option<usize>,
        stop: Vec<String>,
    },
    Finished,
}

/// Bookkeeping shared by the blocking and streaming decoders, so both issue
/// identical requests and produce identical text.
struct ForcingState {
    budget: DecodingBudget,
    prompt: String,
    output: String,
    remaining: usize,
    thinking_tokens: usize,
    answer_tokens: usize,
    round: usize,
    phase: Phase,
}

impl ForcingState {
    fn new(budget: DecodingBudget, prompt: &str) -> Self {
        let mut state = Self {
            remaining: budget.max_thinking_tokens.max(0) as usize,
            budget,
            prompt: prompt.to_string(),
            output: String::new(),
            thinking_tokens: 0,
            answer_tokens: 0,
            round: 0,
            phase: Phase::Thinking,
        };
        let marker = state.budget.stop_markers.think.clone();
        state.append(&marker);
        state
    }

    fn opening(&self) -> &str {
        &self.budget.stop_markers.think
    }

    fn append(&mut self, text: &str) {
        self.prompt.push_str(text);
        self.output.push_str(text);
    }

    fn next_step(&mut self) -> Step {
        match self.phase {
            Phase::Thinking => {
                if self.remaining > 0 && self.round <= self.budget.max_continuation_rounds {
                    let prefix = if self.round > 0 {
                        self.budget.ignore_string.clone()
                    } else {
                        String::new()
                    };
                    self.append(&prefix);
                    self.round += 1;
                    return Step::Generate {
                        channel: Channel::Thinking,
                        prefix,
                        max_tokens: Some(self.remaining),
                        stop: vec![
                            self.budget.stop_markers.end_of_thinking.clone(),
                            self.budget.stop_markers.end_of_turn.clone(),
                        ],
                    };
                }

                self.phase = Phase::Answering;
                let prefix = self.budget.stop_markers.answer.clone();
                self.append(&prefix);
                Step::Generate {
                    channel: Channel::Answer,
                    prefix,
                    max_tokens: Some(self.budget.max_answer_tokens),
                    stop: vec![self.budget.stop_markers.end_of_turn.clone()],
                }
            }
            Phase::Answering | Phase::Done => {
                self.phase = Phase::Done;
                Step::Finished
            }
        }
    }

    fn record(&mut self, text: &str, tokens: usize) {
        self.append(text);
        match self.phase {
            Phase::Thinking => {
                let deducted = tokens.min(self.remaining);
                self.remaining -= deducted;
                self.thinking_tokens += deducted;
            }
            Phase::Answering | Phase::Done => self.answer_tokens += tokens,
        }
    }

    fn finish(self) -> DecodedOutput {
        DecodedOutput {
            text: self.output,
            thinking_tokens: self.thinking_tokens,
            thinking_rounds: self.round,
            answer_tokens: self.answer_tokens,
        }
    }
}

/// Wraps a raw-completion model so it spends a minimum budget thinking before
/// it is allowed to answer.
#[derive(Clone)]
pub struct BudgetForcedDecoder {
    model: Arc<dyn CompletionModel>,
    budget: DecodingBudget,
}

impl BudgetForcedDecoder {
    pub fn new(model: Arc<dyn CompletionModel>, budget: DecodingBudget) -> Self {
        Self { model, budget }
    }

    pub async fn decode_messages(&self, messages: &[Message]) -> Result<DecodedOutput> {
        self.decode(&render_reasoning_prompt(messages)).await
    }

    pub async fn decode(&self, prompt: &str) -> Result<DecodedOutput> {
        let mut state = ForcingState::new(self.budget.clone(), prompt);
        while let Step::Generate {
            max_tokens, stop, ..
        } = state.next_step()
        {
            let completion = self.model.complete(&state.prompt, max_tokens, &stop).await?;
            state.record(&completion.text, completion.tokens);
        }

        let output = state.finish();
        tracing::debug!(
            model = self.model.name(),
            thinking_tokens = output.thinking_tokens,
            rounds = output.thinking_rounds,
            "budget-forced decode finished"
        );
        Ok(output)
    }

    pub fn decode_messages_stream(&self, messages: &[Message]) -> DecodeStream {
        self.decode_stream(render_reasoning_prompt(messages))
    }

    pub fn decode_stream(&self, prompt: String) -> DecodeStream {
        let model = self.model.clone();
        let budget = self.budget.clone();

        let stream = try_stream! {
            let mut state = ForcingState::new(budget, &prompt);
            yield DecodeChunk {
                channel: Channel::Thinking,
                text: state.opening().to_string(),
            };

            while let Step::Generate { channel, prefix, max_tokens, stop } = state.next_step() {
                if !prefix.is_empty() {
                    yield DecodeChunk { channel, text: prefix };
                }

                let mut pieces = model.complete_stream(&state.prompt, max_tokens, &stop).await?;
                let mut text = String::new();
                let mut reported = None;
                while let Some(piece) = pieces.next().await {
                    match piece? {
                        CompletionChunk::Text(delta) => {
                            text.push_str(&delta);
                            yield DecodeChunk { channel, text: delta };
                        }
                        CompletionChunk::Done { tokens } => reported = Some(tokens),
                    }
                }
                let tokens = reported.unwrap_or_else(|| estimate_tokens(&text));
                state.record(&text, tokens);
            }
        };
        Box::pin(stream)
    }
}
