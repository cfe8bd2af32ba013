use anyhow::{Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::decoding::{render_chatml, CHATML_END};
use crate::llm::{
    estimate_tokens, ChatModel, Completion, CompletionChunk, CompletionModel, CompletionStream,
    TextStream, ToolSpec,
};
use crate::models::{Message, Role, ToolCall};

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn post(&self, route: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}/{}", self.base_url, route));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        seed: Option<u64>,
    ) -> Result<Message> {
        let response = self
            .post("chat/completions")
            .json(&ChatReq::new(model, messages, tools, seed, false))
            .send()
            .await
            .context("failed to call chat completions endpoint")?;
        let response = ensure_ok(response, "chat/completions").await?;

        let response = response
            .json::<ChatResp>()
            .await
            .context("failed to decode chat completions response")?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("chat completions returned no choices"))?;
        Ok(choice.message.into_message())
    }

    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
        seed: Option<u64>,
    ) -> Result<TextStream> {
        let response = self
            .post("chat/completions")
            .json(&ChatReq::new(model, messages, &[], seed, true))
            .send()
            .await
            .context("failed to call chat completions endpoint")?;
        let response = ensure_ok(response, "chat/completions").await?;

        let stream = try_stream! {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event.map_err(|err| anyhow::anyhow!("chat stream interrupted: {err}"))?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let chunk: ChatStreamChunk = serde_json::from_str(&event.data)
                    .with_context(|| format!("invalid chat stream event: {}", event.data))?;
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield content;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    pub async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
        seed: Option<u64>,
    ) -> Result<Completion> {
        let response = self
            .post("completions")
            .json(&CompletionReq::new(model, prompt, max_tokens, stop, seed, false))
            .send()
            .await
            .context("failed to call completions endpoint")?;
        let response = ensure_ok(response, "completions").await?;

        let response = response
            .json::<CompletionResp>()
            .await
            .context("failed to decode completions response")?;

        let text = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .unwrap_or_default();
        let tokens = response
            .usage
            .map(|usage| usage.completion_tokens)
            .unwrap_or_else(|| estimate_tokens(&text));
        Ok(Completion { text, tokens })
    }

    pub async fn complete_stream(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
        seed: Option<u64>,
    ) -> Result<CompletionStream> {
        let response = self
            .post("completions")
            .json(&CompletionReq::new(model, prompt, max_tokens, stop, seed, true))
            .send()
            .await
            .context("failed to call completions endpoint")?;
        let response = ensure_ok(response, "completions").await?;

        let stream = try_stream! {
            let mut events = response.bytes_stream().eventsource();
            let mut text = String::new();
            let mut reported = None;
            while let Some(event) = events.next().await {
                let event = event.map_err(|err| anyhow::anyhow!("completion stream interrupted: {err}"))?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let chunk: CompletionResp = serde_json::from_str(&event.data)
                    .with_context(|| format!("invalid completion stream event: {}", event.data))?;
                if let Some(usage) = chunk.usage {
                    reported = Some(usage.completion_tokens);
                }
                for choice in chunk.choices {
                    if !choice.text.is_empty() {
                        text.push_str(&choice.text);
                        yield CompletionChunk::Text(choice.text);
                    }
                }
            }
            let tokens = reported.unwrap_or_else(|| estimate_tokens(&text));
            yield CompletionChunk::Done { tokens };
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
pub struct OpenAiChatModel {
    client: OpenAiClient,
    model: String,
    seed: Option<u64>,
}

impl OpenAiChatModel {
    pub fn new(client: OpenAiClient, model: impl Into<String>, seed: Option<u64>) -> Self {
        Self {
            client,
            model: model.into(),
            seed,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[Message]) -> Result<Message> {
        self.client.chat(&self.model, messages, &[], self.seed).await
    }

    async fn stream(&self, messages: &[Message]) -> Result<TextStream> {
        self.client.chat_stream(&self.model, messages, self.seed).await
    }

    async fn invoke_with_tools(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        self.client.chat(&self.model, messages, tools, self.seed).await
    }
}

#[derive(Clone)]
pub struct OpenAiCompletionModel {
    client: OpenAiClient,
    model: String,
    seed: Option<u64>,
}

impl OpenAiCompletionModel {
    pub fn new(client: OpenAiClient, model: impl Into<String>, seed: Option<u64>) -> Self {
        Self {
            client,
            model: model.into(),
            seed,
        }
    }

    fn chat_prompt(messages: &[Message]) -> String {
        let mut prompt = render_chatml(messages);
        prompt.push_str("<|im_start|>assistant\n");
        prompt
    }
}

#[async_trait]
impl ChatModel for OpenAiCompletionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[Message]) -> Result<Message> {
        let stop = vec![CHATML_END.to_string()];
        let completion = self
            .client
            .complete(&self.model, &Self::chat_prompt(messages), None, &stop, self.seed)
            .await?;
        Ok(Message::assistant(completion.text))
    }

    async fn stream(&self, messages: &[Message]) -> Result<TextStream> {
        let stop = vec![CHATML_END.to_string()];
        let chunks = self
            .client
            .complete_stream(&self.model, &Self::chat_prompt(messages), None, &stop, self.seed)
            .await?;
        let text = chunks.filter_map(|chunk| async move {
            match chunk {
                Ok(CompletionChunk::Text(text)) => Some(Ok(text)),
                Ok(CompletionChunk::Done { .. }) => None,
                Err(err) => Some(Err(err)),
            }
        });
        Ok(Box::pin(text))
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompletionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
    ) -> Result<Completion> {
        self.client
            .complete(&self.model, prompt, max_tokens, stop, self.seed)
            .await
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
    ) -> Result<CompletionStream> {
        self.client
            .complete_stream(&self.model, prompt, max_tokens, stop, self.seed)
            .await
    }
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl<'a> ChatReq<'a> {
    fn new(
        model: &'a str,
        messages: &'a [Message],
        tools: &'a [ToolSpec],
        seed: Option<u64>,
        stream: bool,
    ) -> Self {
        Self {
            model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools
                .iter()
                .map(|function| WireTool {
                    kind: "function",
                    function,
                })
                .collect(),
            stream,
            seed,
        }
    }
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            role: message.role.as_str(),
            content: &message.content,
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: &call.id,
                    kind: "function",
                    function: WireFunction {
                        name: &call.name,
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatResp {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: RespMessage,
}

#[derive(Deserialize)]
struct RespMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RespToolCall>,
}

impl RespMessage {
    fn into_message(self) -> Message {
        let mut message = Message::new(Role::Assistant, self.content.unwrap_or_default());
        message.tool_calls = self
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::String(call.function.arguments)),
            })
            .collect();
        message
    }
}

#[derive(Deserialize)]
struct RespToolCall {
    id: String,
    function: RespFunction,
}

#[derive(Deserialize)]
struct RespFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    delta: ChatDelta,
}

#[derive(Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct CompletionReq<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl<'a> CompletionReq<'a> {
    fn new(
        model: &'a str,
        prompt: &'a str,
        max_tokens: Option<usize>,
        stop: &'a [String],
        seed: Option<u64>,
        stream: bool,
    ) -> Self {
        Self {
            model,
            prompt,
            max_tokens,
            stop: stop.iter().map(String::as_str).collect(),
            seed,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct CompletionResp {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    completion_tokens: usize,
}

async fn ensure_ok(response: Response, route: &str) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{route} returned {status}: {}", normalize_err_body(&body));
    }
    Ok(response)
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(message) = json
            .get("error")
            .and_then(|err| err.get("message").or(Some(err)))
            .and_then(|v| v.as_str())
        {
            return message.to_string();
        }
    }

    trimmed.to_string()
}
