use anyhow::{Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::{
    estimate_tokens, ChatModel, Completion, CompletionChunk, CompletionModel, CompletionStream,
    Embedder, TextStream, ToolSpec,
};
use crate::models::{Message, Role, ToolCall};

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            anyhow::bail!("cannot embed empty text input");
        }

        // Newer Ollama releases use /api/embed, while older versions use /api/embeddings.
        // Try the new route first and fall back to the legacy route for compatibility.
        match self.embed_modern(model, texts).await {
            Ok(vectors) => Ok(vectors),
            Err(modern_err) => {
                let mut vectors = Vec::with_capacity(texts.len());
                for text in texts {
                    match self.embed_legacy(model, text).await {
                        Ok(vector) => vectors.push(vector),
                        Err(legacy_err) => {
                            return Err(anyhow::anyhow!(
                                "ollama embedding failed via /api/embed and /api/embeddings. \
                                 modern error: {modern_err}; legacy error: {legacy_err}; \
                                 ensure the embedding model is pulled (e.g. `ollama pull {model}`)"
                            ))
                        }
                    }
                }
                Ok(vectors)
            }
        }
    }

    async fn embed_modern(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbedReq {
                model,
                input: texts,
            })
            .send()
            .await
            .context("failed to call ollama embed endpoint")?;
        let response = ensure_ok(response, "/api/embed").await?;

        let response = response
            .json::<EmbedResp>()
            .await
            .context("failed to decode ollama /api/embed response")?;

        if response.embeddings.len() != texts.len() {
            anyhow::bail!(
                "ollama /api/embed returned {} embeddings for {} inputs",
                response.embeddings.len(),
                texts.len()
            );
        }

        Ok(response.embeddings)
    }

    async fn embed_legacy(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbeddingReq<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResp {
            embedding: Vec<f32>,
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbeddingReq {
                model,
                prompt: text,
            })
            .send()
            .await
            .context("failed to call ollama embeddings endpoint")?;
        let response = ensure_ok(response, "/api/embeddings").await?;

        let response = response
            .json::<EmbeddingResp>()
            .await
            .context("failed to decode ollama embeddings response")?;

        Ok(response.embedding)
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        seed: Option<u64>,
    ) -> Result<Message> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq::new(model, messages, tools, seed, false))
            .send()
            .await
            .context("failed to call ollama chat endpoint")?;
        let response = ensure_ok(response, "/api/chat").await?;

        let response = response
            .json::<ChatResp>()
            .await
            .context("failed to decode ollama chat response")?;

        Ok(response.message.into_message())
    }

    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
        seed: Option<u64>,
    ) -> Result<TextStream> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq::new(model, messages, &[], seed, true))
            .send()
            .await
            .context("failed to call ollama chat endpoint")?;
        let response = ensure_ok(response, "/api/chat").await?;

        let lines = ndjson_lines::<ChatResp>(response);
        let stream = try_stream! {
            futures::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                let line = line?;
                if !line.message.content.is_empty() {
                    yield line.message.content;
                }
                if line.done {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    pub async fn generate_raw(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
        seed: Option<u64>,
    ) -> Result<Completion> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq::new(model, prompt, max_tokens, stop, seed, false))
            .send()
            .await
            .context("failed to call ollama generate endpoint")?;
        let response = ensure_ok(response, "/api/generate").await?;

        let response = response
            .json::<GenerateResp>()
            .await
            .context("failed to decode ollama generate response")?;

        let tokens = response
            .eval_count
            .unwrap_or_else(|| estimate_tokens(&response.response));
        Ok(Completion {
            text: response.response,
            tokens,
        })
    }

    pub async fn generate_raw_stream(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
        seed: Option<u64>,
    ) -> Result<CompletionStream> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq::new(model, prompt, max_tokens, stop, seed, true))
            .send()
            .await
            .context("failed to call ollama generate endpoint")?;
        let response = ensure_ok(response, "/api/generate").await?;

        let lines = ndjson_lines::<GenerateResp>(response);
        let stream = try_stream! {
            futures::pin_mut!(lines);
            let mut text = String::new();
            let mut reported = None;
            while let Some(line) = lines.next().await {
                let line = line?;
                if !line.response.is_empty() {
                    text.push_str(&line.response);
                    yield CompletionChunk::Text(line.response);
                }
                if line.done {
                    reported = line.eval_count;
                    break;
                }
            }
            let tokens = reported.unwrap_or_else(|| estimate_tokens(&text));
            yield CompletionChunk::Done { tokens };
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.client.embed(&self.model, texts).await
    }
}

#[derive(Clone)]
pub struct OllamaModel {
    client: OllamaClient,
    model: String,
    seed: Option<u64>,
}

impl OllamaModel {
    pub fn new(client: OllamaClient, model: impl Into<String>, seed: Option<u64>) -> Self {
        Self {
            client,
            model: model.into(),
            seed,
        }
    }
}

#[async_trait]
impl ChatModel for OllamaModel {
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

#[async_trait]
impl CompletionModel for OllamaModel {
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
            .generate_raw(&self.model, prompt, max_tokens, stop, self.seed)
            .await
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
    ) -> Result<CompletionStream> {
        self.client
            .generate_raw_stream(&self.model, prompt, max_tokens, stop, self.seed)
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
    options: Option<SeedOptions>,
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
            options: seed.map(|seed| SeedOptions { seed }),
        }
    }
}

#[derive(Serialize)]
struct SeedOptions {
    seed: u64,
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
                    function: WireFunction {
                        name: &call.name,
                        arguments: &call.arguments,
                    },
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    arguments: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResp {
    message: RespMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct RespMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<RespToolCall>,
}

impl RespMessage {
    fn into_message(self) -> Message {
        let mut message = Message::new(Role::Assistant, self.content);
        message.tool_calls = self
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                // Ollama does not assign call ids.
                id: format!("call_{}", Uuid::new_v4().simple()),
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();
        message
    }
}

#[derive(Deserialize)]
struct RespToolCall {
    function: RespFunction,
}

#[derive(Deserialize)]
struct RespFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Serialize)]
struct GenerateReq<'a> {
    model: &'a str,
    prompt: &'a str,
    raw: bool,
    stream: bool,
    options: GenerateOptions<'a>,
}

impl<'a> GenerateReq<'a> {
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
            raw: true,
            stream,
            options: GenerateOptions {
                num_predict: max_tokens,
                stop,
                seed,
            },
        }
    }
}

#[derive(Serialize)]
struct GenerateOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
    #[serde(skip_serializing_if = "no_stop_markers")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

fn no_stop_markers(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Deserialize)]
struct GenerateResp {
    #[serde(default)]
    response: String,
    #[serde(default)]
    eval_count: Option<usize>,
    #[serde(default)]
    done: bool,
}

async fn ensure_ok(response: Response, route: &str) -> Result<Response> {
    if response.status() != StatusCode::OK {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!(
            "ollama {route} returned {status}: {}",
            normalize_err_body(&body)
        );
    }
    Ok(response)
}

fn ndjson_lines<T>(response: Response) -> impl Stream<Item = Result<T>> + Send
where
    T: DeserializeOwned + Send + 'static,
{
    try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.context("ollama stream interrupted")?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(parsed) = parse_line::<T>(&line)? {
                    yield parsed;
                }
            }
        }
        if let Some(parsed) = parse_line::<T>(&buffer)? {
            yield parsed;
        }
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
            anyhow::bail!("ollama stream error: {err}");
        }
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .with_context(|| format!("invalid ollama stream line: {trimmed}"))
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
