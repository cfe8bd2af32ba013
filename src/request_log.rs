use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::Stream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::QueryRequest;

pub const STREAM_ENDPOINT: &str = "/query_stream";
pub const CLIENT_DISCONNECTED: &str = "client_disconnected";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedResponse {
    pub body: String,
    pub status_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub request: QueryRequest,
    pub response: LoggedResponse,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\-]").unwrap_or_else(|_| Regex::new("^$").unwrap()))
}

pub fn safe_filename(thread_id: &str) -> String {
    unsafe_chars().replace_all(thread_id, "_").into_owned()
}

/// Appends one JSON line per streamed request to `{dir}/{thread}.jsonl`.
/// Writes run on the blocking pool; `flush` waits for the ones in flight.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    dir: PathBuf,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RequestLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, thread_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", safe_filename(thread_id)))
    }

    pub fn append(&self, thread_id: &str, entry: &RequestLogEntry) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating log dir {}", self.dir.display()))?;
        let path = self.path_for(thread_id);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn append_in_background(&self, entry: RequestLogEntry) {
        let logger = self.clone();
        let write = move || {
            if let Err(err) = logger.append(&entry.request.thread_id, &entry) {
                warn!(thread_id = %entry.request.thread_id, error = %err, "failed to write request log");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn_blocking(write);
                if let Ok(mut pending) = self.pending.lock() {
                    pending.retain(|h| !h.is_finished());
                    pending.push(handle);
                }
            }
            Err(_) => write(),
        }
    }

    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "request log write task failed");
            }
        }
    }

    pub fn wrap<S>(&self, request: QueryRequest, inner: S) -> LoggedStream<S>
    where
        S: Stream<Item = Result<String>> + Unpin,
    {
        LoggedStream {
            inner,
            logger: self.clone(),
            request: Some(request),
            body: String::new(),
            error: None,
            started: Instant::now(),
        }
    }
}

/// Stream wrapper that records the concatenated body. The entry is written
/// when the inner stream ends, or on drop if the client went away first.
pub struct LoggedStream<S> {
    inner: S,
    logger: RequestLogger,
    request: Option<QueryRequest>,
    body: String,
    error: Option<String>,
    started: Instant,
}

impl<S> LoggedStream<S> {
    fn finish(&mut self, error: Option<String>) {
        let Some(request) = self.request.take() else {
            return;
        };
        let status_code = match &error {
            Some(e) if e != CLIENT_DISCONNECTED => 500,
            _ => 200,
        };
        let seconds = self.started.elapsed().as_secs_f64();
        let entry = RequestLogEntry {
            timestamp: Utc::now(),
            endpoint: STREAM_ENDPOINT.to_string(),
            method: "POST".to_string(),
            response: LoggedResponse {
                body: std::mem::take(&mut self.body),
                status_code,
            },
            duration_seconds: (seconds * 1000.0).round() / 1000.0,
            error,
            request,
        };
        self.logger.append_in_background(entry);
    }
}

impl<S> Stream for LoggedStream<S>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(text))) => {
                this.body.push_str(&text);
                Poll::Ready(Some(Ok(text)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.error = Some(format!("{err:#}"));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                let error = this.error.take();
                this.finish(error);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for LoggedStream<S> {
    fn drop(&mut self) {
        let error = self
            .error
            .take()
            .or_else(|| Some(CLIENT_DISCONNECTED.to_string()));
        self.finish(error);
    }
}

pub fn read_entries(path: &Path) -> Result<Vec<RequestLogEntry>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("parsing request log line"))
        .collect()
}
