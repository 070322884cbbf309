use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{FragmentStream, Generation, GenerationProvider, ProviderError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

/// Gemini REST adapter. Build once and share behind an `Arc`.
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, method: &str) -> String {
        let model = self
            .config
            .model
            .strip_prefix("models/")
            .unwrap_or(&self.config.model);
        format!(
            "{}/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    fn request(&self, url: String, prompt: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&json!({
                "contents": [
                    {
                        "role": "user",
                        "parts": [{ "text": prompt }]
                    }
                ]
            }))
    }
}

#[async_trait]
impl GenerationProvider for GeminiClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let request = self.request(self.endpoint("generateContent"), prompt);
        let fut = async {
            let response = request.send().await.map_err(send_error)?;
            let response = ensure_success(response).await?;
            Ok::<Bytes, ProviderError>(response.bytes().await.map_err(send_error)?)
        };

        let body = timeout(self.config.timeout, fut)
            .await
            .map_err(|_| ProviderError::Timeout)??;

        let raw: Value =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let parsed: GenerateContentResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let text = candidate_text(&parsed)?;
        debug!(
            model = %self.config.model,
            chars = text.as_ref().map_or(0, String::len),
            "generateContent finished"
        );

        Ok(Generation { text, raw })
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
        let request = self.request(self.endpoint("streamGenerateContent?alt=sse"), prompt);
        let response = timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(send_error)?;
        let response = ensure_success(response).await?;
        debug!(model = %self.config.model, "streamGenerateContent opened");

        Ok(sse_fragments(response.bytes_stream()))
    }
}

/// Read deadlines surface from reqwest as errors; report them as timeouts.
fn send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read response body>".to_string());
    warn!(status = status.as_u16(), "provider rejected request");
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn candidate_text(response: &GenerateContentResponse) -> Result<Option<String>, ProviderError> {
    let Some(candidate) = response.candidates.first() else {
        if let Some(reason) = response
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.clone())
        {
            return Err(ProviderError::Blocked(reason));
        }
        return Ok(None);
    };

    let texts: Vec<&str> = candidate
        .content
        .iter()
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect();

    if texts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(texts.concat()))
    }
}

/// Splits a byte stream into lines, holding partial lines across chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(decode_line(&line[..end]))
    }

    fn take_remaining(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    let line: &str = &line;
    line.strip_suffix('\r').unwrap_or(line).to_string()
}

struct SseState<S> {
    upstream: Pin<Box<S>>,
    lines: LineBuffer,
    queued: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

impl<S> SseState<S> {
    fn ingest_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data.is_empty() || data == "[DONE]" {
            return;
        }

        let item = serde_json::from_str::<GenerateContentResponse>(data)
            .map_err(|e| ProviderError::Decode(e.to_string()))
            .and_then(|response| candidate_text(&response));
        match item {
            Ok(Some(text)) if !text.is_empty() => self.queued.push_back(Ok(text)),
            Ok(_) => {}
            Err(err) => self.queued.push_back(Err(err)),
        }
    }
}

/// Turns a Gemini `alt=sse` body into text fragments. The stream ends after
/// the first error item.
fn sse_fragments<S, E>(upstream: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        upstream: Box::pin(upstream),
        lines: LineBuffer::default(),
        queued: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                if item.is_err() {
                    state.finished = true;
                    state.queued.clear();
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.lines.push(&chunk);
                    while let Some(line) = state.lines.next_line() {
                        state.ingest_line(&line);
                    }
                }
                Some(Err(err)) => {
                    state
                        .queued
                        .push_back(Err(ProviderError::Stream(err.to_string())));
                }
                None => {
                    if let Some(line) = state.lines.take_remaining() {
                        state.ingest_line(&line);
                    }
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
