//! Streaming dialogue with the language model
//!
//! [`DialogueEngine::open`] connects with retry; the connection only counts as
//! established once the first delta has arrived within the first-token
//! timeout. After that the reply is a [`StreamingReply`]: a finite,
//! single-reader sequence of deltas ending in exactly one terminal marker.
//! Mid-stream failures are never retried.

mod segmenter;

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use segmenter::{Segmenter, SegmenterConfig, TextSegment, classify_reply_start};

use crate::config::LlmConfig;
use crate::context::{ConversationTurn, Role};
use crate::error::{DialogueError, StatusClass, classify_status};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{Error, Result};

/// Ordered text deltas from a backend
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, DialogueError>> + Send>>;

/// One chat message on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// A streaming completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogueRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A language model service that streams replies
#[async_trait]
pub trait DialogueBackend: Send + Sync {
    /// Open one streaming request (single attempt, no retry)
    async fn open(&self, request: &DialogueRequest) -> Result<DeltaStream, DialogueError>;
}

/// `OpenAI`-compatible `/chat/completions` streaming backend
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatBackend {
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("API key required for the language model".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[async_trait]
impl DialogueBackend for OpenAiChatBackend {
    async fn open(&self, request: &DialogueRequest) -> Result<DeltaStream, DialogueError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        };

        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            "opening chat stream"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DialogueError::Timeout(e.to_string())
                } else {
                    DialogueError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %text, "chat API error");
            let message = format!("chat API error {status}: {text}");
            return Err(match classify_status(status.as_u16()) {
                StatusClass::Auth => DialogueError::Auth(message),
                StatusClass::RateLimited => DialogueError::RateLimit(message),
                StatusClass::Server => DialogueError::Network(message),
                StatusClass::Client => DialogueError::MalformedStream(message),
            });
        }

        Ok(sse_deltas(response.bytes_stream()))
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Result of parsing one SSE line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Failed(DialogueError),
}

/// Line-oriented parser for `data: {...}` server-sent events
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed raw bytes; returns events for every complete line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_sse_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the body ends without a newline
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        parse_sse_line(line.trim())
    }
}

fn parse_sse_line(line: &str) -> Option<SseEvent> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return Some(SseEvent::Failed(DialogueError::MalformedStream(format!(
                    "server error in stream: {error}"
                ))));
            }
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .filter(|c| !c.is_empty())
                .map(SseEvent::Delta)
        }
        Err(e) => {
            tracing::debug!(error = %e, data, "failed to parse SSE chunk");
            Some(SseEvent::Failed(DialogueError::MalformedStream(e.to_string())))
        }
    }
}

struct SseState<S> {
    body: Pin<Box<S>>,
    parser: SseParser,
    queue: VecDeque<Result<String, DialogueError>>,
    done: bool,
}

/// Turn a raw SSE byte stream into ordered deltas
///
/// The stream ends after `[DONE]`, after the first error, or when the body
/// ends.
pub fn sse_deltas<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        parser: SseParser::default(),
        queue: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.queue.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for event in st.parser.push(bytes.as_ref()) {
                        match event {
                            SseEvent::Delta(text) => st.queue.push_back(Ok(text)),
                            SseEvent::Done => {
                                st.done = true;
                                break;
                            }
                            SseEvent::Failed(e) => {
                                st.queue.push_back(Err(e));
                                st.done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.queue
                        .push_back(Err(DialogueError::Network(format!("stream interrupted: {e}"))));
                    st.done = true;
                }
                None => {
                    match st.parser.flush() {
                        Some(SseEvent::Delta(text)) => st.queue.push_back(Ok(text)),
                        Some(SseEvent::Failed(e)) => st.queue.push_back(Err(e)),
                        Some(SseEvent::Done) | None => {}
                    }
                    st.done = true;
                }
            }
        }
    }))
}

/// Item yielded by [`StreamingReply::next`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Next piece of text, in emission order
    Delta(String),
    /// Reply completed normally
    Finished,
    /// Reply ended early; nothing further will arrive
    Errored(DialogueError),
}

/// A reply being streamed from the model
///
/// Yields deltas then exactly one terminal event, then `None` forever.
pub struct StreamingReply {
    first: Option<String>,
    inner: DeltaStream,
    idle_timeout: Duration,
    cancel: CancellationToken,
    terminated: bool,
}

impl StreamingReply {
    fn new(
        first: Option<String>,
        inner: DeltaStream,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            first,
            inner,
            idle_timeout,
            cancel,
            terminated: false,
        }
    }

    /// Next event, or `None` after the terminal event
    pub async fn next(&mut self) -> Option<ReplyEvent> {
        if self.terminated {
            return None;
        }

        if let Some(first) = self.first.take() {
            return Some(ReplyEvent::Delta(first));
        }

        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Some(self.terminate(ReplyEvent::Errored(DialogueError::Cancelled)));
                }
                item = tokio::time::timeout(self.idle_timeout, self.inner.next()) => item,
            };

            let event = match item {
                Err(_) => ReplyEvent::Errored(DialogueError::Timeout(format!(
                    "no delta for {:?}",
                    self.idle_timeout
                ))),
                Ok(None) => ReplyEvent::Finished,
                Ok(Some(Ok(delta))) if delta.is_empty() => continue,
                Ok(Some(Ok(delta))) => return Some(ReplyEvent::Delta(delta)),
                Ok(Some(Err(e))) => ReplyEvent::Errored(e),
            };

            return Some(self.terminate(event));
        }
    }

    /// Drop the upstream connection; later calls to `next` return `None`
    pub fn close(&mut self) {
        self.terminated = true;
        self.first = None;
        self.inner = Box::pin(futures::stream::empty());
    }

    fn terminate(&mut self, event: ReplyEvent) -> ReplyEvent {
        self.close();
        match &event {
            ReplyEvent::Errored(e) => tracing::debug!(error = %e, "reply stream ended with error"),
            _ => tracing::debug!("reply stream finished"),
        }
        event
    }
}

impl std::fmt::Debug for StreamingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingReply")
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

/// Knobs the engine needs from [`LlmConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub first_token_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&LlmConfig> for DialogueSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            first_token_timeout: config.first_token_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Streams language-model replies for the conversation
#[derive(Clone)]
pub struct DialogueEngine {
    backend: Arc<dyn DialogueBackend>,
    policy: RetryPolicy,
    settings: DialogueSettings,
    system_prompt: String,
}

impl std::fmt::Debug for DialogueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogueEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DialogueEngine {
    #[must_use]
    pub fn new(
        backend: Arc<dyn DialogueBackend>,
        policy: RetryPolicy,
        settings: DialogueSettings,
        system_prompt: String,
    ) -> Self {
        Self {
            backend,
            policy,
            settings,
            system_prompt,
        }
    }

    /// System prompt, then `history`, then the new user turn
    ///
    /// `history` is expected to be windowed already (see
    /// [`ConversationContext::window`](crate::context::ConversationContext::window)).
    #[must_use]
    pub fn build_request(&self, history: &[ConversationTurn], user_text: &str) -> DialogueRequest {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::new("system", &self.system_prompt));
        messages.extend(
            history
                .iter()
                .map(|turn| ChatMessage::new(turn.role.as_str(), turn.text.as_str())),
        );

        messages.push(ChatMessage::new(Role::User.as_str(), user_text));

        DialogueRequest {
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    /// Open a reply stream for `user_text`
    ///
    /// Connecting and receiving the first delta are retried as one unit.
    ///
    /// # Errors
    ///
    /// Returns the connection error once retries are exhausted, a permanent
    /// error immediately, or `Cancelled`
    pub async fn open(
        &self,
        history: &[ConversationTurn],
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamingReply, DialogueError> {
        let request = self.build_request(history, user_text);

        let (first, inner) = retry_with_backoff(
            &self.policy,
            self.settings.first_token_timeout,
            cancel,
            "dialogue connect",
            |attempt| {
                let backend = Arc::clone(&self.backend);
                let request = &request;
                async move {
                    tracing::debug!(attempt, "dialogue connection attempt");
                    let mut stream = backend.open(request).await?;
                    loop {
                        match stream.next().await {
                            Some(Ok(delta)) if delta.is_empty() => {}
                            Some(Ok(delta)) => return Ok((Some(delta), stream)),
                            Some(Err(e)) => return Err(e),
                            None => return Ok((None, stream)),
                        }
                    }
                }
            },
        )
        .await?;

        tracing::debug!("dialogue stream established");
        Ok(StreamingReply::new(
            first,
            inner,
            self.settings.idle_timeout,
            cancel.clone(),
        ))
    }
}
