//! Shared primitives for provider-agnostic LLM streaming.
//!
//! The runtime interacts with every LLM vendor through the [`Provider`]
//! trait and the lightweight data types defined in this module. The trait
//! abstracts over concrete vendor implementations while the supporting
//! structs describe turns, typed content parts, streaming events, and token
//! accounting.
//!
//! A provider exposes exactly one operation: [`Provider::stream`], which
//! produces a lazy, single-shot, cancellable sequence of [`StreamEvent`]s.
//! The sequence is ordered, delivers every delta exactly once, and ends with
//! exactly one terminal event — [`StreamEvent::Done`] or
//! [`StreamEvent::Error`]. The caller drives the sequence; no event is
//! delivered out of band.
//!
//! # Collecting a stream
//!
//! ```rust,no_run
//! use chitragupta::chitragupta::provider::{collect_stream, EventStream};
//!
//! # async fn demo(stream: EventStream) -> Result<(), Box<dyn std::error::Error>> {
//! let collected = collect_stream(stream).await?;
//! println!("assistant said: {}", collected.text);
//! for call in &collected.tool_calls {
//!     println!("requested tool: {}", call.name);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Represents the possible roles for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A user authored turn (frequently a mirror of a human end-user request).
    User,
    /// An assistant authored turn (model responses, possibly mixing text and tool calls).
    Assistant,
    /// A system authored turn that primes or constrains assistant behaviour.
    System,
    /// A turn carrying tool results correlated to prior assistant tool calls.
    Tool,
}

/// A single tool call requested by the assistant.
///
/// Providers assign an opaque [`id`](ToolCall::id) to each call so that the
/// tool result can be correlated back in a follow-up [`Role::Tool`] turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolSpec`]s sent in the request.
    pub name: String,
    /// Raw JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// One typed piece of a turn's content.
///
/// Assistant turns may interleave `Text` and `ToolCall` parts; tool turns
/// carry `ToolResult` parts correlated by call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        id: String,
        content: String,
        is_error: bool,
    },
}

/// A role-tagged message composed of typed content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    /// Build a user turn from plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Build an assistant turn from plain text.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Build a system turn from plain text.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Build a tool turn carrying one result per executed call.
    pub fn tool_results(results: Vec<(String, String, bool)>) -> Self {
        Self {
            role: Role::Tool,
            parts: results
                .into_iter()
                .map(|(id, content, is_error)| ContentPart::ToolResult {
                    id,
                    content,
                    is_error,
                })
                .collect(),
        }
    }

    /// Concatenate every text part of this turn.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Collect the tool calls carried by this turn.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Provider-agnostic tool schema forwarded with a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name as it will appear in the provider's tools array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The assistant finished its turn normally.
    EndTurn,
    /// The assistant is waiting for tool results.
    ToolUse,
    /// The output token budget was exhausted mid-generation.
    MaxTokens,
    /// The stream was cancelled by the caller.
    Aborted,
}

/// How many tokens were spent on prompt vs. completion, plus cache traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl StreamUsage {
    /// Prompt plus completion tokens (cache traffic excluded).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold another usage report into this one.
    pub fn add(&mut self, other: &StreamUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// One event in a provider's streaming response.
///
/// Ordering contract: exactly one `Start`, any number of `Text` /
/// `Thinking` / `ToolCall` events, then exactly one terminal `Done` or
/// `Error`. A single logical delta is never split across interleaved
/// events of different kinds.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The provider accepted the request and assigned a message id.
    Start { message_id: String },
    /// An incremental piece of assistant text.
    Text { chunk: String },
    /// An incremental piece of assistant reasoning, when the model exposes it.
    Thinking { chunk: String },
    /// A fully-assembled tool call requested by the assistant.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Terminal success: the stream is complete.
    Done {
        stop_reason: StopReason,
        usage: StreamUsage,
    },
    /// Terminal failure.
    Error { error: ProviderError },
}

/// Classification used by the retry layer to tell transient failures from
/// terminal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    ServerError,
    Connection,
    BadRequest,
    Auth,
    NotFound,
    Aborted,
    Other,
}

impl ProviderErrorKind {
    /// Transient failures are retried with backoff; everything else surfaces.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::Connection
        )
    }
}

/// Error produced by a provider stream or its resilience wrappers.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Explicit retry delay requested by the provider (e.g. a 429's
    /// `retry-after`), honored by the retry layer when present.
    pub retry_after_ms: Option<u64>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error ({:?}): {}", self.kind, self.message)
    }
}

impl Error for ProviderError {}

/// A chat request forwarded to a provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier (e.g. `"claude-sonnet-4"`).
    pub model: String,
    /// System prompt prepended by the provider.
    pub system_prompt: String,
    /// Ordered conversation history.
    pub turns: Vec<Turn>,
    /// Tools the assistant may call.
    pub tools: Vec<ToolSpec>,
    /// Optional output-token ceiling.
    pub max_tokens: Option<u64>,
}

/// Type alias for a stream of events compatible with `Send` executors.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Clonable cancellation handle propagated across streams, retries, rate
/// limiter waits, and agent subtrees.
///
/// # Example
///
/// ```rust
/// use chitragupta::chitragupta::provider::CancellationToken;
///
/// let token = CancellationToken::new();
/// let child = token.clone();
/// token.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the token; idempotent. Every clone observes the cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled. Safe to race with `cancel`.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Trait-driven abstraction for a concrete LLM provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks. The conversation bookkeeping lives in the
/// agent loop; providers translate a [`ChatRequest`] into vendor wire
/// traffic and surface the response as an ordered [`EventStream`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable name this provider is registered under (e.g. `"anthropic"`).
    fn name(&self) -> &str;

    /// Open a streaming response for `request`.
    ///
    /// The returned stream must emit exactly one terminal event and stop.
    /// When `cancel` fires mid-stream, implementations should end the
    /// sequence promptly — either with `Done { stop_reason: Aborted, .. }`
    /// or an `Error` of kind [`ProviderErrorKind::Aborted`].
    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError>;
}

/// Named lookup of registered providers.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous entry.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Names of all registered providers, sorted for stable display.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Everything accumulated from a stream up to its terminal event.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub message_id: Option<String>,
    pub text: String,
    pub thinking_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: StreamUsage,
}

/// Drain a stream, accumulating deltas until the terminal event.
///
/// `Error` terminal events propagate as `Err`; a stream that ends without
/// any terminal event is a contract violation and surfaces as
/// [`ProviderErrorKind::Other`].
pub async fn collect_stream(mut stream: EventStream) -> Result<CollectedResponse, ProviderError> {
    let mut message_id = None;
    let mut text = String::new();
    let mut thinking_text = String::new();
    let mut tool_calls = Vec::new();

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Start { message_id: id } => message_id = Some(id),
            StreamEvent::Text { chunk } => text.push_str(&chunk),
            StreamEvent::Thinking { chunk } => thinking_text.push_str(&chunk),
            StreamEvent::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(ToolCall {
                id,
                name,
                arguments,
            }),
            StreamEvent::Done { stop_reason, usage } => {
                return Ok(CollectedResponse {
                    message_id,
                    text,
                    thinking_text,
                    tool_calls,
                    stop_reason,
                    usage,
                });
            }
            StreamEvent::Error { error } => return Err(error),
        }
    }

    Err(ProviderError::new(
        ProviderErrorKind::Other,
        "stream ended without a terminal event",
    ))
}
