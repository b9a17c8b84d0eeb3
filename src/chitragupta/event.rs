//! Typed agent event system.
//!
//! A callback-based observability layer for the agent loop. Implement
//! [`EventSink`] to receive real-time notifications about turn boundaries,
//! raw stream deltas, tool completions, and sub-agent spawns. Every emitted
//! kind is a dedicated [`AgentEvent`] variant with a structured payload —
//! there is no stringly-typed `(event, data)` channel.
//!
//! The sink is wrapped in `Arc<dyn EventSink>` and shared across the whole
//! agent tree via the spawn context; it must not block, and a slow or
//! panicking sink never stalls the loop (emission from synchronous paths is
//! fire-and-forget through a detached task).
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use chitragupta::chitragupta::event::{AgentEvent, EventSink};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventSink for Printer {
//!     async fn on_event(&self, event: &AgentEvent) {
//!         if let AgentEvent::StreamText { chunk, .. } = event {
//!             print!("{}", chunk);
//!         }
//!     }
//! }
//! ```

use crate::chitragupta::provider::{StopReason, StreamUsage};
use async_trait::async_trait;
use std::sync::Arc;

/// Events emitted by an agent during its lifecycle.
///
/// Every variant carries the source `agent_id` so sinks can identify the
/// emitter without external state.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A `prompt` call began processing a user turn.
    TurnStart { agent_id: String },
    /// The prompt loop finished; `turns` counts LLM round-trips consumed.
    TurnDone {
        agent_id: String,
        turns: usize,
        usage: StreamUsage,
    },
    /// The provider accepted a request and assigned a message id.
    StreamStart { agent_id: String, message_id: String },
    /// Incremental assistant text, forwarded verbatim.
    StreamText { agent_id: String, chunk: String },
    /// Incremental assistant reasoning, forwarded verbatim.
    StreamThinking { agent_id: String, chunk: String },
    /// The assistant requested a tool call.
    StreamToolCall {
        agent_id: String,
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// The provider stream reached its terminal event.
    StreamDone {
        agent_id: String,
        stop_reason: StopReason,
        usage: StreamUsage,
    },
    /// A tool finished executing (success or error).
    ToolDone {
        agent_id: String,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
    },
    /// A child agent was spawned.
    SubagentSpawn {
        parent_id: String,
        child_id: String,
        purpose: String,
    },
}

impl AgentEvent {
    /// The id of the agent this event originated from.
    pub fn agent_id(&self) -> &str {
        match self {
            AgentEvent::TurnStart { agent_id }
            | AgentEvent::TurnDone { agent_id, .. }
            | AgentEvent::StreamStart { agent_id, .. }
            | AgentEvent::StreamText { agent_id, .. }
            | AgentEvent::StreamThinking { agent_id, .. }
            | AgentEvent::StreamToolCall { agent_id, .. }
            | AgentEvent::StreamDone { agent_id, .. }
            | AgentEvent::ToolDone { agent_id, .. } => agent_id,
            AgentEvent::SubagentSpawn { parent_id, .. } => parent_id,
        }
    }
}

/// Receiver of [`AgentEvent`]s. The default implementation ignores
/// everything, so sinks only override what they care about.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, _event: &AgentEvent) {}
}

/// No-op sink used when the host does not observe events.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {}

/// Small dispatcher that fans events to an optional sink.
#[derive(Clone)]
pub struct EventBus {
    sink: Option<Arc<dyn EventSink>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self { sink: None }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Deliver an event from an async context.
    pub async fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(&event).await;
        }
    }

    /// Deliver an event from a synchronous context. Delivery is
    /// fire-and-forget through a detached task; events may interleave with
    /// async emissions but never block the caller.
    pub fn emit_detached(&self, event: AgentEvent) {
        if let Some(sink) = &self.sink {
            let sink = Arc::clone(sink);
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    sink.on_event(&event).await;
                });
            }
        }
    }
}
