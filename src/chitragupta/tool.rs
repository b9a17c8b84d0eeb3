//! Tool execution under policy.
//!
//! Named [`ToolHandler`]s live in a [`ToolRegistry`]; the [`ToolExecutor`]
//! dispatches calls through the policy engine, captures handler panics,
//! feeds timing into the learning loop, and emits `ToolDone` events. A
//! denied or unknown tool is an error-tagged [`ToolOutcome`] written back
//! into the conversation, never a process failure — the agent is expected
//! to recover or re-plan.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::event::{AgentEvent, EventBus};
use crate::chitragupta::learning::LearningLoop;
use crate::chitragupta::provider::{CancellationToken, ToolSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Result of one tool call as seen by the assistant.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Ambient context passed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub agent_id: String,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            working_dir: PathBuf::from("."),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A named tool the assistant can call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the accepted arguments; inspected by the policy
    /// engine and forwarded to providers.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome;
}

/// Named handler lookup shared across an agent tree.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Names of every registered tool, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider-facing specs for every registered tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .handlers
            .values()
            .map(|h| ToolSpec {
                name: h.name().to_string(),
                description: h.description().to_string(),
                parameters_schema: h.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Verdict from the policy engine for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
    /// Suspend until the approval collaborator resolves allow/deny.
    Ask,
}

/// External policy contract consulted before every tool call.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn check(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> PolicyDecision;
}

/// Policy that allows everything; the default for embedded use.
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEngine for AllowAllPolicy {
    async fn check(
        &self,
        _tool_name: &str,
        _args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Out-of-band approval collaborator resolving `Ask` decisions.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// True allows the call, false denies it.
    async fn resolve(&self, tool_name: &str, args: &serde_json::Value) -> bool;
}

/// Dispatches tool calls under policy, recording outcomes.
pub struct ToolExecutor {
    registry: Arc<RwLock<ToolRegistry>>,
    policy: Arc<dyn PolicyEngine>,
    approval: Option<Arc<dyn ApprovalGate>>,
    approval_timeout: Duration,
    learning: Arc<Mutex<LearningLoop>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<RwLock<ToolRegistry>>,
        policy: Arc<dyn PolicyEngine>,
        learning: Arc<Mutex<LearningLoop>>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            policy,
            approval: None,
            approval_timeout: Duration::from_secs(300),
            learning,
            clock,
            events,
        }
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>, timeout: Duration) -> Self {
        self.approval = Some(gate);
        self.approval_timeout = timeout;
        self
    }

    pub fn registry(&self) -> Arc<RwLock<ToolRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Execute one tool call end to end.
    ///
    /// 1. Resolve the handler — unknown tools yield an error outcome.
    /// 2. Consult the policy engine; `Ask` suspends on the approval gate
    ///    under the configured timeout.
    /// 3. Invoke the handler in a spawned task so panics become error
    ///    outcomes instead of tearing down the loop.
    /// 4. Record timing and success into the learning loop and emit
    ///    `ToolDone`.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let started = self.clock.now_ms();

        let handler = {
            let registry = self.registry.read().await;
            registry.get(tool_name)
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                let outcome = ToolOutcome::error(format!("Unknown tool: {}", tool_name));
                self.finish(tool_name, ctx, started, &outcome).await;
                return outcome;
            }
        };

        match self.policy.check(tool_name, &args, ctx).await {
            PolicyDecision::Allow => {}
            PolicyDecision::Deny { reason } => {
                let outcome =
                    ToolOutcome::error(format!("Tool '{}' denied by policy: {}", tool_name, reason));
                self.finish(tool_name, ctx, started, &outcome).await;
                return outcome;
            }
            PolicyDecision::Ask => {
                let approved = match &self.approval {
                    Some(gate) => {
                        match tokio::time::timeout(
                            self.approval_timeout,
                            gate.resolve(tool_name, &args),
                        )
                        .await
                        {
                            Ok(approved) => approved,
                            Err(_) => {
                                let outcome = ToolOutcome::error(format!(
                                    "Tool '{}' approval timed out",
                                    tool_name
                                ));
                                self.finish(tool_name, ctx, started, &outcome).await;
                                return outcome;
                            }
                        }
                    }
                    // No approval collaborator wired in: fail closed.
                    None => false,
                };
                if !approved {
                    let outcome = ToolOutcome::error(format!(
                        "Tool '{}' denied by approval gate",
                        tool_name
                    ));
                    self.finish(tool_name, ctx, started, &outcome).await;
                    return outcome;
                }
            }
        }

        let ctx_clone = ctx.clone();
        let join = tokio::spawn(async move { handler.execute(args, &ctx_clone).await });
        let outcome = match join.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                log::error!("tool '{}' panicked during execution", tool_name);
                ToolOutcome::error(format!("Tool '{}' panicked during execution", tool_name))
            }
            Err(_) => ToolOutcome::error(format!("Tool '{}' task was cancelled", tool_name)),
        };

        self.finish(tool_name, ctx, started, &outcome).await;
        outcome
    }

    async fn finish(
        &self,
        tool_name: &str,
        ctx: &ToolContext,
        started_ms: u64,
        outcome: &ToolOutcome,
    ) {
        let duration_ms = self.clock.now_ms().saturating_sub(started_ms);
        self.learning
            .lock()
            .unwrap()
            .record_call(tool_name, !outcome.is_error, duration_ms);
        self.events
            .emit(AgentEvent::ToolDone {
                agent_id: ctx.agent_id.clone(),
                tool_name: tool_name.to_string(),
                is_error: outcome.is_error,
                duration_ms,
            })
            .await;
    }
}
