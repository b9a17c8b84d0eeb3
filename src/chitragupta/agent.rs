//! Agent tree and conversation loop.
//!
//! An [`Agent`] is a conversational LLM process with identity, a state
//! machine, and an ordered history of typed turns. Agents form a tree:
//! [`spawn`](Agent::spawn) creates children (bounded in width and depth),
//! [`abort`](Agent::abort) cascades depth-first over living descendants,
//! and the traversal helpers expose ancestry, lineage, and snapshots.
//!
//! Every collaborator an agent needs — provider registry, tool executor,
//! Samiti, learning loop, KaalaBrahma, events, clock, config — travels in
//! one explicit [`TreeContext`] constructed at the root and threaded into
//! every child at spawn. Nothing is reached through globals.
//!
//! # The prompt loop
//!
//! [`prompt`](Agent::prompt) appends the user turn, opens the provider
//! stream, forwards every stream event verbatim to the event sink, and
//! accumulates text/thinking/tool calls until the terminal event. A
//! `tool_use` stop reason routes each call through the policy-gated tool
//! executor, appends the tool-result turn, and re-enters the stream with
//! the updated history. The loop ends on `end_turn`, errors fatally at 25
//! round-trips, and honors cancellation at every suspension point.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::config::ChitraguptaConfig;
use crate::chitragupta::cost::{calculate_cost, CostTracker, ModelCatalog};
use crate::chitragupta::event::{AgentEvent, EventBus};
use crate::chitragupta::ids::short_id;
use crate::chitragupta::kaala_brahma::KaalaBrahma;
use crate::chitragupta::learning::LearningLoop;
use crate::chitragupta::provider::{
    CancellationToken, ChatRequest, ContentPart, ProviderError, ProviderRegistry, StopReason,
    StreamEvent, StreamUsage, ToolCall, Turn,
};
use crate::chitragupta::samiti::Samiti;
use crate::chitragupta::tool::{ToolContext, ToolExecutor};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Running,
    Completed,
    Aborted,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Completed => "completed",
            AgentState::Aborted => "aborted",
            AgentState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Failures surfaced by agent operations.
#[derive(Debug)]
pub enum AgentError {
    /// Spawning would exceed the per-parent child cap.
    SpawnWidthExceeded { children: usize },
    /// Spawning would exceed the tree depth cap.
    SpawnDepthExceeded { depth: usize },
    /// The configured provider is not registered.
    ProviderMissing(String),
    /// The provider stream failed terminally.
    Provider(ProviderError),
    /// The prompt loop hit the round-trip ceiling; fatal for the turn.
    MaxTurnsExceeded(usize),
    /// The agent was aborted.
    Aborted,
    /// The stream violated its ordering contract.
    Protocol(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::SpawnWidthExceeded { children } => write!(
                f,
                "Cannot spawn sub-agent: parent already has {} children",
                children
            ),
            AgentError::SpawnDepthExceeded { depth } => write!(
                f,
                "Cannot spawn sub-agent: depth {} would exceed the maximum",
                depth
            ),
            AgentError::ProviderMissing(name) => write!(f, "Provider not registered: {}", name),
            AgentError::Provider(err) => write!(f, "Provider failure: {}", err),
            AgentError::MaxTurnsExceeded(n) => {
                write!(f, "Prompt loop exceeded {} turns without completing", n)
            }
            AgentError::Aborted => write!(f, "Agent was aborted"),
            AgentError::Protocol(msg) => write!(f, "Stream protocol violation: {}", msg),
        }
    }
}

impl Error for AgentError {}

/// Everything a tree of agents shares, built once at the root.
#[derive(Clone)]
pub struct TreeContext {
    pub providers: Arc<RwLock<ProviderRegistry>>,
    pub executor: Arc<ToolExecutor>,
    pub samiti: Arc<Samiti>,
    pub learning: Arc<Mutex<LearningLoop>>,
    pub kaala: Arc<KaalaBrahma>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub cost: Arc<CostTracker>,
    pub catalog: Arc<ModelCatalog>,
    pub config: ChitraguptaConfig,
}

/// Identity and wiring for a new agent. Unset provider/model inherit from
/// the parent at spawn.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub id: Option<String>,
    pub purpose: String,
    pub system_prompt: String,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl AgentConfig {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Recursive node of a tree snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub purpose: String,
    pub status: AgentState,
    pub children: Vec<TreeNode>,
}

/// Snapshot returned by [`Agent::get_tree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub total_agents: usize,
    pub max_depth: usize,
    pub root: TreeNode,
}

static SPAWN_SEQ: AtomicU64 = AtomicU64::new(0);

/// A conversational LLM process in the tree. Always handled as
/// `Arc<Agent>`; the tree links are `Weak` upward and `Arc` downward.
pub struct Agent {
    id: String,
    purpose: String,
    depth: usize,
    provider_id: String,
    model_id: String,
    system_prompt: String,
    session_id: String,
    state: RwLock<AgentState>,
    history: Mutex<Vec<Turn>>,
    parent: Weak<Agent>,
    children: Mutex<Vec<Arc<Agent>>>,
    cancel: CancellationToken,
    ctx: TreeContext,
}

impl Agent {
    /// Create a root agent (depth 0) and register it with KaalaBrahma.
    pub fn root(config: AgentConfig, session_id: impl Into<String>, ctx: TreeContext) -> Arc<Self> {
        let id = config
            .id
            .unwrap_or_else(|| format!("root-{}", uuid::Uuid::new_v4()));
        let agent = Arc::new(Self {
            id: id.clone(),
            purpose: config.purpose,
            depth: 0,
            provider_id: config.provider.unwrap_or_default(),
            model_id: config.model.unwrap_or_default(),
            system_prompt: config.system_prompt,
            session_id: session_id.into(),
            state: RwLock::new(AgentState::Idle),
            history: Mutex::new(Vec::new()),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            ctx,
        });
        agent
            .ctx
            .kaala
            .register(&agent.id, 0, None, &agent.purpose);
        agent
    }

    // ---- Identity accessors ----

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn state(&self) -> AgentState {
        *self.state.read().unwrap()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Copy of the conversation history.
    pub fn history(&self) -> Vec<Turn> {
        self.history.lock().unwrap().clone()
    }

    fn set_state(&self, next: AgentState) {
        *self.state.write().unwrap() = next;
    }

    // ---- Tree construction ----

    /// Spawn a child agent.
    ///
    /// Fails when the parent already has the maximum number of children or
    /// when the child would exceed the depth cap. The child inherits the
    /// parent's provider and model unless the config overrides them, gets
    /// its own cancellation token, registers with KaalaBrahma, and a
    /// `SubagentSpawn` event fires.
    pub fn spawn(self: &Arc<Self>, config: AgentConfig) -> Result<Arc<Agent>, AgentError> {
        let mut children = self.children.lock().unwrap();
        if children.len() >= self.ctx.config.max_sub_agents {
            return Err(AgentError::SpawnWidthExceeded {
                children: children.len(),
            });
        }
        let child_depth = self.depth + 1;
        if child_depth > self.ctx.config.max_agent_depth {
            return Err(AgentError::SpawnDepthExceeded { depth: child_depth });
        }

        let seq = SPAWN_SEQ.fetch_add(1, Ordering::SeqCst).to_string();
        let id = config.id.clone().unwrap_or_else(|| {
            short_id("agt", &[&self.id, &config.purpose, &seq])
        });
        let child = Arc::new(Agent {
            id: id.clone(),
            purpose: config.purpose.clone(),
            depth: child_depth,
            provider_id: config.provider.unwrap_or_else(|| self.provider_id.clone()),
            model_id: config.model.unwrap_or_else(|| self.model_id.clone()),
            system_prompt: config.system_prompt,
            session_id: self.session_id.clone(),
            state: RwLock::new(AgentState::Idle),
            history: Mutex::new(Vec::new()),
            parent: Arc::downgrade(self),
            children: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            ctx: self.ctx.clone(),
        });
        children.push(Arc::clone(&child));
        drop(children);

        self.ctx
            .kaala
            .register(&child.id, child_depth, Some(&self.id), &child.purpose);
        self.ctx.events.emit_detached(AgentEvent::SubagentSpawn {
            parent_id: self.id.clone(),
            child_id: id,
            purpose: config.purpose,
        });
        Ok(child)
    }

    /// Abort this agent and cascade depth-first over every living
    /// descendant. Completed agents keep their terminal state.
    pub fn abort(&self) {
        self.cancel.cancel();
        {
            let mut state = self.state.write().unwrap();
            if *state != AgentState::Completed {
                *state = AgentState::Aborted;
            }
        }
        let children: Vec<Arc<Agent>> = self.children.lock().unwrap().clone();
        for child in children {
            child.abort();
        }
    }

    /// Abort and drop all children. The agent itself stays usable as a
    /// leaf.
    pub fn dispose(&self) {
        let children: Vec<Arc<Agent>> = {
            let mut slot = self.children.lock().unwrap();
            std::mem::take(&mut *slot)
        };
        for child in &children {
            child.abort();
            self.ctx.kaala.kill_agent(child.id());
        }
    }

    // ---- Traversal helpers ----

    pub fn get_parent(&self) -> Option<Arc<Agent>> {
        self.parent.upgrade()
    }

    pub fn get_root(self: &Arc<Self>) -> Arc<Agent> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.get_parent() {
            current = parent;
        }
        current
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn get_ancestors(&self) -> Vec<Arc<Agent>> {
        let mut ancestors = Vec::new();
        let mut current = self.get_parent();
        while let Some(agent) = current {
            current = agent.get_parent();
            ancestors.push(agent);
        }
        ancestors
    }

    /// Ids from the root down to this agent, inclusive.
    pub fn get_lineage(&self) -> Vec<String> {
        let mut lineage: Vec<String> = self
            .get_ancestors()
            .into_iter()
            .map(|a| a.id.clone())
            .collect();
        lineage.reverse();
        lineage.push(self.id.clone());
        lineage
    }

    pub fn get_children(&self) -> Vec<Arc<Agent>> {
        self.children.lock().unwrap().clone()
    }

    /// Depth-first preorder descendants (excluding self).
    pub fn get_descendants(&self) -> Vec<Arc<Agent>> {
        let mut out = Vec::new();
        for child in self.get_children() {
            out.push(Arc::clone(&child));
            out.extend(child.get_descendants());
        }
        out
    }

    pub fn get_siblings(self: &Arc<Self>) -> Vec<Arc<Agent>> {
        match self.get_parent() {
            Some(parent) => parent
                .get_children()
                .into_iter()
                .filter(|c| c.id != self.id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Find an agent by id within this agent's subtree (self included).
    pub fn find_agent(self: &Arc<Self>, id: &str) -> Option<Arc<Agent>> {
        if self.id == id {
            return Some(Arc::clone(self));
        }
        self.get_descendants().into_iter().find(|a| a.id == id)
    }

    pub fn is_descendant_of(&self, other: &Agent) -> bool {
        self.get_ancestors().iter().any(|a| a.id == other.id)
    }

    pub fn is_ancestor_of(&self, other: &Agent) -> bool {
        other.is_descendant_of(self)
    }

    fn snapshot_node(&self) -> TreeNode {
        TreeNode {
            id: self.id.clone(),
            purpose: self.purpose.clone(),
            status: self.state(),
            children: self.get_children().iter().map(|c| c.snapshot_node()).collect(),
        }
    }

    /// Structured snapshot of this agent's subtree.
    pub fn get_tree(self: &Arc<Self>) -> TreeSnapshot {
        let descendants = self.get_descendants();
        let max_depth = descendants
            .iter()
            .map(|a| a.depth)
            .max()
            .unwrap_or(self.depth);
        TreeSnapshot {
            total_agents: descendants.len() + 1,
            max_depth,
            root: self.snapshot_node(),
        }
    }

    /// Deterministic ASCII rendering of this agent's subtree.
    ///
    /// ```text
    /// root (coordinator) [running]
    /// ├── agt-1 (researcher) [completed]
    /// │   └── agt-3 (reader) [completed]
    /// └── agt-2 (writer) [idle]
    /// ```
    pub fn render_tree(self: &Arc<Self>) -> String {
        let mut out = format!("{} ({}) [{}]\n", self.id, self.purpose, self.state());
        let children = self.get_children();
        for (idx, child) in children.iter().enumerate() {
            child.render_into(&mut out, "", idx == children.len() - 1);
        }
        out
    }

    fn render_into(&self, out: &mut String, prefix: &str, is_last: bool) {
        let connector = if is_last { "└── " } else { "├── " };
        out.push_str(&format!(
            "{}{}{} ({}) [{}]\n",
            prefix,
            connector,
            self.id,
            self.purpose,
            self.state()
        ));
        let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
        let children = self.get_children();
        for (idx, child) in children.iter().enumerate() {
            child.render_into(out, &child_prefix, idx == children.len() - 1);
        }
    }

    // ---- Conversation loop ----

    /// Run one prompt through the stream/tool loop; returns the final
    /// assistant turn.
    pub async fn prompt(self: &Arc<Self>, text: &str) -> Result<Turn, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Aborted);
        }
        self.set_state(AgentState::Running);
        self.history.lock().unwrap().push(Turn::user(text));
        self.ctx
            .events
            .emit(AgentEvent::TurnStart {
                agent_id: self.id.clone(),
            })
            .await;

        let tool_ctx = ToolContext::new(self.session_id.clone(), self.id.clone())
            .with_cancel(self.cancel.clone());
        let mut total_usage = StreamUsage::default();
        let mut rounds = 0usize;

        let final_turn = loop {
            if rounds >= self.ctx.config.max_turns {
                self.set_state(AgentState::Error);
                return Err(AgentError::MaxTurnsExceeded(rounds));
            }
            rounds += 1;

            let provider = {
                let registry = self.ctx.providers.read().unwrap();
                registry.get(&self.provider_id)
            }
            .ok_or_else(|| {
                self.set_state(AgentState::Error);
                AgentError::ProviderMissing(self.provider_id.clone())
            })?;

            let tools = {
                let registry = self.ctx.executor.registry();
                let specs = registry.read().await.specs();
                specs
            };
            let request = ChatRequest {
                model: self.model_id.clone(),
                system_prompt: self.system_prompt.clone(),
                turns: self.history(),
                tools,
                max_tokens: None,
            };

            let mut stream = provider
                .stream(&request, self.cancel.clone())
                .await
                .map_err(|e| {
                    self.set_state(AgentState::Error);
                    AgentError::Provider(e)
                })?;

            let mut text_acc = String::new();
            let mut thinking_acc = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut terminal: Option<(StopReason, StreamUsage)> = None;

            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Start { message_id } => {
                        self.ctx
                            .events
                            .emit(AgentEvent::StreamStart {
                                agent_id: self.id.clone(),
                                message_id,
                            })
                            .await;
                    }
                    StreamEvent::Text { chunk } => {
                        text_acc.push_str(&chunk);
                        self.ctx
                            .events
                            .emit(AgentEvent::StreamText {
                                agent_id: self.id.clone(),
                                chunk,
                            })
                            .await;
                    }
                    StreamEvent::Thinking { chunk } => {
                        thinking_acc.push_str(&chunk);
                        self.ctx
                            .events
                            .emit(AgentEvent::StreamThinking {
                                agent_id: self.id.clone(),
                                chunk,
                            })
                            .await;
                    }
                    StreamEvent::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        self.ctx
                            .events
                            .emit(AgentEvent::StreamToolCall {
                                agent_id: self.id.clone(),
                                call_id: id.clone(),
                                tool_name: name.clone(),
                                arguments: arguments.clone(),
                            })
                            .await;
                        tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments,
                        });
                    }
                    StreamEvent::Done { stop_reason, usage } => {
                        self.ctx
                            .events
                            .emit(AgentEvent::StreamDone {
                                agent_id: self.id.clone(),
                                stop_reason,
                                usage: usage.clone(),
                            })
                            .await;
                        terminal = Some((stop_reason, usage));
                        break;
                    }
                    StreamEvent::Error { error } => {
                        self.set_state(AgentState::Error);
                        return Err(AgentError::Provider(error));
                    }
                }
            }

            let (stop_reason, usage) = terminal.ok_or_else(|| {
                self.set_state(AgentState::Error);
                AgentError::Protocol("stream ended without a terminal event".to_string())
            })?;

            total_usage.add(&usage);
            if usage.total() > 0 {
                if let Some(model) = self.ctx.catalog.get(&self.model_id) {
                    let cost = calculate_cost(&usage, model);
                    self.ctx.cost.record(&self.model_id, &usage, &cost);
                }
            }
            self.ctx.kaala.heartbeat(&self.id);

            // Assemble the assistant turn from the accumulated deltas.
            let mut parts: Vec<ContentPart> = Vec::new();
            if !text_acc.is_empty() {
                parts.push(ContentPart::Text { text: text_acc });
            }
            for call in &tool_calls {
                parts.push(ContentPart::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
            }
            let assistant_turn = Turn {
                role: crate::chitragupta::provider::Role::Assistant,
                parts,
            };
            self.history.lock().unwrap().push(assistant_turn.clone());

            match stop_reason {
                StopReason::ToolUse => {
                    let mut results = Vec::with_capacity(tool_calls.len());
                    for call in tool_calls {
                        if self.cancel.is_cancelled() {
                            self.set_state(AgentState::Aborted);
                            return Err(AgentError::Aborted);
                        }
                        let outcome = self
                            .ctx
                            .executor
                            .execute(&call.name, call.arguments, &tool_ctx)
                            .await;
                        results.push((call.id, outcome.content, outcome.is_error));
                    }
                    self.history.lock().unwrap().push(Turn::tool_results(results));
                    continue;
                }
                StopReason::Aborted => {
                    self.set_state(AgentState::Aborted);
                    return Err(AgentError::Aborted);
                }
                StopReason::EndTurn | StopReason::MaxTokens => break assistant_turn,
            }
        };

        self.set_state(AgentState::Completed);
        self.ctx
            .events
            .emit(AgentEvent::TurnDone {
                agent_id: self.id.clone(),
                turns: rounds,
                usage: total_usage,
            })
            .await;
        Ok(final_turn)
    }

    /// Spawn a child, run one prompt on it, and return the response text.
    pub async fn delegate(
        self: &Arc<Self>,
        config: AgentConfig,
        text: &str,
    ) -> Result<String, AgentError> {
        let child = self.spawn(config)?;
        let turn = child.prompt(text).await?;
        Ok(turn.text())
    }

    /// Spawn one child per task and run their prompts concurrently.
    ///
    /// Spawn failures surface in the corresponding result slot; successful
    /// spawns run to completion even if a sibling fails.
    pub async fn delegate_parallel(
        self: &Arc<Self>,
        tasks: Vec<(AgentConfig, String)>,
    ) -> Vec<Result<String, AgentError>> {
        let mut spawned: Vec<Result<(Arc<Agent>, String), AgentError>> = Vec::new();
        for (config, text) in tasks {
            spawned.push(self.spawn(config).map(|child| (child, text)));
        }

        let mut results: Vec<Result<String, AgentError>> = Vec::with_capacity(spawned.len());
        let mut futures = Vec::new();
        for entry in spawned {
            match entry {
                Ok((child, text)) => {
                    futures.push(Some(async move {
                        child.prompt(&text).await.map(|turn| turn.text())
                    }));
                    results.push(Ok(String::new()));
                }
                Err(err) => {
                    futures.push(None);
                    results.push(Err(err));
                }
            }
        }

        let running: Vec<_> = futures.into_iter().flatten().collect();
        let mut outcomes = futures_util::future::join_all(running).await.into_iter();
        for slot in results.iter_mut() {
            if slot.is_ok() {
                if let Some(outcome) = outcomes.next() {
                    *slot = outcome;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chitragupta::clock::ManualClock;
    use crate::chitragupta::tool::{AllowAllPolicy, ToolRegistry};
    use tokio::sync::RwLock as TokioRwLock;

    fn test_context() -> TreeContext {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let learning = Arc::new(Mutex::new(LearningLoop::default()));
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(TokioRwLock::new(ToolRegistry::new())),
            Arc::new(AllowAllPolicy),
            Arc::clone(&learning),
            Arc::clone(&clock),
            EventBus::new(),
        ));
        TreeContext {
            providers: Arc::new(RwLock::new(ProviderRegistry::new())),
            executor,
            samiti: Arc::new(Samiti::new(Arc::clone(&clock))),
            learning,
            kaala: Arc::new(KaalaBrahma::new(Arc::clone(&clock), 30_000, 120_000)),
            events: EventBus::new(),
            clock,
            cost: Arc::new(CostTracker::new()),
            catalog: Arc::new(ModelCatalog::new()),
            config: ChitraguptaConfig::default(),
        }
    }

    #[test]
    fn test_depth_invariant() {
        let root = Agent::root(AgentConfig::new("coordinator"), "s1", test_context());
        let child = root.spawn(AgentConfig::new("worker")).unwrap();
        let grandchild = child.spawn(AgentConfig::new("leaf")).unwrap();
        assert_eq!(root.depth(), 0);
        assert_eq!(child.depth(), root.depth() + 1);
        assert_eq!(grandchild.depth(), child.depth() + 1);
    }

    #[test]
    fn test_traversal_helpers() {
        let root = Agent::root(
            AgentConfig::new("coordinator").with_id("root"),
            "s1",
            test_context(),
        );
        let a = root.spawn(AgentConfig::new("a").with_id("a")).unwrap();
        let b = a.spawn(AgentConfig::new("b").with_id("b")).unwrap();
        let c = root.spawn(AgentConfig::new("c").with_id("c")).unwrap();

        assert_eq!(b.get_root().id(), "root");
        assert_eq!(b.get_lineage(), vec!["root", "a", "b"]);
        assert_eq!(root.get_descendants().len(), 3);
        assert_eq!(a.get_siblings().len(), 1);
        assert_eq!(a.get_siblings()[0].id(), "c");
        assert!(b.is_descendant_of(&root));
        assert!(root.is_ancestor_of(&b));
        assert!(!c.is_descendant_of(&a));
        assert_eq!(root.find_agent("b").unwrap().id(), "b");
        assert!(root.find_agent("missing").is_none());
    }

    #[test]
    fn test_render_tree_deterministic() {
        let root = Agent::root(
            AgentConfig::new("coordinator").with_id("root"),
            "s1",
            test_context(),
        );
        root.spawn(AgentConfig::new("researcher").with_id("r1")).unwrap();
        let w = root.spawn(AgentConfig::new("writer").with_id("w1")).unwrap();
        w.spawn(AgentConfig::new("editor").with_id("e1")).unwrap();

        let rendered = root.render_tree();
        let expected = "root (coordinator) [idle]\n\
                        ├── r1 (researcher) [idle]\n\
                        └── w1 (writer) [idle]\n\
                        \u{20}   └── e1 (editor) [idle]\n";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_tree_snapshot_serializes() {
        let root = Agent::root(
            AgentConfig::new("coordinator").with_id("root"),
            "s1",
            test_context(),
        );
        root.spawn(AgentConfig::new("worker").with_id("w")).unwrap();
        let snapshot = root.get_tree();
        assert_eq!(snapshot.total_agents, 2);
        assert_eq!(snapshot.max_depth, 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: TreeSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.root.children.len(), 1);
        assert_eq!(back.root.children[0].id, "w");
    }
}
