//! Niyanta — slot-based multi-agent orchestration.
//!
//! The orchestrator owns a pool of [`AgentSlot`]s, each wrapping a worker
//! (typically a sub-agent) with a capability set and load counters. Tasks
//! are assigned by the currently selected [`Strategy`]:
//!
//! - **RoundRobin** — tasks rotate through the pool.
//! - **LeastLoaded** — the slot with the smallest queued+running count wins.
//! - **Specialized** — Jaccard similarity between the task's required
//!   capabilities and each slot's capability set; highest wins.
//! - **Hierarchical** — the task is decomposed and subtasks distributed
//!   recursively.
//! - **Competitive** — N slots race; the first success wins and the
//!   siblings are cancelled.
//! - **Swarm** — N slots run with shared context and a merger combines the
//!   sub-results.
//!
//! Failures consume the per-task retry budget before surfacing as
//! [`OrchestratorError`]. Strategy *selection* is not this module's job —
//! the autonomous layer drives [`set_strategy`](Orchestrator::set_strategy)
//! from its bandit.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::provider::CancellationToken;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A unit of work handed to the pool.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorTask {
    pub description: String,
    pub required_capabilities: Vec<String>,
    pub priority: u8,
    /// Descriptions of tasks that must complete first (plan execution).
    pub dependencies: Vec<String>,
}

impl OrchestratorTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Orchestration failures.
#[derive(Debug)]
pub enum OrchestratorError {
    /// The pool has no slots.
    NoSlots,
    /// Every attempt within the retry budget failed.
    RetriesExhausted { task: String, attempts: u32 },
    /// A plan referenced an unknown dependency or cycles.
    InvalidPlan(String),
    /// A runtime failure outside the retry loop.
    ExecutionFailed(String),
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::NoSlots => write!(f, "No agent slots in pool"),
            OrchestratorError::RetriesExhausted { task, attempts } => {
                write!(f, "Task failed after {} attempts: {}", attempts, task)
            }
            OrchestratorError::InvalidPlan(msg) => write!(f, "Invalid plan: {}", msg),
            OrchestratorError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            OrchestratorError::Cancelled => write!(f, "Orchestration cancelled"),
        }
    }
}

impl Error for OrchestratorError {}

/// Worker bound to one slot. Implementations typically delegate to a
/// sub-agent's prompt loop.
#[async_trait]
pub trait SlotWorker: Send + Sync {
    async fn run(
        &self,
        task: &OrchestratorTask,
        cancel: CancellationToken,
    ) -> Result<String, String>;
}

/// One pool slot: worker, capabilities, and load counters.
pub struct AgentSlot {
    pub id: String,
    pub capabilities: HashSet<String>,
    worker: Arc<dyn SlotWorker>,
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl AgentSlot {
    pub fn new(
        id: impl Into<String>,
        capabilities: Vec<String>,
        worker: Arc<dyn SlotWorker>,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            worker,
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.running.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        task: &OrchestratorTask,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        let result = self.worker.run(task, cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(_) => self.completed.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        result
    }
}

/// Execution strategies. Names are stable — the bandit keys on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    Specialized,
    Hierarchical,
    Competitive { racers: usize },
    Swarm { workers: usize },
}

impl Strategy {
    /// Stable name used by the strategy bandit and persistence.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastLoaded => "least-loaded",
            Strategy::Specialized => "specialized",
            Strategy::Hierarchical => "hierarchical",
            Strategy::Competitive { .. } => "competitive",
            Strategy::Swarm { .. } => "swarm",
        }
    }

    /// Construct the default parameterization from a stable name.
    pub fn from_name(name: &str) -> Option<Strategy> {
        match name {
            "round-robin" => Some(Strategy::RoundRobin),
            "least-loaded" => Some(Strategy::LeastLoaded),
            "specialized" => Some(Strategy::Specialized),
            "hierarchical" => Some(Strategy::Hierarchical),
            "competitive" => Some(Strategy::Competitive { racers: 2 }),
            "swarm" => Some(Strategy::Swarm { workers: 3 }),
            _ => None,
        }
    }

    /// Every stable strategy name, in canonical order.
    pub fn all_names() -> [&'static str; 6] {
        [
            "round-robin",
            "least-loaded",
            "specialized",
            "hierarchical",
            "competitive",
            "swarm",
        ]
    }
}

/// Caller-supplied reducer for swarm sub-results.
pub type SwarmMerger = Arc<dyn Fn(Vec<String>) -> String + Send + Sync>;

/// Notifications emitted during execution.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    TaskStarted { task: String, strategy: &'static str },
    TaskCompleted { task: String, slot_id: String, duration_ms: u64 },
    TaskFailed { task: String, attempt: u32, error: String },
}

pub type OrchestratorCallback = Arc<dyn Fn(&OrchestratorEvent) + Send + Sync>;

/// Retry budget applied per task.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub max_retries: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

/// Result of a successful task execution.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub output: String,
    pub slot_id: String,
    pub strategy: &'static str,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub slots: Vec<SlotStats>,
    pub total_completed: usize,
    pub total_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStats {
    pub id: String,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The slot-pool orchestrator.
pub struct Orchestrator {
    slots: Vec<Arc<AgentSlot>>,
    strategy: Mutex<Strategy>,
    fallback: FallbackConfig,
    merger: Option<SwarmMerger>,
    callback: Option<OrchestratorCallback>,
    clock: Arc<dyn Clock>,
    rr_index: AtomicUsize,
}

impl Orchestrator {
    pub fn new(slots: Vec<AgentSlot>, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: slots.into_iter().map(Arc::new).collect(),
            strategy: Mutex::new(Strategy::RoundRobin),
            fallback: FallbackConfig::default(),
            merger: None,
            callback: None,
            clock,
            rr_index: AtomicUsize::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_swarm_merger(mut self, merger: SwarmMerger) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn with_callback(mut self, callback: OrchestratorCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock().unwrap() = strategy;
    }

    pub fn current_strategy(&self) -> Strategy {
        self.strategy.lock().unwrap().clone()
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }

    /// Ids of slots currently running work.
    pub fn get_active_agents(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.running.load(Ordering::SeqCst) > 0)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let slots: Vec<SlotStats> = self
            .slots
            .iter()
            .map(|s| SlotStats {
                id: s.id.clone(),
                queued: s.queued.load(Ordering::SeqCst),
                running: s.running.load(Ordering::SeqCst),
                completed: s.completed.load(Ordering::SeqCst),
                failed: s.failed.load(Ordering::SeqCst),
            })
            .collect();
        OrchestratorStats {
            total_completed: slots.iter().map(|s| s.completed).sum(),
            total_failed: slots.iter().map(|s| s.failed).sum(),
            slots,
        }
    }

    // ---- Slot selection ----

    fn pick_round_robin(&self) -> Arc<AgentSlot> {
        let idx = self.rr_index.fetch_add(1, Ordering::SeqCst) % self.slots.len();
        Arc::clone(&self.slots[idx])
    }

    fn pick_least_loaded(&self) -> Arc<AgentSlot> {
        let slot = self
            .slots
            .iter()
            .min_by_key(|s| s.load())
            .expect("pool is non-empty");
        Arc::clone(slot)
    }

    fn pick_specialized(&self, task: &OrchestratorTask) -> Arc<AgentSlot> {
        let wanted: HashSet<&String> = task.required_capabilities.iter().collect();
        let slot = self
            .slots
            .iter()
            .max_by(|a, b| {
                let sa = jaccard(&wanted, &a.capabilities);
                let sb = jaccard(&wanted, &b.capabilities);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("pool is non-empty");
        Arc::clone(slot)
    }

    // ---- Execution ----

    /// Execute one task under the current strategy, consuming the retry
    /// budget on failure.
    pub async fn execute(&self, task: &OrchestratorTask) -> Result<TaskOutcome, OrchestratorError> {
        if self.slots.is_empty() {
            return Err(OrchestratorError::NoSlots);
        }
        let strategy = self.current_strategy();
        self.emit(OrchestratorEvent::TaskStarted {
            task: task.description.clone(),
            strategy: strategy.name(),
        });

        let started = self.clock.now_ms();
        let max_attempts = self.fallback.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = self.execute_once(&strategy, task).await;
            match result {
                Ok((output, slot_id)) => {
                    let duration_ms = self.clock.now_ms().saturating_sub(started);
                    self.emit(OrchestratorEvent::TaskCompleted {
                        task: task.description.clone(),
                        slot_id: slot_id.clone(),
                        duration_ms,
                    });
                    return Ok(TaskOutcome {
                        output,
                        slot_id,
                        strategy: strategy.name(),
                        attempts: attempt,
                        duration_ms,
                    });
                }
                Err(error) => {
                    self.emit(OrchestratorEvent::TaskFailed {
                        task: task.description.clone(),
                        attempt,
                        error: error.clone(),
                    });
                    log::warn!(
                        "orchestrator: attempt {}/{} failed for '{}': {}",
                        attempt,
                        max_attempts,
                        task.description,
                        error
                    );
                    last_error = error;
                }
            }
        }

        Err(OrchestratorError::RetriesExhausted {
            task: format!("{} ({})", task.description, last_error),
            attempts: max_attempts,
        })
    }

    async fn execute_once(
        &self,
        strategy: &Strategy,
        task: &OrchestratorTask,
    ) -> Result<(String, String), String> {
        match strategy {
            Strategy::RoundRobin => {
                let slot = self.pick_round_robin();
                let output = slot.execute(task, CancellationToken::new()).await?;
                Ok((output, slot.id.clone()))
            }
            Strategy::LeastLoaded => {
                let slot = self.pick_least_loaded();
                let output = slot.execute(task, CancellationToken::new()).await?;
                Ok((output, slot.id.clone()))
            }
            Strategy::Specialized => {
                let slot = self.pick_specialized(task);
                let output = slot.execute(task, CancellationToken::new()).await?;
                Ok((output, slot.id.clone()))
            }
            Strategy::Hierarchical => self.execute_hierarchical(task).await,
            Strategy::Competitive { racers } => self.execute_competitive(task, *racers).await,
            Strategy::Swarm { workers } => self.execute_swarm(task, *workers).await,
        }
    }

    /// Decompose the task and distribute the subtasks, least-loaded.
    async fn execute_hierarchical(
        &self,
        task: &OrchestratorTask,
    ) -> Result<(String, String), String> {
        let subtasks = decompose(&task.description);
        if subtasks.len() <= 1 {
            let slot = self.pick_least_loaded();
            let output = slot.execute(task, CancellationToken::new()).await?;
            return Ok((output, slot.id.clone()));
        }

        let mut futures = Vec::new();
        for subtask in &subtasks {
            let slot = self.pick_least_loaded();
            let sub = OrchestratorTask {
                description: subtask.clone(),
                required_capabilities: task.required_capabilities.clone(),
                priority: task.priority,
                dependencies: Vec::new(),
            };
            futures.push(async move { slot.execute(&sub, CancellationToken::new()).await });
        }
        let results = futures_util::future::join_all(futures).await;
        let mut parts = Vec::with_capacity(results.len());
        for result in results {
            parts.push(result?);
        }
        Ok((parts.join("\n"), "hierarchy".to_string()))
    }

    /// Race `racers` slots; first success wins and cancels the siblings.
    async fn execute_competitive(
        &self,
        task: &OrchestratorTask,
        racers: usize,
    ) -> Result<(String, String), String> {
        let racers = racers.clamp(1, self.slots.len());
        let cancel = CancellationToken::new();
        let mut racing = FuturesUnordered::new();
        for slot in self.slots.iter().take(racers) {
            let slot = Arc::clone(slot);
            let cancel = cancel.clone();
            let task = task.clone();
            racing.push(async move {
                let result = slot.execute(&task, cancel).await;
                (slot.id.clone(), result)
            });
        }

        let mut last_error = "no racers".to_string();
        while let Some((slot_id, result)) = racing.next().await {
            match result {
                Ok(output) => {
                    // Winner takes it; losers observe the token.
                    cancel.cancel();
                    return Ok((output, slot_id));
                }
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    /// Run `workers` slots over the same task and merge the sub-results.
    async fn execute_swarm(
        &self,
        task: &OrchestratorTask,
        workers: usize,
    ) -> Result<(String, String), String> {
        let workers = workers.clamp(1, self.slots.len());
        let mut futures = Vec::new();
        for slot in self.slots.iter().take(workers) {
            let slot = Arc::clone(slot);
            let task = task.clone();
            futures.push(async move { slot.execute(&task, CancellationToken::new()).await });
        }
        let results = futures_util::future::join_all(futures).await;
        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            outputs.push(result?);
        }
        let merged = match &self.merger {
            Some(merger) => merger(outputs),
            None => outputs.join("\n\n"),
        };
        Ok((merged, "swarm".to_string()))
    }

    /// Execute a dependency-ordered plan. `inputs` values substitute
    /// `{key}` placeholders in task descriptions. Returns outputs in task
    /// order.
    pub async fn execute_plan(
        &self,
        plan: Vec<OrchestratorTask>,
        inputs: &HashMap<String, String>,
    ) -> Result<Vec<TaskOutcome>, OrchestratorError> {
        // Validate dependencies before running anything.
        let descriptions: HashSet<&str> = plan.iter().map(|t| t.description.as_str()).collect();
        for task in &plan {
            for dep in &task.dependencies {
                if !descriptions.contains(dep.as_str()) {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "unknown dependency '{}' of '{}'",
                        dep, task.description
                    )));
                }
            }
        }

        let mut done: HashSet<String> = HashSet::new();
        let mut pending: Vec<OrchestratorTask> = plan;
        let mut outcomes = Vec::new();

        while !pending.is_empty() {
            let ready_idx = pending
                .iter()
                .position(|t| t.dependencies.iter().all(|d| done.contains(d)))
                .ok_or_else(|| {
                    OrchestratorError::InvalidPlan("dependency cycle detected".to_string())
                })?;
            let mut task = pending.remove(ready_idx);
            for (key, value) in inputs {
                task.description = task
                    .description
                    .replace(&format!("{{{}}}", key), value);
            }
            let outcome = self.execute(&task).await?;
            done.insert(task.description.clone());
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn jaccard(wanted: &HashSet<&String>, have: &HashSet<String>) -> f64 {
    if wanted.is_empty() && have.is_empty() {
        return 0.0;
    }
    let intersection = wanted.iter().filter(|w| have.contains(**w)).count();
    let union = wanted.len() + have.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Split a composite description into subtasks: bullet lines, numbered
/// items, or top-level " and " conjunctions.
fn decompose(description: &str) -> Vec<String> {
    let bullets: Vec<String> = description
        .lines()
        .map(|l| l.trim())
        .filter(|l| l.starts_with("- ") || l.starts_with("* "))
        .map(|l| l[2..].trim().to_string())
        .collect();
    if bullets.len() > 1 {
        return bullets;
    }
    let clauses: Vec<String> = description
        .split(" and then ")
        .flat_map(|part| part.split("; "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if clauses.len() > 1 {
        clauses
    } else {
        vec![description.trim().to_string()]
    }
}
