//! Autonomous orchestration: bandit-driven strategy selection with reward
//! shaping, strategy banning, and persisted learning.
//!
//! Wraps an [`Orchestrator`] and a [`StrategyBandit`]. Each task gets a
//! complexity estimate, a strategy pick (banned strategies excluded), and —
//! after execution — a composite reward
//! `0.5·success + 0.3·max(0, 1 − time/expected) + 0.2·max(0, 1 − cost/budget)`
//! fed back into the bandit. Strategies whose recent failure rate crosses
//! the threshold are banned for a cooldown; when everything is banned the
//! engine falls back to round-robin. Learned state auto-saves through the
//! [`Database`] contract every N tasks.

use crate::chitragupta::bandit::{BanditMode, StrategyBandit, StrategyContext};
use crate::chitragupta::clock::Clock;
use crate::chitragupta::db::{Database, SqlParam};
use crate::chitragupta::orchestrator::{
    Orchestrator, OrchestratorError, OrchestratorTask, Strategy, TaskOutcome,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Reward weights and banning thresholds.
#[derive(Debug, Clone)]
pub struct AutonomousConfig {
    pub weight_success: f64,
    pub weight_time: f64,
    pub weight_cost: f64,
    /// Minimum recent tasks before a strategy can be banned.
    pub ban_min_tasks: usize,
    /// Failure rate above which the ban triggers.
    pub ban_failure_threshold: f64,
    pub ban_duration_ms: u64,
    /// Auto-save the bandit every this many tasks (0 disables).
    pub autosave_every: usize,
}

impl Default for AutonomousConfig {
    fn default() -> Self {
        Self {
            weight_success: 0.5,
            weight_time: 0.3,
            weight_cost: 0.2,
            ban_min_tasks: 10,
            ban_failure_threshold: 0.5,
            ban_duration_ms: 5 * 60 * 1000,
            autosave_every: 20,
        }
    }
}

/// Caller-supplied expectations for reward shaping. Defaults derive the
/// expected duration from the complexity estimate and skip the cost term.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskBudget {
    pub expected_duration_ms: Option<u64>,
    pub cost_budget_usd: Option<f64>,
    pub actual_cost_usd: f64,
}

const BANDIT_STATE_KEY: &str = "strategy-bandit";
const RECENT_WINDOW: usize = 50;

/// Keyword weights blended into the complexity estimate.
const COMPLEXITY_KEYWORDS: [(&str, f64); 8] = [
    ("rewrite", 0.9),
    ("migrate", 0.85),
    ("refactor", 0.8),
    ("redesign", 0.8),
    ("implement", 0.6),
    ("test", 0.5),
    ("fix", 0.4),
    ("document", 0.3),
];

/// Estimate task complexity in `[0, 1]` from description length,
/// dependency count, priority, and keyword heuristics.
pub fn estimate_complexity(task: &OrchestratorTask) -> f64 {
    let len_score = (task.description.len() as f64 / 400.0).min(1.0);
    let dep_score = (task.dependencies.len() as f64 / 4.0).min(1.0);
    let priority_score = (task.priority as f64 / 10.0).min(1.0);
    let lower = task.description.to_lowercase();
    let keyword_score = COMPLEXITY_KEYWORDS
        .iter()
        .filter(|(kw, _)| lower.contains(kw))
        .map(|(_, w)| *w)
        .fold(0.3f64, f64::max);
    (0.3 * len_score + 0.2 * dep_score + 0.1 * priority_score + 0.4 * keyword_score)
        .clamp(0.0, 1.0)
}

/// The autonomous layer.
pub struct AutonomousOrchestrator {
    orchestrator: Arc<Orchestrator>,
    bandit: Mutex<StrategyBandit>,
    config: AutonomousConfig,
    clock: Arc<dyn Clock>,
    db: Option<Arc<dyn Database>>,
    /// Recent success/failure window per strategy.
    recent: Mutex<HashMap<String, VecDeque<bool>>>,
    /// Strategy → banned-until timestamp.
    bans: Mutex<HashMap<String, u64>>,
    tasks_since_save: AtomicUsize,
}

impl AutonomousOrchestrator {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        mode: BanditMode,
        config: AutonomousConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let names = Strategy::all_names();
        Self {
            orchestrator,
            bandit: Mutex::new(StrategyBandit::new(&names, mode)),
            config,
            clock,
            db: None,
            recent: Mutex::new(HashMap::new()),
            bans: Mutex::new(HashMap::new()),
            tasks_since_save: AtomicUsize::new(0),
        }
    }

    /// Attach a database for auto-save; restores prior state when present.
    pub fn with_database(mut self, db: Arc<dyn Database>) -> Self {
        if let Err(err) = db.exec(
            "CREATE TABLE IF NOT EXISTS bandit_state (key TEXT PRIMARY KEY, json TEXT NOT NULL)",
        ) {
            log::warn!("autonomous: could not ensure bandit_state table: {}", err);
        } else if let Ok(Some(row)) = db.get(
            "SELECT json FROM bandit_state WHERE key = ?1",
            &[SqlParam::from(BANDIT_STATE_KEY)],
        ) {
            if let Some(json) = row.get("json").and_then(|v| v.as_str()) {
                match StrategyBandit::deserialize(json) {
                    Ok(restored) => *self.bandit.lock().unwrap() = restored,
                    // Corrupt state: log, start fresh.
                    Err(err) => log::warn!("autonomous: corrupt bandit state, starting fresh: {}", err),
                }
            }
        }
        self.db = Some(db);
        self
    }

    pub fn set_mode(&self, mode: BanditMode) {
        self.bandit.lock().unwrap().set_mode(mode);
    }

    fn strategy_context(&self, task: &OrchestratorTask) -> StrategyContext {
        let stats = self.orchestrator.stats();
        let total = (stats.total_completed + stats.total_failed).max(1);
        let error_rate = stats.total_failed as f64 / total as f64;
        let running: usize = stats.slots.iter().map(|s| s.running + s.queued).sum();
        StrategyContext::new(
            estimate_complexity(task),
            (stats.slots.len() as f64 / 16.0).min(1.0),
            (running as f64 / stats.slots.len().max(1) as f64).min(1.0),
            0.5,
            error_rate,
        )
    }

    /// Strategies currently banned, with expired bans pruned first.
    pub fn banned_strategies(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut bans = self.bans.lock().unwrap();
        bans.retain(|_, until| *until > now);
        let mut names: Vec<String> = bans.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pick the next strategy, excluding banned ones. All banned falls
    /// back to round-robin.
    pub fn select_strategy(&self, task: &OrchestratorTask) -> Strategy {
        let banned = self.banned_strategies();
        let context = self.strategy_context(task);
        let allowed: Vec<String> = Strategy::all_names()
            .iter()
            .map(|s| (*s).to_string())
            .filter(|s| !banned.contains(s))
            .collect();
        if allowed.is_empty() {
            log::warn!("autonomous: every strategy is banned; falling back to round-robin");
            return Strategy::RoundRobin;
        }
        let name = self
            .bandit
            .lock()
            .unwrap()
            .select_among(&allowed, Some(&context));
        Strategy::from_name(&name).unwrap_or(Strategy::RoundRobin)
    }

    /// Execute one task autonomously: select, run, shape reward, learn.
    pub async fn execute(
        &self,
        task: &OrchestratorTask,
    ) -> Result<TaskOutcome, OrchestratorError> {
        self.execute_with_budget(task, TaskBudget::default()).await
    }

    /// Like [`execute`](Self::execute) with explicit time/cost budgets.
    pub async fn execute_with_budget(
        &self,
        task: &OrchestratorTask,
        budget: TaskBudget,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let strategy = self.select_strategy(task);
        let strategy_name = strategy.name();
        self.orchestrator.set_strategy(strategy);
        let context = self.strategy_context(task);
        let complexity = estimate_complexity(task);

        let result = self.orchestrator.execute(task).await;
        let (success, duration_ms) = match &result {
            Ok(outcome) => (true, outcome.duration_ms),
            Err(_) => (false, 0),
        };

        let expected_ms = budget
            .expected_duration_ms
            .unwrap_or_else(|| 5_000 + (complexity * 55_000.0) as u64)
            .max(1);
        let time_term = (1.0 - duration_ms as f64 / expected_ms as f64).max(0.0);
        let cost_term = match budget.cost_budget_usd {
            Some(budget_usd) if budget_usd > 0.0 => {
                (1.0 - budget.actual_cost_usd / budget_usd).max(0.0)
            }
            _ => 1.0,
        };
        let reward = self.config.weight_success * if success { 1.0 } else { 0.0 }
            + self.config.weight_time * time_term
            + self.config.weight_cost * cost_term;

        self.bandit
            .lock()
            .unwrap()
            .record_reward(strategy_name, reward, Some(&context));
        self.note_outcome(strategy_name, success);
        self.maybe_autosave();

        result
    }

    fn note_outcome(&self, strategy: &str, success: bool) {
        let now = self.clock.now_ms();
        let mut recent = self.recent.lock().unwrap();
        let window = recent.entry(strategy.to_string()).or_default();
        window.push_back(success);
        while window.len() > RECENT_WINDOW {
            window.pop_front();
        }

        if window.len() >= self.config.ban_min_tasks {
            let failures = window.iter().filter(|ok| !**ok).count();
            let failure_rate = failures as f64 / window.len() as f64;
            if failure_rate > self.config.ban_failure_threshold {
                let until = now + self.config.ban_duration_ms;
                self.bans
                    .lock()
                    .unwrap()
                    .insert(strategy.to_string(), until);
                window.clear();
                log::warn!(
                    "autonomous: banned strategy '{}' (failure rate {:.2}) until {}",
                    strategy,
                    failure_rate,
                    until
                );
            }
        }
    }

    fn maybe_autosave(&self) {
        if self.config.autosave_every == 0 {
            return;
        }
        let count = self.tasks_since_save.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.autosave_every {
            self.tasks_since_save.store(0, Ordering::SeqCst);
            self.save_state();
        }
    }

    /// Persist the bandit immediately.
    pub fn save_state(&self) {
        if let Some(db) = &self.db {
            let json = self.bandit.lock().unwrap().serialize();
            if let Err(err) = db.run(
                "INSERT INTO bandit_state (key, json) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET json = excluded.json",
                &[SqlParam::from(BANDIT_STATE_KEY), SqlParam::from(json)],
            ) {
                log::warn!("autonomous: bandit auto-save failed: {}", err);
            }
        }
    }

    /// Snapshot of the learned strategy statistics.
    pub fn get_stats(&self) -> Vec<crate::chitragupta::bandit::StrategyStats> {
        self.bandit.lock().unwrap().get_stats()
    }
}
