//! Online selection of orchestration strategies.
//!
//! [`StrategyBandit`] learns which orchestration strategy pays off, with
//! three interchangeable modes:
//!
//! - **UCB1** — `μ + √(2·ln N / n)`, unplayed arms score infinity.
//! - **Thompson** — per-arm Beta(α, β) posterior sampling; rewards update
//!   `α += r`, `β += 1 − r`.
//! - **LinUCB** — contextual selection over the six-feature vector
//!   `[bias, task_complexity, agent_count, memory_pressure, avg_latency,
//!   error_rate]`, sharing the numerically-stable Cholesky solves with the
//!   routing bandit.
//!
//! All learned state — counts, posteriors, and LinUCB matrices — survives a
//! [`serialize`](StrategyBandit::serialize)/[`deserialize`](StrategyBandit::deserialize)
//! round trip, and the mode can be switched at runtime without losing any
//! of it.

use crate::chitragupta::turiya::LinUcb;
use serde::{Deserialize, Serialize};

/// Feature dimension of the strategy context (bias included).
pub const STRATEGY_CONTEXT_DIM: usize = 6;

/// Normalized execution context for contextual selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyContext {
    pub task_complexity: f64,
    pub agent_count: f64,
    pub memory_pressure: f64,
    pub avg_latency: f64,
    pub error_rate: f64,
}

impl StrategyContext {
    pub fn new(
        task_complexity: f64,
        agent_count: f64,
        memory_pressure: f64,
        avg_latency: f64,
        error_rate: f64,
    ) -> Self {
        Self {
            task_complexity: task_complexity.clamp(0.0, 1.0),
            agent_count: agent_count.clamp(0.0, 1.0),
            memory_pressure: memory_pressure.clamp(0.0, 1.0),
            avg_latency: avg_latency.clamp(0.0, 1.0),
            error_rate: error_rate.clamp(0.0, 1.0),
        }
    }

    /// Feature vector with the leading bias term.
    pub fn to_features(&self) -> [f64; STRATEGY_CONTEXT_DIM] {
        [
            1.0,
            self.task_complexity,
            self.agent_count,
            self.memory_pressure,
            self.avg_latency,
            self.error_rate,
        ]
    }
}

impl Default for StrategyContext {
    fn default() -> Self {
        Self::new(0.5, 0.5, 0.5, 0.5, 0.0)
    }
}

/// Selection mode, switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BanditMode {
    Ucb1,
    Thompson,
    LinUcb,
}

/// Per-arm learned state shared by all modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmState {
    pub name: String,
    pub pulls: u64,
    pub total_reward: f64,
    /// Thompson posterior.
    pub alpha: f64,
    pub beta: f64,
}

impl ArmState {
    fn new(name: String) -> Self {
        Self {
            name,
            pulls: 0,
            total_reward: 0.0,
            alpha: 1.0,
            beta: 1.0,
        }
    }

    pub fn average_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.total_reward / self.pulls as f64
        }
    }
}

/// Snapshot row from [`StrategyBandit::get_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStats {
    pub name: String,
    pub pulls: u64,
    pub average_reward: f64,
}

/// Standard normal sample via Box–Muller.
fn gaussian() -> f64 {
    let u1: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rand::random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Beta(α, β) sample by moment-matched normal approximation, clamped to
/// `[0, 1]`. Adequate for Thompson selection where only the argmax of the
/// samples matters.
fn sample_beta(alpha: f64, beta: f64) -> f64 {
    let total = alpha + beta;
    let mean = alpha / total;
    let variance = (alpha * beta) / (total * total * (total + 1.0));
    (mean + gaussian() * variance.sqrt()).clamp(0.0, 1.0)
}

/// The strategy bandit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyBandit {
    mode: BanditMode,
    arms: Vec<ArmState>,
    total_pulls: u64,
    linucb: LinUcb,
}

impl StrategyBandit {
    pub fn new(strategy_names: &[&str], mode: BanditMode) -> Self {
        Self {
            mode,
            arms: strategy_names
                .iter()
                .map(|name| ArmState::new((*name).to_string()))
                .collect(),
            total_pulls: 0,
            linucb: LinUcb::new(strategy_names.len(), STRATEGY_CONTEXT_DIM, 1.0),
        }
    }

    pub fn mode(&self) -> BanditMode {
        self.mode
    }

    /// Switch selection modes without discarding learned state.
    pub fn set_mode(&mut self, mode: BanditMode) {
        self.mode = mode;
    }

    pub fn arm_names(&self) -> Vec<String> {
        self.arms.iter().map(|a| a.name.clone()).collect()
    }

    fn index_of(&self, strategy: &str) -> Option<usize> {
        self.arms.iter().position(|a| a.name == strategy)
    }

    /// Pick a strategy name. `context` feeds LinUCB mode; the other modes
    /// ignore it.
    pub fn select_strategy(&self, context: Option<&StrategyContext>) -> String {
        match self.mode {
            BanditMode::Ucb1 => self.select_ucb1(),
            BanditMode::Thompson => self.select_thompson(),
            BanditMode::LinUcb => {
                let ctx = context.copied().unwrap_or_default();
                let arm = self.linucb.select(&ctx.to_features());
                self.arms[arm].name.clone()
            }
        }
    }

    /// Pick among a subset of arm names (used when some strategies are
    /// banned). Falls back to the full pool when the subset is empty.
    pub fn select_among(
        &self,
        allowed: &[String],
        context: Option<&StrategyContext>,
    ) -> String {
        if allowed.is_empty() {
            return self.select_strategy(context);
        }
        match self.mode {
            BanditMode::Ucb1 => self.best_by(allowed, |idx| self.ucb1_score(idx)),
            BanditMode::Thompson => self.best_by(allowed, |idx| {
                sample_beta(self.arms[idx].alpha, self.arms[idx].beta)
            }),
            BanditMode::LinUcb => {
                let ctx = context.copied().unwrap_or_default();
                let features = ctx.to_features();
                self.best_by(allowed, |idx| self.linucb.score(idx, &features))
            }
        }
    }

    fn best_by<F: Fn(usize) -> f64>(&self, allowed: &[String], score: F) -> String {
        let mut best: Option<(f64, usize)> = None;
        for (idx, arm) in self.arms.iter().enumerate() {
            if !allowed.contains(&arm.name) {
                continue;
            }
            let s = score(idx);
            if best.map_or(true, |(bs, _)| s > bs) {
                best = Some((s, idx));
            }
        }
        match best {
            Some((_, idx)) => self.arms[idx].name.clone(),
            None => self.arms[0].name.clone(),
        }
    }

    fn ucb1_score(&self, idx: usize) -> f64 {
        let arm = &self.arms[idx];
        if arm.pulls == 0 {
            return f64::INFINITY;
        }
        let exploration = (2.0 * (self.total_pulls.max(1) as f64).ln() / arm.pulls as f64).sqrt();
        arm.average_reward() + exploration
    }

    fn select_ucb1(&self) -> String {
        let mut best_idx = 0;
        let mut best_score = f64::NEG_INFINITY;
        for idx in 0..self.arms.len() {
            let score = self.ucb1_score(idx);
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        self.arms[best_idx].name.clone()
    }

    fn select_thompson(&self) -> String {
        let mut best_idx = 0;
        let mut best_sample = f64::NEG_INFINITY;
        for (idx, arm) in self.arms.iter().enumerate() {
            let sample = sample_beta(arm.alpha, arm.beta);
            if sample > best_sample {
                best_sample = sample;
                best_idx = idx;
            }
        }
        self.arms[best_idx].name.clone()
    }

    /// Record an observed reward in `[0, 1]` for a strategy. Updates every
    /// mode's state so a later `set_mode` starts warm.
    pub fn record_reward(
        &mut self,
        strategy: &str,
        reward: f64,
        context: Option<&StrategyContext>,
    ) {
        let reward = reward.clamp(0.0, 1.0);
        let idx = match self.index_of(strategy) {
            Some(idx) => idx,
            None => {
                log::warn!("bandit: reward for unknown strategy '{}' dropped", strategy);
                return;
            }
        };
        let arm = &mut self.arms[idx];
        arm.pulls += 1;
        arm.total_reward += reward;
        arm.alpha += reward;
        arm.beta += 1.0 - reward;
        self.total_pulls += 1;

        let ctx = context.copied().unwrap_or_default();
        self.linucb.update(idx, &ctx.to_features(), reward);
    }

    /// Per-arm pull counts and empirical means.
    pub fn get_stats(&self) -> Vec<StrategyStats> {
        self.arms
            .iter()
            .map(|arm| StrategyStats {
                name: arm.name.clone(),
                pulls: arm.pulls,
                average_reward: arm.average_reward(),
            })
            .collect()
    }

    /// Persist everything, LinUCB matrices included.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> [&'static str; 3] {
        ["a", "b", "c"]
    }

    #[test]
    fn test_ucb1_prefers_unplayed_then_best() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::Ucb1);
        // Every arm gets tried before exploitation kicks in.
        let mut first_rounds: Vec<String> = Vec::new();
        for _ in 0..3 {
            let pick = bandit.select_strategy(None);
            bandit.record_reward(&pick, 0.5, None);
            first_rounds.push(pick);
        }
        first_rounds.sort();
        first_rounds.dedup();
        assert_eq!(first_rounds.len(), 3);
    }

    #[test]
    fn test_ucb1_converges_to_best_arm() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::Ucb1);
        for _ in 0..20 {
            bandit.record_reward("a", 0.9, None);
            bandit.record_reward("b", 0.5, None);
            bandit.record_reward("c", 0.2, None);
        }
        let mut wins = 0;
        for _ in 0..100 {
            if bandit.select_strategy(None) == "a" {
                wins += 1;
            }
        }
        assert!(wins > 50, "a won only {}/100 selections", wins);
        let stats = bandit.get_stats();
        let a = stats.iter().find(|s| s.name == "a").unwrap();
        assert!((a.average_reward - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_thompson_updates_only_its_posteriors() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::Thompson);
        bandit.record_reward("a", 0.75, None);
        let a = &bandit.arms[0];
        assert!((a.alpha - 1.75).abs() < 1e-9);
        assert!((a.beta - 1.25).abs() < 1e-9);
        let b = &bandit.arms[1];
        assert!((b.alpha - 1.0).abs() < 1e-9);
        assert!((b.beta - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_thompson_favors_high_reward_arm() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::Thompson);
        for _ in 0..50 {
            bandit.record_reward("a", 1.0, None);
            bandit.record_reward("b", 0.0, None);
            bandit.record_reward("c", 0.0, None);
        }
        let mut wins = 0;
        for _ in 0..100 {
            if bandit.select_strategy(None) == "a" {
                wins += 1;
            }
        }
        assert!(wins > 80, "a won only {}/100 selections", wins);
    }

    #[test]
    fn test_linucb_contextual_selection() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::LinUcb);
        let simple = StrategyContext::new(0.1, 0.2, 0.1, 0.1, 0.0);
        let complex = StrategyContext::new(0.9, 0.9, 0.8, 0.7, 0.3);
        for _ in 0..40 {
            bandit.record_reward("a", 0.9, Some(&simple));
            bandit.record_reward("b", 0.1, Some(&simple));
            bandit.record_reward("a", 0.1, Some(&complex));
            bandit.record_reward("b", 0.9, Some(&complex));
            bandit.record_reward("c", 0.2, Some(&simple));
            bandit.record_reward("c", 0.2, Some(&complex));
        }
        assert_eq!(bandit.select_strategy(Some(&simple)), "a");
        assert_eq!(bandit.select_strategy(Some(&complex)), "b");
    }

    #[test]
    fn test_select_among_respects_subset() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::Ucb1);
        for _ in 0..10 {
            bandit.record_reward("a", 1.0, None);
            bandit.record_reward("b", 0.1, None);
            bandit.record_reward("c", 0.1, None);
        }
        let allowed = vec!["b".to_string(), "c".to_string()];
        let pick = bandit.select_among(&allowed, None);
        assert_ne!(pick, "a");
    }

    #[test]
    fn test_serialize_round_trip_preserves_state() {
        let mut bandit = StrategyBandit::new(&names(), BanditMode::LinUcb);
        let ctx = StrategyContext::default();
        bandit.record_reward("b", 0.8, Some(&ctx));
        bandit.set_mode(BanditMode::Thompson);

        let json = bandit.serialize();
        let restored = StrategyBandit::deserialize(&json).unwrap();
        assert_eq!(restored.mode(), BanditMode::Thompson);
        let stats = restored.get_stats();
        let b = stats.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(b.pulls, 1);
        assert!((b.average_reward - 0.8).abs() < 1e-9);
    }
}
