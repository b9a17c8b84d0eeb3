//! Learning loop: per-tool statistics, next-tool prediction, and sequence
//! mining.
//!
//! Every executed tool call feeds this loop with its outcome and latency.
//! From that it maintains per-tool performance scores, a first-order Markov
//! chain over successive calls within a session, and a window of finished
//! session sequences mined for recurring n-grams and named workflows.
//! The whole state round-trips through serde for persistence.

use crate::chitragupta::ring::RingBuffer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latency horizon for the speed score: at or beyond 30 s a tool scores 0.
const SPEED_HORIZON_MS: f64 = 30_000.0;
/// Weights of the per-tool performance score.
const PERF_W_SUCCESS: f64 = 0.5;
const PERF_W_SPEED: f64 = 0.3;
const PERF_W_SATISFACTION: f64 = 0.2;
/// Weights of the recommendation blend.
const REC_W_MARKOV: f64 = 0.5;
const REC_W_FREQUENCY: f64 = 0.3;
const REC_W_PERFORMANCE: f64 = 0.2;
const MAX_RECOMMENDATIONS: usize = 5;

/// Tuning knobs, clamped into their hard ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Finished sessions retained for mining (ceiling 500).
    pub max_finished_sessions: usize,
    /// Sliding window over the current session's tool calls.
    pub current_window: usize,
    /// EMA smoothing factor for latency.
    pub ema_alpha: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            max_finished_sessions: 500,
            current_window: 20,
            ema_alpha: 0.2,
        }
    }
}

impl LearningConfig {
    fn clamped(mut self) -> Self {
        self.max_finished_sessions = self.max_finished_sessions.clamp(1, 500);
        self.current_window = self.current_window.clamp(1, 100);
        self.ema_alpha = self.ema_alpha.clamp(0.01, 1.0);
        self
    }
}

/// Accumulated statistics for one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolStats {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Exponential moving average of call latency.
    pub avg_latency_ms: f64,
    pub accepted_turns: u64,
    pub feedback_turns: u64,
}

impl ToolStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_calls as f64
        }
    }

    pub fn speed_score(&self) -> f64 {
        (1.0 - self.avg_latency_ms / SPEED_HORIZON_MS).clamp(0.0, 1.0)
    }

    /// Fraction of feedback turns accepted; neutral 0.5 without feedback.
    pub fn user_satisfaction(&self) -> f64 {
        if self.feedback_turns == 0 {
            0.5
        } else {
            self.accepted_turns as f64 / self.feedback_turns as f64
        }
    }

    /// `0.5·success + 0.3·speed + 0.2·satisfaction`.
    pub fn performance_score(&self) -> f64 {
        PERF_W_SUCCESS * self.success_rate()
            + PERF_W_SPEED * self.speed_score()
            + PERF_W_SATISFACTION * self.user_satisfaction()
    }
}

/// A named workflow recognized by subsequence match.
struct WorkflowPattern {
    name: &'static str,
    steps: &'static [&'static str],
}

const WORKFLOW_DICTIONARY: [WorkflowPattern; 7] = [
    WorkflowPattern {
        name: "refactoring",
        steps: &["grep", "read_file", "edit_file", "run_tests"],
    },
    WorkflowPattern {
        name: "debugging",
        steps: &["run_tests", "read_file", "edit_file", "run_tests"],
    },
    WorkflowPattern {
        name: "exploration",
        steps: &["list_files", "read_file", "read_file"],
    },
    WorkflowPattern {
        name: "search-and-replace",
        steps: &["grep", "edit_file"],
    },
    WorkflowPattern {
        name: "file-creation",
        steps: &["write_file", "read_file"],
    },
    WorkflowPattern {
        name: "testing",
        steps: &["edit_file", "run_tests"],
    },
    WorkflowPattern {
        name: "investigation",
        steps: &["grep", "read_file", "grep"],
    },
];

/// `needle` appears in `haystack` in order (not necessarily contiguously).
fn is_subsequence(needle: &[&str], haystack: &[String]) -> bool {
    let mut iter = haystack.iter();
    needle
        .iter()
        .all(|step| iter.by_ref().any(|tool| tool == step))
}

/// The learning loop state. Callers wrap it in their own lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct LearningLoop {
    config: LearningConfig,
    stats: HashMap<String, ToolStats>,
    /// `transitions[from][to]` = observed successive-pair count.
    transitions: HashMap<String, HashMap<String, u64>>,
    finished_sessions: RingBuffer<Vec<String>>,
    current_session: Vec<String>,
    last_tool: Option<String>,
}

impl Default for LearningLoop {
    fn default() -> Self {
        Self::new(LearningConfig::default())
    }
}

impl LearningLoop {
    pub fn new(config: LearningConfig) -> Self {
        let config = config.clamped();
        let ring = RingBuffer::new(config.max_finished_sessions);
        Self {
            config,
            stats: HashMap::new(),
            transitions: HashMap::new(),
            finished_sessions: ring,
            current_session: Vec::new(),
            last_tool: None,
        }
    }

    /// Record one completed tool call.
    pub fn record_call(&mut self, tool: &str, success: bool, latency_ms: u64) {
        let alpha = self.config.ema_alpha;
        let entry = self.stats.entry(tool.to_string()).or_default();
        if entry.total_calls == 0 {
            entry.avg_latency_ms = latency_ms as f64;
        } else {
            entry.avg_latency_ms =
                alpha * latency_ms as f64 + (1.0 - alpha) * entry.avg_latency_ms;
        }
        entry.total_calls += 1;
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }

        // Successive-pair transition, by tool name only.
        if let Some(prev) = self.last_tool.take() {
            *self
                .transitions
                .entry(prev)
                .or_default()
                .entry(tool.to_string())
                .or_insert(0) += 1;
        }
        self.last_tool = Some(tool.to_string());

        self.current_session.push(tool.to_string());
        if self.current_session.len() > self.config.current_window {
            let overflow = self.current_session.len() - self.config.current_window;
            self.current_session.drain(0..overflow);
        }
    }

    /// Record whether the user kept the turn a tool contributed to.
    pub fn record_feedback(&mut self, tool: &str, accepted: bool) {
        let entry = self.stats.entry(tool.to_string()).or_default();
        entry.feedback_turns += 1;
        if accepted {
            entry.accepted_turns += 1;
        }
    }

    /// Close out the current session's sequence and reset the pair chain.
    pub fn finish_session(&mut self) {
        if !self.current_session.is_empty() {
            let sequence = std::mem::take(&mut self.current_session);
            self.finished_sessions.push(sequence);
        }
        self.last_tool = None;
    }

    pub fn stats_for(&self, tool: &str) -> Option<&ToolStats> {
        self.stats.get(tool)
    }

    pub fn all_stats(&self) -> &HashMap<String, ToolStats> {
        &self.stats
    }

    /// Probability distribution over the next tool given recent history.
    ///
    /// Uses the Markov row of the last tool in `history`; falls back to the
    /// global call-frequency distribution when no transitions exist.
    pub fn predict_next_tool(&self, history: &[String]) -> Vec<(String, f64)> {
        if let Some(last) = history.last() {
            if let Some(row) = self.transitions.get(last) {
                let total: u64 = row.values().sum();
                if total > 0 {
                    let mut dist: Vec<(String, f64)> = row
                        .iter()
                        .map(|(tool, count)| (tool.clone(), *count as f64 / total as f64))
                        .collect();
                    dist.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                    return dist;
                }
            }
        }
        self.global_frequency()
    }

    fn global_frequency(&self) -> Vec<(String, f64)> {
        let total: u64 = self.stats.values().map(|s| s.total_calls).sum();
        if total == 0 {
            return Vec::new();
        }
        let mut dist: Vec<(String, f64)> = self
            .stats
            .iter()
            .map(|(tool, s)| (tool.clone(), s.total_calls as f64 / total as f64))
            .collect();
        dist.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        dist
    }

    /// Blended tool recommendations: Markov 0.5 + frequency 0.3 +
    /// performance 0.2, capped at five.
    pub fn recommend_tools(&self, history: &[String]) -> Vec<(String, f64)> {
        let markov: HashMap<String, f64> = self.predict_next_tool(history).into_iter().collect();
        let frequency: HashMap<String, f64> = self.global_frequency().into_iter().collect();

        let mut scores: Vec<(String, f64)> = self
            .stats
            .keys()
            .map(|tool| {
                let m = markov.get(tool).copied().unwrap_or(0.0);
                let f = frequency.get(tool).copied().unwrap_or(0.0);
                let p = self
                    .stats
                    .get(tool)
                    .map(|s| s.performance_score())
                    .unwrap_or(0.0);
                (
                    tool.clone(),
                    REC_W_MARKOV * m + REC_W_FREQUENCY * f + REC_W_PERFORMANCE * p,
                )
            })
            .collect();
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(MAX_RECOMMENDATIONS);
        scores
    }

    /// Mine contiguous n-grams (length 2–5) seen at least twice across the
    /// finished sessions and the current window, most frequent first.
    pub fn mine_sequences(&self) -> Vec<(Vec<String>, u64)> {
        let mut counts: HashMap<Vec<String>, u64> = HashMap::new();
        let sessions: Vec<&Vec<String>> = self
            .finished_sessions
            .iter()
            .chain(std::iter::once(&self.current_session))
            .collect();
        for session in sessions {
            for n in 2..=5usize {
                if session.len() < n {
                    continue;
                }
                for window in session.windows(n) {
                    *counts.entry(window.to_vec()).or_insert(0) += 1;
                }
            }
        }
        let mut mined: Vec<(Vec<String>, u64)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .collect();
        mined.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        mined
    }

    /// Named workflows whose step pattern appears (as a subsequence) in any
    /// retained session, sorted.
    pub fn detect_workflows(&self) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let sessions: Vec<&Vec<String>> = self
            .finished_sessions
            .iter()
            .chain(std::iter::once(&self.current_session))
            .collect();
        for pattern in WORKFLOW_DICTIONARY.iter() {
            if sessions
                .iter()
                .any(|session| is_subsequence(pattern.steps, session))
            {
                found.push(pattern.name.to_string());
            }
        }
        found.sort();
        found
    }

    /// Persist the full state as JSON.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Restore state saved by [`serialize`](LearningLoop::serialize).
    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_score_monotonicity() {
        let fast_reliable = ToolStats {
            total_calls: 10,
            success_count: 10,
            failure_count: 0,
            avg_latency_ms: 100.0,
            ..ToolStats::default()
        };
        let slow_reliable = ToolStats {
            avg_latency_ms: 20_000.0,
            ..fast_reliable.clone()
        };
        let fast_flaky = ToolStats {
            success_count: 3,
            failure_count: 7,
            ..fast_reliable.clone()
        };
        assert!(fast_reliable.performance_score() > slow_reliable.performance_score());
        assert!(fast_reliable.performance_score() > fast_flaky.performance_score());
    }

    #[test]
    fn test_neutral_satisfaction_without_feedback() {
        let stats = ToolStats::default();
        assert_eq!(stats.user_satisfaction(), 0.5);
    }

    #[test]
    fn test_markov_prediction() {
        let mut learning = LearningLoop::default();
        for _ in 0..3 {
            learning.record_call("grep", true, 50);
            learning.record_call("read_file", true, 30);
        }
        learning.record_call("grep", true, 50);
        learning.record_call("edit_file", true, 40);

        let dist = learning.predict_next_tool(&["grep".to_string()]);
        assert_eq!(dist[0].0, "read_file");
        assert!(dist[0].1 > 0.5);
        // Distribution sums to 1.
        let sum: f64 = dist.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_falls_back_to_frequency() {
        let mut learning = LearningLoop::default();
        learning.record_call("grep", true, 50);
        let dist = learning.predict_next_tool(&["never_seen".to_string()]);
        assert_eq!(dist[0].0, "grep");
    }

    #[test]
    fn test_sequence_mining_requires_two_occurrences() {
        let mut learning = LearningLoop::default();
        for _ in 0..2 {
            learning.record_call("grep", true, 10);
            learning.record_call("read_file", true, 10);
            learning.finish_session();
        }
        let mined = learning.mine_sequences();
        assert!(mined
            .iter()
            .any(|(seq, count)| seq == &vec!["grep".to_string(), "read_file".to_string()]
                && *count >= 2));
    }

    #[test]
    fn test_workflow_detection() {
        let mut learning = LearningLoop::default();
        for tool in &["grep", "read_file", "edit_file", "run_tests"] {
            learning.record_call(tool, true, 10);
        }
        learning.finish_session();
        let workflows = learning.detect_workflows();
        assert!(workflows.contains(&"refactoring".to_string()));
        assert!(workflows.contains(&"search-and-replace".to_string()));
        assert!(workflows.contains(&"testing".to_string()));
    }

    #[test]
    fn test_recommendations_capped_at_five() {
        let mut learning = LearningLoop::default();
        for i in 0..8 {
            learning.record_call(&format!("tool-{}", i), true, 10);
        }
        let recs = learning.recommend_tools(&[]);
        assert_eq!(recs.len(), 5);
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut learning = LearningLoop::default();
        learning.record_call("grep", true, 50);
        learning.record_call("read_file", false, 75);
        learning.record_feedback("grep", true);
        learning.finish_session();

        let json = learning.serialize();
        let restored = LearningLoop::deserialize(&json).unwrap();
        assert_eq!(restored.stats_for("grep").unwrap().total_calls, 1);
        assert_eq!(restored.stats_for("read_file").unwrap().failure_count, 1);
        assert_eq!(
            restored.transitions.get("grep").unwrap().get("read_file"),
            Some(&1)
        );
    }
}
