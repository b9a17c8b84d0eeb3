//! Marga — the request routing pipeline.
//!
//! Decides, per request, whether an LLM is needed at all and which tier and
//! model should serve it: rule-based task-type classification (zero LLM
//! calls), pattern-based complexity scoring, a fixed (task-type, complexity)
//! → tier binding table with a local-first / cloud-first override, and a
//! [`Turiya`] contextual bandit that refines the tier from observed reward.
//!
//! The caller routes with [`MargaPipeline::route`], runs the turn, then
//! reports back through [`MargaPipeline::report_reward`] with the observed
//! success, latency, and cost; the composite reward updates the bandit arm
//! that served the request.

use crate::chitragupta::cost::{ModelCatalog, TokenCounter};
use crate::chitragupta::provider::{Role, Turn};
use crate::chitragupta::turiya::{ContextVector, Turiya};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// The fifteen request shapes the classifier distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Chat,
    CodeGen,
    Reasoning,
    Search,
    Embedding,
    Vision,
    ToolExec,
    Heartbeat,
    Smalltalk,
    Summarize,
    Translate,
    Memory,
    FileOp,
    ApiCall,
    Compaction,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Chat => "chat",
            TaskType::CodeGen => "code-gen",
            TaskType::Reasoning => "reasoning",
            TaskType::Search => "search",
            TaskType::Embedding => "embedding",
            TaskType::Vision => "vision",
            TaskType::ToolExec => "tool-exec",
            TaskType::Heartbeat => "heartbeat",
            TaskType::Smalltalk => "smalltalk",
            TaskType::Summarize => "summarize",
            TaskType::Translate => "translate",
            TaskType::Memory => "memory",
            TaskType::FileOp => "file-op",
            TaskType::ApiCall => "api-call",
            TaskType::Compaction => "compaction",
        };
        write!(f, "{}", name)
    }
}

/// How the request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// No LLM round-trip needed (heartbeats, embedding lookups).
    SkipLlm,
    /// Plain completion, no tools offered.
    LlmOnly,
    /// Completion with the tool registry attached.
    LlmWithTools,
}

/// Classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClassification {
    pub task_type: TaskType,
    pub resolution: Resolution,
    pub confidence: f64,
}

/// Complexity buckets, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

/// Complexity scorer output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    pub complexity: Complexity,
    pub reason: String,
    pub confidence: f64,
}

/// Cost/capability buckets, cheapest first. Ordering is load-bearing:
/// escalation takes the maximum of the table floor and the bandit's pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    NoLlm,
    Haiku,
    Sonnet,
    Opus,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::NoLlm, Tier::Haiku, Tier::Sonnet, Tier::Opus];

    pub fn arm_index(&self) -> usize {
        match self {
            Tier::NoLlm => 0,
            Tier::Haiku => 1,
            Tier::Sonnet => 2,
            Tier::Opus => 3,
        }
    }

    pub fn from_arm_index(index: usize) -> Tier {
        match index {
            0 => Tier::NoLlm,
            1 => Tier::Haiku,
            2 => Tier::Sonnet,
            _ => Tier::Opus,
        }
    }

    fn bump_down(&self) -> Tier {
        match self {
            Tier::Opus => Tier::Sonnet,
            Tier::Sonnet => Tier::Haiku,
            other => *other,
        }
    }

    fn bump_up(&self) -> Tier {
        match self {
            Tier::NoLlm => Tier::NoLlm,
            Tier::Haiku => Tier::Sonnet,
            _ => Tier::Opus,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::NoLlm => "no-llm",
            Tier::Haiku => "haiku",
            Tier::Sonnet => "sonnet",
            Tier::Opus => "opus",
        };
        write!(f, "{}", name)
    }
}

/// Whether the binding table leans toward cheaper local-class tiers or
/// toward cloud capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingProfile {
    LocalFirst,
    CloudFirst,
}

/// Which concrete model serves each LLM tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierModels {
    pub haiku: String,
    pub sonnet: String,
    pub opus: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            haiku: "haiku-standard".to_string(),
            sonnet: "sonnet-standard".to_string(),
            opus: "opus-standard".to_string(),
        }
    }
}

impl TierModels {
    fn model_for(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::NoLlm => None,
            Tier::Haiku => Some(&self.haiku),
            Tier::Sonnet => Some(&self.sonnet),
            Tier::Opus => Some(&self.opus),
        }
    }
}

fn last_user_text(turns: &[Turn]) -> String {
    turns
        .iter()
        .rev()
        .find(|t| t.role == Role::User)
        .map(|t| t.text())
        .unwrap_or_default()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a message history into a task type. Rule-based: keyword and
/// structural features only, zero LLM calls.
pub fn classify_task(turns: &[Turn]) -> TaskClassification {
    let text = last_user_text(turns);
    let lower = text.to_lowercase();
    let trimmed = lower.trim();

    let (task_type, confidence) = if trimmed.is_empty() {
        (TaskType::Chat, 0.3)
    } else if contains_any(trimmed, &["heartbeat", "health check"]) || trimmed == "ping" {
        (TaskType::Heartbeat, 0.95)
    } else if contains_any(trimmed, &["compact the conversation", "compact history", "compaction"])
    {
        (TaskType::Compaction, 0.9)
    } else if contains_any(trimmed, &["embedding", "embed this", "embed the"]) {
        (TaskType::Embedding, 0.9)
    } else if contains_any(trimmed, &["image", "screenshot", "photo", "diagram in the picture"]) {
        (TaskType::Vision, 0.8)
    } else if trimmed.starts_with("translate") || contains_any(trimmed, &["translate to", "translate into"]) {
        (TaskType::Translate, 0.9)
    } else if contains_any(trimmed, &["summarize", "summarise", "tl;dr", "give me a summary"]) {
        (TaskType::Summarize, 0.9)
    } else if contains_any(trimmed, &["remember that", "what did i", "recall", "from memory"]) {
        (TaskType::Memory, 0.8)
    } else if contains_any(
        trimmed,
        &["read the file", "write the file", "create a file", "delete the file", "rename the file"],
    ) {
        (TaskType::FileOp, 0.85)
    } else if contains_any(trimmed, &["http://", "https://", "api call", "curl ", "endpoint"]) {
        (TaskType::ApiCall, 0.8)
    } else if contains_any(trimmed, &["search for", "grep", "find all", "look up", "where is the"])
    {
        (TaskType::Search, 0.85)
    } else if text.contains("```")
        || contains_any(
            trimmed,
            &["implement", "write a function", "fix the bug", "refactor", "add a test", "compile"],
        )
    {
        (TaskType::CodeGen, 0.85)
    } else if contains_any(trimmed, &["run the", "execute", "shell", "command"]) {
        (TaskType::ToolExec, 0.75)
    } else if contains_any(trimmed, &["why", "explain", "prove", "analyze", "analyse", "compare", "design"])
    {
        (TaskType::Reasoning, 0.7)
    } else if trimmed.len() < 40
        && contains_any(trimmed, &["hi", "hello", "hey", "thanks", "thank you", "good morning"])
    {
        (TaskType::Smalltalk, 0.8)
    } else {
        (TaskType::Chat, 0.5)
    };

    let resolution = match task_type {
        TaskType::Heartbeat | TaskType::Embedding => Resolution::SkipLlm,
        TaskType::ToolExec
        | TaskType::FileOp
        | TaskType::ApiCall
        | TaskType::Search
        | TaskType::CodeGen => Resolution::LlmWithTools,
        _ => Resolution::LlmOnly,
    };

    TaskClassification {
        task_type,
        resolution,
        confidence,
    }
}

fn code_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let mut in_fence = false;
    let mut code_chars = 0usize;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            code_chars += line.len();
        }
    }
    (code_chars as f64 / text.len() as f64).clamp(0.0, 1.0)
}

/// Pattern-based complexity scoring over token count, code presence,
/// multi-step indicators, and retrieval references.
pub fn score_complexity(turns: &[Turn]) -> ComplexityAssessment {
    let text = last_user_text(turns);
    let lower = text.to_lowercase();
    let counter = TokenCounter::new();
    let tokens = counter.estimate_text(&text);

    let mut points = 0u32;
    let mut signals: Vec<&str> = Vec::new();

    if tokens > 1_000 {
        points += 2;
        signals.push("long request");
    } else if tokens > 250 {
        points += 1;
        signals.push("medium request");
    }
    if text.contains("```") || code_ratio(&text) > 0.1 {
        points += 2;
        signals.push("code present");
    }
    if contains_any(
        &lower,
        &["step 1", "first,", "then", "after that", "finally", "1.", "2."],
    ) {
        points += 1;
        signals.push("multi-step");
    }
    if contains_any(&lower, &["refactor", "migrate", "rewrite", "architecture", "across the codebase"])
    {
        points += 2;
        signals.push("structural change");
    }
    if contains_any(&lower, &["file", "docs", "documentation", "reference", "spec"]) {
        points += 1;
        signals.push("retrieval references");
    }

    let complexity = match points {
        0 => Complexity::Trivial,
        1 => Complexity::Simple,
        2 | 3 => Complexity::Moderate,
        4 | 5 => Complexity::Complex,
        _ => Complexity::Expert,
    };
    let reason = if signals.is_empty() {
        "no complexity signals".to_string()
    } else {
        signals.join(", ")
    };
    let confidence = if signals.is_empty() { 0.6 } else { 0.8 };

    ComplexityAssessment {
        complexity,
        reason,
        confidence,
    }
}

/// The fixed (task-type, complexity) → tier binding table. Returns the
/// cheapest adequate tier before profile adjustment.
pub fn base_tier(task_type: TaskType, complexity: Complexity) -> Tier {
    use Complexity::*;
    match task_type {
        TaskType::Heartbeat | TaskType::Embedding => Tier::NoLlm,
        TaskType::Smalltalk => Tier::Haiku,
        TaskType::Chat | TaskType::Memory => match complexity {
            Trivial | Simple => Tier::Haiku,
            _ => Tier::Sonnet,
        },
        TaskType::Summarize | TaskType::Translate | TaskType::Compaction => match complexity {
            Trivial | Simple => Tier::Haiku,
            _ => Tier::Sonnet,
        },
        TaskType::Search | TaskType::FileOp | TaskType::ToolExec | TaskType::ApiCall => {
            match complexity {
                Trivial | Simple => Tier::Haiku,
                Moderate | Complex => Tier::Sonnet,
                Expert => Tier::Opus,
            }
        }
        TaskType::Vision => match complexity {
            Trivial | Simple | Moderate => Tier::Sonnet,
            _ => Tier::Opus,
        },
        TaskType::CodeGen => match complexity {
            Trivial => Tier::Haiku,
            Simple | Moderate => Tier::Sonnet,
            Complex | Expert => Tier::Opus,
        },
        TaskType::Reasoning => match complexity {
            Trivial => Tier::Haiku,
            Simple | Moderate => Tier::Sonnet,
            Complex | Expert => Tier::Opus,
        },
    }
}

/// Routing verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    /// True when no LLM round-trip should happen at all.
    pub skip_llm: bool,
    /// Chosen model, absent when `skip_llm` is set.
    pub model_id: Option<String>,
    pub tier: Tier,
    /// Bandit arm charged with this decision; pass back to
    /// [`MargaPipeline::report_reward`].
    pub arm_index: usize,
    /// Rough USD estimate for serving the request at this tier.
    pub cost_estimate: f64,
    pub rationale: String,
    pub context: ContextVector,
    pub classification: TaskClassification,
    pub complexity: ComplexityAssessment,
}

/// Observed outcome of a routed turn, fed back into the bandit.
#[derive(Debug, Clone, Copy)]
pub struct RouteOutcome {
    pub success: bool,
    pub latency_ms: u64,
    pub cost_usd: f64,
    /// Budgeted cost the actual spend is compared against; when zero the
    /// decision's own estimate is used.
    pub budget_usd: f64,
}

/// Composite reward weights: task success, speed, cost.
const REWARD_W_SUCCESS: f64 = 0.5;
const REWARD_W_SPEED: f64 = 0.3;
const REWARD_W_COST: f64 = 0.2;
const SPEED_HORIZON_MS: f64 = 30_000.0;

/// The full routing pipeline: classifier → complexity → tier table →
/// Turiya refinement.
pub struct MargaPipeline {
    profile: RoutingProfile,
    tier_models: TierModels,
    catalog: ModelCatalog,
    counter: TokenCounter,
    turiya: Mutex<Turiya>,
}

impl MargaPipeline {
    pub fn new(profile: RoutingProfile) -> Self {
        Self {
            profile,
            tier_models: TierModels::default(),
            catalog: ModelCatalog::new(),
            counter: TokenCounter::new(),
            turiya: Mutex::new(Turiya::new(Tier::ALL.len())),
        }
    }

    pub fn with_tier_models(mut self, tier_models: TierModels) -> Self {
        self.tier_models = tier_models;
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Build the seven-dimensional context vector for this history.
    pub fn context_vector(
        &self,
        turns: &[Turn],
        assessment: &ComplexityAssessment,
    ) -> ContextVector {
        let text = last_user_text(turns);
        let lower = text.to_lowercase();
        let complexity = assessment.complexity as u8 as f64 / 4.0;
        let urgency = if contains_any(&lower, &["urgent", "asap", "right now", "quickly", "immediately"])
        {
            1.0
        } else {
            0.3
        };
        let creativity = if contains_any(&lower, &["brainstorm", "story", "creative", "design", "imagine"])
        {
            0.8
        } else {
            0.2
        };
        let precision = if contains_any(&lower, &["exact", "precise", "must", "spec", "strict"])
            || text.contains("```")
        {
            0.8
        } else {
            0.4
        };
        let code = code_ratio(&text);
        let depth = (turns.len() as f64 / 20.0).min(1.0);
        let memory_load = (self.counter.estimate_turns(turns) as f64 / 8_000.0).min(1.0);
        ContextVector::new(complexity, urgency, creativity, precision, code, depth, memory_load)
    }

    /// Decide tier and model for this history.
    pub fn route(&self, turns: &[Turn]) -> RouteDecision {
        let classification = classify_task(turns);
        let complexity = score_complexity(turns);
        let context = self.context_vector(turns, &complexity);

        let mut floor = base_tier(classification.task_type, complexity.complexity);
        floor = match self.profile {
            RoutingProfile::LocalFirst => floor.bump_down(),
            RoutingProfile::CloudFirst => {
                if floor == Tier::NoLlm {
                    floor
                } else {
                    floor.bump_up()
                }
            }
        };

        if classification.resolution == Resolution::SkipLlm || floor == Tier::NoLlm {
            let rationale = format!(
                "{}/{:?} resolves without an LLM",
                classification.task_type, complexity.complexity
            );
            return RouteDecision {
                skip_llm: true,
                model_id: None,
                tier: Tier::NoLlm,
                arm_index: Tier::NoLlm.arm_index(),
                cost_estimate: 0.0,
                rationale,
                context,
                classification,
                complexity,
            };
        }

        // The bandit may escalate above the table floor but never below it.
        let suggested = Tier::from_arm_index(self.turiya.lock().unwrap().select(&context));
        let tier = if suggested > floor { suggested } else { floor };
        let model_id = self.tier_models.model_for(tier).map(|s| s.to_string());
        let cost_estimate = self.estimate_cost(turns, tier);

        let rationale = format!(
            "{}/{:?} -> {} (floor {}, bandit suggested {})",
            classification.task_type, complexity.complexity, tier, floor, suggested
        );
        log::debug!("marga route: {}", rationale);

        RouteDecision {
            skip_llm: false,
            model_id,
            tier,
            arm_index: tier.arm_index(),
            cost_estimate,
            rationale,
            context,
            classification,
            complexity,
        }
    }

    fn estimate_cost(&self, turns: &[Turn], tier: Tier) -> f64 {
        const ASSUMED_OUTPUT_TOKENS: f64 = 500.0;
        let model = match self
            .tier_models
            .model_for(tier)
            .and_then(|id| self.catalog.get(id))
        {
            Some(model) => model,
            None => return 0.0,
        };
        let input_tokens = self.counter.estimate_turns(turns) as f64;
        (input_tokens * model.pricing.input + ASSUMED_OUTPUT_TOKENS * model.pricing.output)
            / 1_000_000.0
    }

    /// Report the observed outcome; updates the bandit arm that served the
    /// request with the 0.5/0.3/0.2 success/speed/cost composite.
    pub fn report_reward(&self, decision: &RouteDecision, outcome: RouteOutcome) -> f64 {
        let success = if outcome.success { 1.0 } else { 0.0 };
        let speed = (1.0 - outcome.latency_ms as f64 / SPEED_HORIZON_MS).clamp(0.0, 1.0);
        let budget = if outcome.budget_usd > 0.0 {
            outcome.budget_usd
        } else {
            decision.cost_estimate
        };
        let cost_eff = if budget > 0.0 {
            (1.0 - outcome.cost_usd / budget).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let reward =
            REWARD_W_SUCCESS * success + REWARD_W_SPEED * speed + REWARD_W_COST * cost_eff;
        self.turiya
            .lock()
            .unwrap()
            .update(decision.arm_index, &decision.context, reward);
        reward
    }

    /// Persist the bandit state.
    pub fn serialize_bandit(&self) -> String {
        self.turiya.lock().unwrap().serialize()
    }

    /// Restore bandit state saved by [`serialize_bandit`](Self::serialize_bandit).
    pub fn restore_bandit(&self, json: &str) -> Result<(), serde_json::Error> {
        let restored = Turiya::deserialize(json)?;
        *self.turiya.lock().unwrap() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(text: &str) -> Vec<Turn> {
        vec![Turn::user(text)]
    }

    #[test]
    fn test_heartbeat_skips_llm() {
        let classification = classify_task(&history("ping"));
        assert_eq!(classification.task_type, TaskType::Heartbeat);
        assert_eq!(classification.resolution, Resolution::SkipLlm);

        let pipeline = MargaPipeline::new(RoutingProfile::LocalFirst);
        let decision = pipeline.route(&history("heartbeat"));
        assert!(decision.skip_llm);
        assert!(decision.model_id.is_none());
        assert_eq!(decision.tier, Tier::NoLlm);
    }

    #[test]
    fn test_code_gen_with_tools() {
        let classification =
            classify_task(&history("implement a parser for the config format"));
        assert_eq!(classification.task_type, TaskType::CodeGen);
        assert_eq!(classification.resolution, Resolution::LlmWithTools);
    }

    #[test]
    fn test_smalltalk_is_cheap() {
        let classification = classify_task(&history("hello there"));
        assert_eq!(classification.task_type, TaskType::Smalltalk);
        assert_eq!(base_tier(TaskType::Smalltalk, Complexity::Trivial), Tier::Haiku);
    }

    #[test]
    fn test_complexity_scales_with_signals() {
        let trivial = score_complexity(&history("hi"));
        assert_eq!(trivial.complexity, Complexity::Trivial);

        let complex = score_complexity(&history(
            "First, refactor the storage layer. Then migrate the index format. \
             Finally update the docs.\n```rust\nfn main() {}\n```",
        ));
        assert!(complex.complexity >= Complexity::Complex);
        assert!(complex.reason.contains("code present"));
    }

    #[test]
    fn test_bandit_never_routes_below_floor() {
        let pipeline = MargaPipeline::new(RoutingProfile::CloudFirst);
        let decision = pipeline.route(&history(
            "Refactor the entire architecture across the codebase.\n```rust\nfn x() {}\n```",
        ));
        assert!(!decision.skip_llm);
        // CodeGen at complex-or-above maps to Opus; the bandit cannot lower it.
        assert_eq!(decision.tier, Tier::Opus);
        assert_eq!(decision.model_id.as_deref(), Some("opus-standard"));
    }

    #[test]
    fn test_reward_updates_selected_arm() {
        let pipeline = MargaPipeline::new(RoutingProfile::LocalFirst);
        let decision = pipeline.route(&history("explain why the cache misses"));
        assert!(!decision.skip_llm);
        let reward = pipeline.report_reward(
            &decision,
            RouteOutcome {
                success: true,
                latency_ms: 3_000,
                cost_usd: 0.001,
                budget_usd: 0.01,
            },
        );
        assert!(reward > 0.7);
        let json = pipeline.serialize_bandit();
        let turiya = Turiya::deserialize(&json).unwrap();
        assert_eq!(turiya.arm_pulls(decision.arm_index), 1);
    }

    #[test]
    fn test_bandit_round_trip_through_pipeline() {
        let pipeline = MargaPipeline::new(RoutingProfile::LocalFirst);
        let decision = pipeline.route(&history("summarize the meeting notes"));
        pipeline.report_reward(
            &decision,
            RouteOutcome {
                success: true,
                latency_ms: 100,
                cost_usd: 0.0,
                budget_usd: 0.0,
            },
        );
        let saved = pipeline.serialize_bandit();
        let fresh = MargaPipeline::new(RoutingProfile::LocalFirst);
        fresh.restore_bandit(&saved).unwrap();
        assert_eq!(
            Turiya::deserialize(&fresh.serialize_bandit())
                .unwrap()
                .arm_pulls(decision.arm_index),
            1
        );
    }
}
