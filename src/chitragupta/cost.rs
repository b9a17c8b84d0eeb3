//! Model catalog, pricing, and token estimation.
//!
//! Every routed request resolves to a [`ModelDef`] carrying the model's
//! context window and per-million-token pricing. [`calculate_cost`] turns a
//! stream's usage report into USD, [`CostTracker`] aggregates spend per
//! model, and [`TokenCounter`] supplies the conservative ~4-characters-per-
//! token estimate used for context-window fit checks.

use crate::chitragupta::provider::{StreamUsage, Turn};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// USD per million tokens, by token class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// A routable model: identity, provider, window, and pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    pub id: String,
    pub provider: String,
    pub context_window: u64,
    pub pricing: ModelPricing,
}

lazy_static! {
    /// Tier-representative models available out of the box. Hosts register
    /// their own catalogs on top of these via [`ModelCatalog::register`].
    static ref BUILTIN_MODELS: Vec<ModelDef> = vec![
        ModelDef {
            id: "haiku-standard".to_string(),
            provider: "anthropic".to_string(),
            context_window: 200_000,
            pricing: ModelPricing {
                input: 0.80,
                output: 4.00,
                cache_read: 0.08,
                cache_write: 1.00,
            },
        },
        ModelDef {
            id: "sonnet-standard".to_string(),
            provider: "anthropic".to_string(),
            context_window: 200_000,
            pricing: ModelPricing {
                input: 3.00,
                output: 15.00,
                cache_read: 0.30,
                cache_write: 3.75,
            },
        },
        ModelDef {
            id: "opus-standard".to_string(),
            provider: "anthropic".to_string(),
            context_window: 200_000,
            pricing: ModelPricing {
                input: 15.00,
                output: 75.00,
                cache_read: 1.50,
                cache_write: 18.75,
            },
        },
    ];
}

/// Mutable model lookup seeded with the builtin tier representatives.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: HashMap<String, ModelDef>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let mut models = HashMap::new();
        for model in BUILTIN_MODELS.iter() {
            models.insert(model.id.clone(), model.clone());
        }
        Self { models }
    }
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start without the builtin entries.
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// Register or replace a model definition.
    pub fn register(&mut self, model: ModelDef) {
        self.models.insert(model.id.clone(), model);
    }

    pub fn get(&self, id: &str) -> Option<&ModelDef> {
        self.models.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Per-class cost in USD for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_read_cost: f64,
    pub cache_write_cost: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_read_cost + self.cache_write_cost
    }
}

/// Price a usage report against a model's per-million-token rates.
pub fn calculate_cost(usage: &StreamUsage, model: &ModelDef) -> CostBreakdown {
    const MILLION: f64 = 1_000_000.0;
    CostBreakdown {
        input_cost: (usage.input_tokens as f64) * model.pricing.input / MILLION,
        output_cost: (usage.output_tokens as f64) * model.pricing.output / MILLION,
        cache_read_cost: (usage.cache_read_tokens as f64) * model.pricing.cache_read / MILLION,
        cache_write_cost: (usage.cache_write_tokens as f64) * model.pricing.cache_write / MILLION,
    }
}

/// Aggregated spend for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSpend {
    pub calls: u64,
    pub usage: StreamUsage,
    pub cost_usd: f64,
}

/// Thread-safe spend aggregation across every provider call.
#[derive(Default)]
pub struct CostTracker {
    inner: Mutex<HashMap<String, ModelSpend>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's usage and cost against `model_id`.
    pub fn record(&self, model_id: &str, usage: &StreamUsage, cost: &CostBreakdown) {
        let mut inner = self.inner.lock().unwrap();
        let spend = inner.entry(model_id.to_string()).or_default();
        spend.calls += 1;
        spend.usage.add(usage);
        spend.cost_usd += cost.total();
    }

    /// Snapshot of spend per model.
    pub fn per_model(&self) -> HashMap<String, ModelSpend> {
        self.inner.lock().unwrap().clone()
    }

    /// Total USD across all models.
    pub fn total_usd(&self) -> f64 {
        self.inner.lock().unwrap().values().map(|s| s.cost_usd).sum()
    }

    /// Total calls across all models.
    pub fn total_calls(&self) -> u64 {
        self.inner.lock().unwrap().values().map(|s| s.calls).sum()
    }
}

/// Conservative token estimation: one token per ~4 characters, minimum 1
/// per non-empty text part, plus a small per-turn framing overhead.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate_text(&self, text: &str) -> u64 {
        if text.is_empty() {
            0
        } else {
            ((text.len() as u64) / 4).max(1)
        }
    }

    pub fn estimate_turn(&self, turn: &Turn) -> u64 {
        // 4 tokens of framing per turn covers role tags and separators.
        let mut total = 4u64;
        for part in &turn.parts {
            total += match part {
                crate::chitragupta::provider::ContentPart::Text { text } => {
                    self.estimate_text(text)
                }
                crate::chitragupta::provider::ContentPart::ToolCall { arguments, name, .. } => {
                    self.estimate_text(name) + self.estimate_text(&arguments.to_string())
                }
                crate::chitragupta::provider::ContentPart::ToolResult { content, .. } => {
                    self.estimate_text(content)
                }
            };
        }
        total
    }

    pub fn estimate_turns(&self, turns: &[Turn]) -> u64 {
        turns.iter().map(|t| self.estimate_turn(t)).sum()
    }

    /// Whether the estimated history fits inside the model's window.
    pub fn fits_in_context(&self, turns: &[Turn], model: &ModelDef) -> bool {
        self.estimate_turns(turns) <= model.context_window
    }

    /// Estimated tokens as a fraction of the window, in percent.
    pub fn context_usage_percent(&self, turns: &[Turn], model: &ModelDef) -> f64 {
        if model.context_window == 0 {
            return 100.0;
        }
        (self.estimate_turns(turns) as f64) / (model.context_window as f64) * 100.0
    }
}
