//! Buddhi — the persisted structured-reasoning decision log.
//!
//! Every significant runtime decision (tool selection, model routing,
//! error recovery, …) can be recorded with a five-part reasoning chain:
//! thesis, reason, example, application, conclusion. Records carry
//! confidence, rejected alternatives, and an optional outcome filled in
//! later; analytics aggregate per-category counts, confidence, and success
//! rates. Storage goes through the [`Database`] contract and the schema is
//! created on first use.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::db::{Database, DbError, SqlParam};
use crate::chitragupta::ids::short_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The fixed decision taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionCategory {
    Architecture,
    ToolSelection,
    ModelRouting,
    ErrorRecovery,
    Refactoring,
    Security,
}

impl DecisionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCategory::Architecture => "architecture",
            DecisionCategory::ToolSelection => "tool-selection",
            DecisionCategory::ModelRouting => "model-routing",
            DecisionCategory::ErrorRecovery => "error-recovery",
            DecisionCategory::Refactoring => "refactoring",
            DecisionCategory::Security => "security",
        }
    }

    /// Parse a category string; rejects anything outside the enum.
    pub fn parse(s: &str) -> Result<Self, BuddhiError> {
        match s {
            "architecture" => Ok(DecisionCategory::Architecture),
            "tool-selection" => Ok(DecisionCategory::ToolSelection),
            "model-routing" => Ok(DecisionCategory::ModelRouting),
            "error-recovery" => Ok(DecisionCategory::ErrorRecovery),
            "refactoring" => Ok(DecisionCategory::Refactoring),
            "security" => Ok(DecisionCategory::Security),
            other => Err(BuddhiError::InvalidCategory(other.to_string())),
        }
    }
}

/// The five-part reasoning chain. Every string must be non-empty after
/// trimming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reasoning {
    pub thesis: String,
    pub reason: String,
    pub example: String,
    pub application: String,
    pub conclusion: String,
}

impl Reasoning {
    fn validate(&self) -> Result<(), BuddhiError> {
        let parts = [
            ("thesis", &self.thesis),
            ("reason", &self.reason),
            ("example", &self.example),
            ("application", &self.application),
            ("conclusion", &self.conclusion),
        ];
        for (name, value) in parts.iter() {
            if value.trim().is_empty() {
                return Err(BuddhiError::IncompleteReasoning((*name).to_string()));
            }
        }
        Ok(())
    }
}

/// A rejected alternative and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub description: String,
    pub reason_rejected: String,
}

/// Outcome recorded after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub timestamp_ms: u64,
}

/// A fully materialized decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub timestamp_ms: u64,
    pub session_id: String,
    pub project: String,
    pub category: DecisionCategory,
    pub description: String,
    pub reasoning: Reasoning,
    pub confidence: f64,
    pub alternatives: Vec<Alternative>,
    pub outcome: Option<DecisionOutcome>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Input to [`Buddhi::record_decision`].
#[derive(Debug, Clone)]
pub struct DecisionDraft {
    pub session_id: String,
    pub project: String,
    pub category: DecisionCategory,
    pub description: String,
    pub reasoning: Reasoning,
    pub confidence: f64,
    pub alternatives: Vec<Alternative>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// AND-combined filters for [`Buddhi::list_decisions`].
#[derive(Debug, Clone, Default)]
pub struct DecisionFilters {
    pub project: Option<String>,
    pub category: Option<DecisionCategory>,
    pub from_ms: Option<u64>,
    pub to_ms: Option<u64>,
    /// Defaults to 100.
    pub limit: Option<usize>,
}

/// Per-category aggregate from [`Buddhi::get_decision_patterns`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPattern {
    pub category: DecisionCategory,
    pub count: usize,
    /// Mean confidence rounded to 3 places.
    pub avg_confidence: f64,
    /// Fraction of recorded outcomes with success, 0 when none.
    pub success_rate: f64,
    /// Description of the most recent decision in the group.
    pub representative: String,
}

/// Decision-log failures.
#[derive(Debug)]
pub enum BuddhiError {
    InvalidCategory(String),
    ConfidenceOutOfRange(f64),
    /// Names the first empty reasoning field.
    IncompleteReasoning(String),
    UnknownDecision(String),
    Db(DbError),
}

impl fmt::Display for BuddhiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuddhiError::InvalidCategory(cat) => write!(f, "invalid decision category: {}", cat),
            BuddhiError::ConfidenceOutOfRange(v) => {
                write!(f, "confidence {} outside [0, 1]", v)
            }
            BuddhiError::IncompleteReasoning(field) => {
                write!(f, "reasoning field '{}' is empty", field)
            }
            BuddhiError::UnknownDecision(id) => write!(f, "unknown decision id: {}", id),
            BuddhiError::Db(err) => write!(f, "{}", err),
        }
    }
}

impl Error for BuddhiError {}

impl From<DbError> for BuddhiError {
    fn from(err: DbError) -> Self {
        BuddhiError::Db(err)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// The decision log.
pub struct Buddhi {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    schema_ready: AtomicBool,
}

impl Buddhi {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            schema_ready: AtomicBool::new(false),
        }
    }

    fn ensure_schema(&self) -> Result<(), BuddhiError> {
        if self.schema_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.db.exec(
            "CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                project TEXT NOT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                reasoning_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                alternatives_json TEXT NOT NULL,
                outcome_json TEXT,
                metadata_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_project ON decisions(project);
            CREATE INDEX IF NOT EXISTS idx_decisions_category ON decisions(category);",
        )?;
        self.schema_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Validate and persist a decision; returns the stored record with its
    /// generated id and timestamp, outcome unset.
    pub fn record_decision(&self, draft: DecisionDraft) -> Result<Decision, BuddhiError> {
        self.ensure_schema()?;
        if !(0.0..=1.0).contains(&draft.confidence) {
            return Err(BuddhiError::ConfidenceOutOfRange(draft.confidence));
        }
        draft.reasoning.validate()?;

        let timestamp_ms = self.clock.now_ms();
        let id = short_id("bud", &[&draft.description, &timestamp_ms.to_string()]);
        let decision = Decision {
            id: id.clone(),
            timestamp_ms,
            session_id: draft.session_id,
            project: draft.project,
            category: draft.category,
            description: draft.description,
            reasoning: draft.reasoning,
            confidence: draft.confidence,
            alternatives: draft.alternatives,
            outcome: None,
            metadata: draft.metadata,
        };

        self.db.run(
            "INSERT INTO decisions
             (id, timestamp, session_id, project, category, description,
              reasoning_json, confidence, alternatives_json, outcome_json, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)",
            &[
                SqlParam::from(decision.id.clone()),
                SqlParam::from(decision.timestamp_ms),
                SqlParam::from(decision.session_id.clone()),
                SqlParam::from(decision.project.clone()),
                SqlParam::from(decision.category.as_str()),
                SqlParam::from(decision.description.clone()),
                SqlParam::from(serde_json::to_string(&decision.reasoning).unwrap_or_default()),
                SqlParam::from(decision.confidence),
                SqlParam::from(serde_json::to_string(&decision.alternatives).unwrap_or_default()),
                SqlParam::from(serde_json::to_string(&decision.metadata).unwrap_or_default()),
            ],
        )?;
        log::debug!("buddhi: recorded {} ({})", id, decision.category.as_str());
        Ok(decision)
    }

    /// Attach an outcome to an existing decision.
    pub fn record_outcome(&self, id: &str, outcome: DecisionOutcome) -> Result<(), BuddhiError> {
        self.ensure_schema()?;
        let affected = self.db.run(
            "UPDATE decisions SET outcome_json = ?1 WHERE id = ?2",
            &[
                SqlParam::from(serde_json::to_string(&outcome).unwrap_or_default()),
                SqlParam::from(id),
            ],
        )?;
        if affected == 0 {
            return Err(BuddhiError::UnknownDecision(id.to_string()));
        }
        Ok(())
    }

    fn decision_from_row(row: &crate::chitragupta::db::Row) -> Result<Decision, BuddhiError> {
        let text = |key: &str| -> String {
            row.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let category = DecisionCategory::parse(&text("category"))?;
        let reasoning: Reasoning = serde_json::from_str(&text("reasoning_json"))
            .map_err(|e| BuddhiError::Db(DbError::Corrupt(e.to_string())))?;
        let alternatives: Vec<Alternative> = serde_json::from_str(&text("alternatives_json"))
            .map_err(|e| BuddhiError::Db(DbError::Corrupt(e.to_string())))?;
        let metadata: HashMap<String, serde_json::Value> =
            serde_json::from_str(&text("metadata_json"))
                .map_err(|e| BuddhiError::Db(DbError::Corrupt(e.to_string())))?;
        let outcome = match row.get("outcome_json") {
            Some(serde_json::Value::String(json)) if !json.is_empty() => Some(
                serde_json::from_str(json)
                    .map_err(|e| BuddhiError::Db(DbError::Corrupt(e.to_string())))?,
            ),
            _ => None,
        };
        Ok(Decision {
            id: text("id"),
            timestamp_ms: row.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0),
            session_id: text("session_id"),
            project: text("project"),
            category,
            description: text("description"),
            reasoning,
            confidence: row.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0),
            alternatives,
            outcome,
            metadata,
        })
    }

    /// Load one decision, or `None` when the id is unknown.
    pub fn get_decision(&self, id: &str) -> Result<Option<Decision>, BuddhiError> {
        self.ensure_schema()?;
        match self
            .db
            .get("SELECT * FROM decisions WHERE id = ?1", &[SqlParam::from(id)])?
        {
            Some(row) => Ok(Some(Self::decision_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Filtered listing, newest first, default limit 100.
    pub fn list_decisions(&self, filters: DecisionFilters) -> Result<Vec<Decision>, BuddhiError> {
        self.ensure_schema()?;
        let mut sql = String::from("SELECT * FROM decisions WHERE 1=1");
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(project) = &filters.project {
            params.push(SqlParam::from(project.clone()));
            sql.push_str(&format!(" AND project = ?{}", params.len()));
        }
        if let Some(category) = filters.category {
            params.push(SqlParam::from(category.as_str()));
            sql.push_str(&format!(" AND category = ?{}", params.len()));
        }
        if let Some(from_ms) = filters.from_ms {
            params.push(SqlParam::from(from_ms));
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        if let Some(to_ms) = filters.to_ms {
            params.push(SqlParam::from(to_ms));
            sql.push_str(&format!(" AND timestamp <= ?{}", params.len()));
        }
        params.push(SqlParam::from(filters.limit.unwrap_or(100) as i64));
        sql.push_str(&format!(" ORDER BY timestamp DESC LIMIT ?{}", params.len()));

        let rows = self.db.all(&sql, &params)?;
        rows.iter().map(Self::decision_from_row).collect()
    }

    /// Render a decision as a fixed-format syllogism block.
    pub fn explain_decision(&self, id: &str) -> Result<String, BuddhiError> {
        let decision = self
            .get_decision(id)?
            .ok_or_else(|| BuddhiError::UnknownDecision(id.to_string()))?;

        let mut out = String::new();
        out.push_str(&format!("Decision {}\n", decision.id));
        out.push_str(&format!("Category:   {}\n", decision.category.as_str()));
        out.push_str(&format!("Confidence: {:.2}\n", decision.confidence));
        out.push_str(&format!("What:       {}\n\n", decision.description));
        out.push_str(&format!("Thesis:      {}\n", decision.reasoning.thesis));
        out.push_str(&format!("Reason:      {}\n", decision.reasoning.reason));
        out.push_str(&format!("Example:     {}\n", decision.reasoning.example));
        out.push_str(&format!("Application: {}\n", decision.reasoning.application));
        out.push_str(&format!("Conclusion:  {}\n", decision.reasoning.conclusion));
        if !decision.alternatives.is_empty() {
            out.push_str("\nRejected alternatives:\n");
            for alt in &decision.alternatives {
                out.push_str(&format!("  - {} ({})\n", alt.description, alt.reason_rejected));
            }
        }
        if let Some(outcome) = &decision.outcome {
            out.push_str(&format!(
                "\nOutcome: {}{}\n",
                if outcome.success { "success" } else { "failure" },
                outcome
                    .feedback
                    .as_ref()
                    .map(|f| format!(" — {}", f))
                    .unwrap_or_default()
            ));
        }
        Ok(out)
    }

    /// Per-category aggregates for one project, sorted by count descending.
    pub fn get_decision_patterns(
        &self,
        project: &str,
    ) -> Result<Vec<DecisionPattern>, BuddhiError> {
        let decisions = self.list_decisions(DecisionFilters {
            project: Some(project.to_string()),
            limit: Some(i64::MAX as usize),
            ..DecisionFilters::default()
        })?;

        let mut groups: HashMap<DecisionCategory, Vec<&Decision>> = HashMap::new();
        for decision in &decisions {
            groups.entry(decision.category).or_default().push(decision);
        }

        let mut patterns: Vec<DecisionPattern> = groups
            .into_iter()
            .map(|(category, group)| {
                let count = group.len();
                let avg_confidence =
                    round3(group.iter().map(|d| d.confidence).sum::<f64>() / count as f64);
                let outcomes: Vec<&DecisionOutcome> =
                    group.iter().filter_map(|d| d.outcome.as_ref()).collect();
                let success_rate = if outcomes.is_empty() {
                    0.0
                } else {
                    round3(
                        outcomes.iter().filter(|o| o.success).count() as f64
                            / outcomes.len() as f64,
                    )
                };
                // list_decisions returns newest first.
                let representative = group[0].description.clone();
                DecisionPattern {
                    category,
                    count,
                    avg_confidence,
                    success_rate,
                    representative,
                }
            })
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(patterns)
    }

    /// Success rate for one category across every project; outcomes only,
    /// 0 when none are recorded. Rounded to 3 places.
    pub fn get_success_rate(&self, category: DecisionCategory) -> Result<f64, BuddhiError> {
        let decisions = self.list_decisions(DecisionFilters {
            category: Some(category),
            limit: Some(i64::MAX as usize),
            ..DecisionFilters::default()
        })?;
        let outcomes: Vec<&DecisionOutcome> =
            decisions.iter().filter_map(|d| d.outcome.as_ref()).collect();
        if outcomes.is_empty() {
            return Ok(0.0);
        }
        Ok(round3(
            outcomes.iter().filter(|o| o.success).count() as f64 / outcomes.len() as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chitragupta::clock::ManualClock;
    use crate::chitragupta::db::SqliteDatabase;

    fn buddhi() -> (Buddhi, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        (Buddhi::new(db, clock.clone() as Arc<dyn Clock>), clock)
    }

    fn reasoning() -> Reasoning {
        Reasoning {
            thesis: "Grep is the fastest way to locate code".to_string(),
            reason: "It scans text without building an index".to_string(),
            example: "Finding a function name across 10k files".to_string(),
            application: "Use grep before reaching for semantic search".to_string(),
            conclusion: "Grep first, refine later".to_string(),
        }
    }

    fn draft(description: &str, category: DecisionCategory) -> DecisionDraft {
        DecisionDraft {
            session_id: "s1".to_string(),
            project: "chitragupta".to_string(),
            category,
            description: description.to_string(),
            reasoning: reasoning(),
            confidence: 0.85,
            alternatives: vec![Alternative {
                description: "Use find".to_string(),
                reason_rejected: "Too slow".to_string(),
            }],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        let (buddhi, _) = buddhi();

        let mut bad_confidence = draft("x", DecisionCategory::ToolSelection);
        bad_confidence.confidence = 1.5;
        assert!(matches!(
            buddhi.record_decision(bad_confidence),
            Err(BuddhiError::ConfidenceOutOfRange(_))
        ));

        let mut empty_reasoning = draft("x", DecisionCategory::ToolSelection);
        empty_reasoning.reasoning.example = "   ".to_string();
        match buddhi.record_decision(empty_reasoning) {
            Err(BuddhiError::IncompleteReasoning(field)) => assert_eq!(field, "example"),
            other => panic!("unexpected: {:?}", other.map(|d| d.id)),
        }
    }

    #[test]
    fn test_round_trip_with_outcome() {
        let (buddhi, clock) = buddhi();
        let decision = buddhi
            .record_decision(draft("Use grep for code search", DecisionCategory::ToolSelection))
            .unwrap();
        assert!(decision.id.starts_with("bud-"));
        assert!(decision.outcome.is_none());

        clock.advance(500);
        buddhi
            .record_outcome(
                &decision.id,
                DecisionOutcome {
                    success: true,
                    feedback: Some("Grep found it.".to_string()),
                    timestamp_ms: 1_500,
                },
            )
            .unwrap();

        let loaded = buddhi.get_decision(&decision.id).unwrap().unwrap();
        assert_eq!(loaded.description, "Use grep for code search");
        assert_eq!(loaded.reasoning.thesis, decision.reasoning.thesis);
        assert_eq!(loaded.alternatives.len(), 1);
        let outcome = loaded.outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.feedback.as_deref(), Some("Grep found it."));
    }

    #[test]
    fn test_unknown_outcome_id_fails() {
        let (buddhi, _) = buddhi();
        assert!(matches!(
            buddhi.record_outcome(
                "bud-ffffffff",
                DecisionOutcome {
                    success: true,
                    feedback: None,
                    timestamp_ms: 0,
                }
            ),
            Err(BuddhiError::UnknownDecision(_))
        ));
    }

    #[test]
    fn test_patterns_and_success_rate() {
        let (buddhi, clock) = buddhi();
        for i in 0..3 {
            clock.advance(10);
            let d = buddhi
                .record_decision(draft(
                    &format!("tool decision {}", i),
                    DecisionCategory::ToolSelection,
                ))
                .unwrap();
            buddhi
                .record_outcome(
                    &d.id,
                    DecisionOutcome {
                        success: i != 0,
                        feedback: None,
                        timestamp_ms: clock.now_ms(),
                    },
                )
                .unwrap();
        }
        clock.advance(10);
        buddhi
            .record_decision(draft("arch decision", DecisionCategory::Architecture))
            .unwrap();

        let patterns = buddhi.get_decision_patterns("chitragupta").unwrap();
        assert_eq!(patterns[0].category, DecisionCategory::ToolSelection);
        assert_eq!(patterns[0].count, 3);
        assert!((patterns[0].avg_confidence - 0.85).abs() < 1e-9);
        assert!((patterns[0].success_rate - 0.667).abs() < 1e-9);
        assert_eq!(patterns[0].representative, "tool decision 2");

        // No outcomes recorded for architecture.
        assert_eq!(
            buddhi.get_success_rate(DecisionCategory::Architecture).unwrap(),
            0.0
        );
        assert!(
            (buddhi.get_success_rate(DecisionCategory::ToolSelection).unwrap() - 0.667).abs()
                < 1e-9
        );
    }

    #[test]
    fn test_explain_renders_syllogism() {
        let (buddhi, _) = buddhi();
        let decision = buddhi
            .record_decision(draft("Use grep for code search", DecisionCategory::ToolSelection))
            .unwrap();
        let explained = buddhi.explain_decision(&decision.id).unwrap();
        assert!(explained.contains("Thesis:"));
        assert!(explained.contains("Conclusion:"));
        assert!(explained.contains("Use find"));
    }

    #[test]
    fn test_list_filters_and_order() {
        let (buddhi, clock) = buddhi();
        for i in 0..5 {
            clock.advance(100);
            buddhi
                .record_decision(draft(&format!("d{}", i), DecisionCategory::Security))
                .unwrap();
        }
        let listed = buddhi
            .list_decisions(DecisionFilters {
                category: Some(DecisionCategory::Security),
                from_ms: Some(1_300),
                limit: Some(2),
                ..DecisionFilters::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 2);
        // Newest first.
        assert_eq!(listed[0].description, "d4");
        assert_eq!(listed[1].description, "d3");
    }
}
