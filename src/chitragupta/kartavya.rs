//! Kartavya — autonomously-triggered duties.
//!
//! A kartavya is a recurring duty the runtime executes without being asked:
//! an observed tendency (vasana) is promoted to a proposal (niyama), then
//! approved into an active duty with a trigger (cron, event, threshold, or
//! pattern) and an action (tool sequence, stored procedure, shell command,
//! or notification).
//!
//! [`KartavyaEngine`] owns the lifecycle and trigger evaluation: every fire
//! is gated by a per-duty cooldown (≥ 10 s), an hourly rate cap, and the
//! engine-wide active ceiling. [`KartavyaDispatcher`] executes fired
//! actions under bounded concurrency, consulting the [`RtaGate`] safety
//! check for anything that touches a shell or a tool, and keeps the last
//! 100 results in a ring.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::db::{Database, SqlParam};
use crate::chitragupta::ids::short_id;
use crate::chitragupta::ring::RingBuffer;
use crate::chitragupta::samiti::{MessageDraft, Samiti, Severity};
use crate::chitragupta::stores::ProcessPool;
use crate::chitragupta::tool::{ToolContext, ToolExecutor};
use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Hard ceilings from the resource model.
pub const MAX_ACTIVE: usize = 100;
pub const MAX_EXECUTIONS_PER_HOUR: usize = 60;
pub const MIN_COOLDOWN_MS: u64 = 10_000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const RESULT_RING: usize = 100;
const EXECUTION_LOG_RING: usize = 20;

// ---- Cron ----

/// One parsed field of a five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum CronField {
    Any,
    /// Sorted, de-duplicated admissible values.
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.binary_search(&value).is_ok(),
        }
    }
}

/// Parsed `minute hour day-of-month month day-of-week` expression.
///
/// Supports `*`, `*/n`, `a`, `a-b`, and comma-separated lists of those.
/// Day-of-week runs 0–6 with Sunday = 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

fn parse_field(spec: &str, min: u32, max: u32) -> Result<CronField, KartavyaError> {
    if spec == "*" {
        return Ok(CronField::Any);
    }
    let mut values: Vec<u32> = Vec::new();
    for token in spec.split(',') {
        if let Some(step) = token.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| KartavyaError::InvalidCron(format!("bad step '{}'", token)))?;
            if step == 0 {
                return Err(KartavyaError::InvalidCron("step of zero".to_string()));
            }
            let mut v = min;
            while v <= max {
                values.push(v);
                v += step;
            }
        } else if let Some((start, end)) = token.split_once('-') {
            let start: u32 = start
                .parse()
                .map_err(|_| KartavyaError::InvalidCron(format!("bad range '{}'", token)))?;
            let end: u32 = end
                .parse()
                .map_err(|_| KartavyaError::InvalidCron(format!("bad range '{}'", token)))?;
            if start > end || start < min || end > max {
                return Err(KartavyaError::InvalidCron(format!(
                    "range '{}' outside {}-{}",
                    token, min, max
                )));
            }
            values.extend(start..=end);
        } else {
            let value: u32 = token
                .parse()
                .map_err(|_| KartavyaError::InvalidCron(format!("bad value '{}'", token)))?;
            if value < min || value > max {
                return Err(KartavyaError::InvalidCron(format!(
                    "value {} outside {}-{}",
                    value, min, max
                )));
            }
            values.push(value);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

impl CronExpr {
    /// Parse a five-field expression.
    pub fn parse(expr: &str) -> Result<Self, KartavyaError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(KartavyaError::InvalidCron(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Whether the expression matches the UTC minute containing `now_ms`.
    pub fn matches(&self, now_ms: u64) -> bool {
        let dt = match Utc.timestamp_millis_opt(now_ms as i64).single() {
            Some(dt) => dt,
            None => return false,
        };
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }
}

// ---- Triggers and actions ----

/// Comparison operator for threshold triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl ThresholdOp {
    pub fn evaluate(&self, metric: f64, value: f64) -> bool {
        match self {
            ThresholdOp::Lt => metric < value,
            ThresholdOp::Le => metric <= value,
            ThresholdOp::Gt => metric > value,
            ThresholdOp::Ge => metric >= value,
            ThresholdOp::Eq => (metric - value).abs() < f64::EPSILON,
        }
    }
}

/// What causes a kartavya to fire. Every variant carries its cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Cron { expr: String, cooldown_ms: u64 },
    Event { name: String, cooldown_ms: u64 },
    Threshold {
        metric: String,
        op: ThresholdOp,
        value: f64,
        cooldown_ms: u64,
    },
    Pattern { regex: String, cooldown_ms: u64 },
}

impl Trigger {
    pub fn cooldown_ms(&self) -> u64 {
        match self {
            Trigger::Cron { cooldown_ms, .. }
            | Trigger::Event { cooldown_ms, .. }
            | Trigger::Threshold { cooldown_ms, .. }
            | Trigger::Pattern { cooldown_ms, .. } => *cooldown_ms,
        }
    }
}

/// One step of a tool-sequence or stored-procedure action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStep {
    pub tool: String,
    pub args: serde_json::Value,
}

/// What a kartavya does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    ToolSequence { steps: Vec<ToolStep> },
    /// A stored procedure resolved through the injected [`VidhiEngine`].
    Vidhi { name: String },
    Command { command: String },
    Notification {
        channel: String,
        severity: Severity,
        content: String,
    },
}

impl Action {
    fn kind(&self) -> &'static str {
        match self {
            Action::ToolSequence { .. } => "tool_sequence",
            Action::Vidhi { .. } => "vidhi",
            Action::Command { .. } => "command",
            Action::Notification { .. } => "notification",
        }
    }
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KartavyaStatus {
    Proposed,
    Approved,
    Active,
    Paused,
    Retired,
    Completed,
    Failed,
}

/// One entry of a duty's execution log ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp_ms: u64,
    pub success: bool,
    pub detail: String,
}

/// A duty record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kartavya {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: KartavyaStatus,
    pub trigger: Trigger,
    pub action: Action,
    pub origin_vasana_id: String,
    pub evidence: Vec<String>,
    pub confidence: f64,
    pub created_at_ms: u64,
    pub execution_log: RingBuffer<ExecutionLogEntry>,
    pub fire_count: u64,
    pub last_fire_ms: Option<u64>,
    /// Fire timestamps within the rolling hour, for the rate cap.
    pub recent_fires_ms: VecDeque<u64>,
}

/// Inputs the engine evaluates triggers against.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub now_ms: u64,
    pub events: HashSet<String>,
    pub metrics: HashMap<String, f64>,
    pub patterns: Vec<String>,
}

/// Engine failures.
#[derive(Debug)]
pub enum KartavyaError {
    InvalidCron(String),
    ConfidenceTooLow { confidence: f64, minimum: f64 },
    UnknownKartavya(String),
    InvalidTransition {
        from: KartavyaStatus,
        to: KartavyaStatus,
    },
    ActiveCapReached(usize),
    Db(crate::chitragupta::db::DbError),
}

impl fmt::Display for KartavyaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KartavyaError::InvalidCron(msg) => write!(f, "invalid cron expression: {}", msg),
            KartavyaError::ConfidenceTooLow { confidence, minimum } => write!(
                f,
                "confidence {:.2} below proposal minimum {:.2}",
                confidence, minimum
            ),
            KartavyaError::UnknownKartavya(id) => write!(f, "unknown kartavya: {}", id),
            KartavyaError::InvalidTransition { from, to } => {
                write!(f, "invalid transition {:?} -> {:?}", from, to)
            }
            KartavyaError::ActiveCapReached(cap) => {
                write!(f, "active kartavya ceiling of {} reached", cap)
            }
            KartavyaError::Db(err) => write!(f, "{}", err),
        }
    }
}

impl Error for KartavyaError {}

impl From<crate::chitragupta::db::DbError> for KartavyaError {
    fn from(err: crate::chitragupta::db::DbError) -> Self {
        KartavyaError::Db(err)
    }
}

/// Engine tunables, clamped into the hard ceilings.
#[derive(Debug, Clone)]
pub struct KartavyaConfig {
    pub min_confidence_for_proposal: f64,
    pub min_confidence_for_auto_approve: f64,
    pub min_cooldown_ms: u64,
    pub max_executions_per_hour: usize,
    pub max_active: usize,
}

impl Default for KartavyaConfig {
    fn default() -> Self {
        Self {
            min_confidence_for_proposal: 0.7,
            min_confidence_for_auto_approve: 0.95,
            min_cooldown_ms: MIN_COOLDOWN_MS,
            max_executions_per_hour: MAX_EXECUTIONS_PER_HOUR,
            max_active: MAX_ACTIVE,
        }
    }
}

impl KartavyaConfig {
    fn clamped(mut self) -> Self {
        self.min_cooldown_ms = self.min_cooldown_ms.max(MIN_COOLDOWN_MS);
        self.max_executions_per_hour = self.max_executions_per_hour.clamp(1, MAX_EXECUTIONS_PER_HOUR);
        self.max_active = self.max_active.clamp(1, MAX_ACTIVE);
        self
    }
}

// ---- Engine ----

/// Lifecycle owner and trigger evaluator.
pub struct KartavyaEngine {
    db: Option<Arc<dyn Database>>,
    clock: Arc<dyn Clock>,
    config: KartavyaConfig,
    items: Mutex<HashMap<String, Kartavya>>,
}

impl KartavyaEngine {
    pub fn new(clock: Arc<dyn Clock>, config: KartavyaConfig) -> Self {
        Self {
            db: None,
            clock,
            config: config.clamped(),
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Attach persistence; loads previously saved duties.
    pub fn with_database(mut self, db: Arc<dyn Database>) -> Result<Self, KartavyaError> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS kartavyas (id TEXT PRIMARY KEY, json TEXT NOT NULL)",
        )?;
        let rows = db.all("SELECT json FROM kartavyas", &[])?;
        let mut items = self.items.lock().unwrap();
        for row in rows {
            if let Some(json) = row.get("json").and_then(|v| v.as_str()) {
                match serde_json::from_str::<Kartavya>(json) {
                    Ok(kartavya) => {
                        items.insert(kartavya.id.clone(), kartavya);
                    }
                    Err(err) => {
                        log::warn!("kartavya: skipping corrupt persisted record: {}", err)
                    }
                }
            }
        }
        drop(items);
        self.db = Some(db);
        Ok(self)
    }

    fn persist(&self, kartavya: &Kartavya) {
        if let Some(db) = &self.db {
            let json = serde_json::to_string(kartavya).unwrap_or_default();
            if let Err(err) = db.run(
                "INSERT INTO kartavyas (id, json) VALUES (?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET json = excluded.json",
                &[SqlParam::from(kartavya.id.clone()), SqlParam::from(json)],
            ) {
                log::warn!("kartavya: persist failed for {}: {}", kartavya.id, err);
            }
        }
    }

    fn active_count(items: &HashMap<String, Kartavya>) -> usize {
        items
            .values()
            .filter(|k| k.status == KartavyaStatus::Active)
            .count()
    }

    /// Promote an observation into a proposed duty.
    ///
    /// Rejects confidence below the proposal floor; confidence at or above
    /// the auto-approve threshold activates the duty immediately. Cron
    /// expressions are validated here so a bad one never reaches
    /// evaluation.
    pub fn propose_niyama(
        &self,
        vasana_id: &str,
        name: &str,
        description: &str,
        trigger: Trigger,
        action: Action,
        evidence: Vec<String>,
        confidence: f64,
    ) -> Result<Kartavya, KartavyaError> {
        if confidence < self.config.min_confidence_for_proposal {
            return Err(KartavyaError::ConfidenceTooLow {
                confidence,
                minimum: self.config.min_confidence_for_proposal,
            });
        }
        if let Trigger::Cron { expr, .. } = &trigger {
            CronExpr::parse(expr)?;
        }

        let now = self.clock.now_ms();
        let id = short_id("kar", &[vasana_id, name, &now.to_string()]);
        let mut kartavya = Kartavya {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            status: KartavyaStatus::Proposed,
            trigger,
            action,
            origin_vasana_id: vasana_id.to_string(),
            evidence,
            confidence,
            created_at_ms: now,
            execution_log: RingBuffer::new(EXECUTION_LOG_RING),
            fire_count: 0,
            last_fire_ms: None,
            recent_fires_ms: VecDeque::new(),
        };

        let mut items = self.items.lock().unwrap();
        if confidence >= self.config.min_confidence_for_auto_approve {
            if Self::active_count(&items) >= self.config.max_active {
                return Err(KartavyaError::ActiveCapReached(self.config.max_active));
            }
            kartavya.status = KartavyaStatus::Active;
            log::info!("kartavya: auto-approved '{}' ({})", name, id);
        }
        items.insert(id, kartavya.clone());
        drop(items);
        self.persist(&kartavya);
        Ok(kartavya)
    }

    fn transition(
        &self,
        id: &str,
        allowed_from: &[KartavyaStatus],
        to: KartavyaStatus,
    ) -> Result<Kartavya, KartavyaError> {
        let snapshot = {
            let mut items = self.items.lock().unwrap();
            if to == KartavyaStatus::Active
                && Self::active_count(&items) >= self.config.max_active
            {
                return Err(KartavyaError::ActiveCapReached(self.config.max_active));
            }
            let kartavya = items
                .get_mut(id)
                .ok_or_else(|| KartavyaError::UnknownKartavya(id.to_string()))?;
            if !allowed_from.contains(&kartavya.status) {
                return Err(KartavyaError::InvalidTransition {
                    from: kartavya.status,
                    to,
                });
            }
            kartavya.status = to;
            kartavya.clone()
        };
        self.persist(&snapshot);
        Ok(snapshot)
    }

    /// Approve a proposal, activating it.
    pub fn approve_niyama(&self, id: &str) -> Result<Kartavya, KartavyaError> {
        self.transition(
            id,
            &[KartavyaStatus::Proposed, KartavyaStatus::Approved],
            KartavyaStatus::Active,
        )
    }

    pub fn pause(&self, id: &str) -> Result<Kartavya, KartavyaError> {
        self.transition(id, &[KartavyaStatus::Active], KartavyaStatus::Paused)
    }

    pub fn resume(&self, id: &str) -> Result<Kartavya, KartavyaError> {
        self.transition(id, &[KartavyaStatus::Paused], KartavyaStatus::Active)
    }

    pub fn retire(&self, id: &str) -> Result<Kartavya, KartavyaError> {
        self.transition(
            id,
            &[
                KartavyaStatus::Proposed,
                KartavyaStatus::Approved,
                KartavyaStatus::Active,
                KartavyaStatus::Paused,
            ],
            KartavyaStatus::Retired,
        )
    }

    pub fn get(&self, id: &str) -> Option<Kartavya> {
        self.items.lock().unwrap().get(id).cloned()
    }

    /// All duties in a given status, sorted by creation time.
    pub fn list_by_status(&self, status: KartavyaStatus) -> Vec<Kartavya> {
        let items = self.items.lock().unwrap();
        let mut list: Vec<Kartavya> = items
            .values()
            .filter(|k| k.status == status)
            .cloned()
            .collect();
        list.sort_by_key(|k| k.created_at_ms);
        list
    }

    /// Record an execution outcome into the duty's log ring.
    pub fn record_execution(&self, id: &str, success: bool, detail: &str) {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut items = self.items.lock().unwrap();
            match items.get_mut(id) {
                Some(kartavya) => {
                    kartavya.execution_log.push(ExecutionLogEntry {
                        timestamp_ms: now,
                        success,
                        detail: detail.to_string(),
                    });
                    Some(kartavya.clone())
                }
                None => None,
            }
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }
    }

    fn trigger_satisfied(trigger: &Trigger, ctx: &TriggerContext) -> bool {
        match trigger {
            Trigger::Cron { expr, .. } => CronExpr::parse(expr)
                .map(|cron| cron.matches(ctx.now_ms))
                .unwrap_or(false),
            Trigger::Event { name, .. } => ctx.events.contains(name),
            Trigger::Threshold {
                metric, op, value, ..
            } => ctx
                .metrics
                .get(metric)
                .map(|observed| op.evaluate(*observed, *value))
                .unwrap_or(false),
            Trigger::Pattern { regex, .. } => match regex::Regex::new(regex) {
                Ok(re) => ctx.patterns.iter().any(|p| re.is_match(p)),
                Err(_) => false,
            },
        }
    }

    /// Evaluate every active duty against the context; returns the duties
    /// that fired, gates applied:
    ///
    /// - cooldown: `now - last_fire ≥ max(trigger.cooldown_ms, 10 s)`
    /// - rate cap: at most `max_executions_per_hour` fires per duty
    /// - active cap: at most `max_active` fires per evaluation
    pub fn evaluate_triggers(&self, ctx: &TriggerContext) -> Vec<Kartavya> {
        let now = ctx.now_ms;
        let mut fired = Vec::new();
        let mut items = self.items.lock().unwrap();
        for kartavya in items.values_mut() {
            if kartavya.status != KartavyaStatus::Active {
                continue;
            }
            if fired.len() >= self.config.max_active {
                log::warn!("kartavya: active fire ceiling reached; deferring remaining triggers");
                break;
            }
            if !Self::trigger_satisfied(&kartavya.trigger, ctx) {
                continue;
            }
            // Cooldown gate.
            let cooldown = kartavya
                .trigger
                .cooldown_ms()
                .max(self.config.min_cooldown_ms);
            if let Some(last) = kartavya.last_fire_ms {
                if now.saturating_sub(last) < cooldown {
                    continue;
                }
            }
            // Hourly rate gate over a rolling window.
            while let Some(front) = kartavya.recent_fires_ms.front() {
                if now.saturating_sub(*front) > 3_600_000 {
                    kartavya.recent_fires_ms.pop_front();
                } else {
                    break;
                }
            }
            if kartavya.recent_fires_ms.len() >= self.config.max_executions_per_hour {
                continue;
            }

            kartavya.last_fire_ms = Some(now);
            kartavya.recent_fires_ms.push_back(now);
            kartavya.fire_count += 1;
            fired.push(kartavya.clone());
        }
        drop(items);
        for kartavya in &fired {
            self.persist(kartavya);
        }
        fired
    }
}

// ---- Dispatcher ----

/// Safety gate consulted before any command or tool step runs.
pub trait RtaGate: Send + Sync {
    fn check_command(&self, command: &str) -> Result<(), String>;

    fn check_tool(&self, _tool: &str, _args: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Conservative default: blocks obviously destructive shell patterns.
pub struct DefaultRta;

const FORBIDDEN_COMMAND_PATTERNS: [&str; 7] = [
    "rm -rf /",
    "mkfs",
    "dd if=",
    ":(){",
    "> /dev/sd",
    "shutdown",
    "reboot",
];

impl RtaGate for DefaultRta {
    fn check_command(&self, command: &str) -> Result<(), String> {
        for pattern in FORBIDDEN_COMMAND_PATTERNS.iter() {
            if command.contains(pattern) {
                return Err(format!("command matches forbidden pattern '{}'", pattern));
            }
        }
        Ok(())
    }
}

/// Stored-procedure resolver for [`Action::Vidhi`].
#[async_trait]
pub trait VidhiEngine: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<Vec<ToolStep>>;
}

/// One dispatched action's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub kartavya_id: String,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

/// Executes fired kartavya actions under bounded concurrency.
pub struct KartavyaDispatcher {
    clock: Arc<dyn Clock>,
    rta: Arc<dyn RtaGate>,
    samiti: Option<Arc<Samiti>>,
    tools: Option<Arc<ToolExecutor>>,
    pool: Option<Arc<dyn ProcessPool>>,
    vidhi: Option<Arc<dyn VidhiEngine>>,
    enable_command_actions: bool,
    permits: Semaphore,
    results: Mutex<RingBuffer<DispatchResult>>,
}

impl KartavyaDispatcher {
    pub fn new(clock: Arc<dyn Clock>, max_concurrent: usize) -> Self {
        Self {
            clock,
            rta: Arc::new(DefaultRta),
            samiti: None,
            tools: None,
            pool: None,
            vidhi: None,
            enable_command_actions: false,
            permits: Semaphore::new(max_concurrent.max(1)),
            results: Mutex::new(RingBuffer::new(RESULT_RING)),
        }
    }

    pub fn with_rta(mut self, rta: Arc<dyn RtaGate>) -> Self {
        self.rta = rta;
        self
    }

    pub fn with_samiti(mut self, samiti: Arc<Samiti>) -> Self {
        self.samiti = Some(samiti);
        self
    }

    pub fn with_tool_executor(mut self, tools: Arc<ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_process_pool(mut self, pool: Arc<dyn ProcessPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_vidhi_engine(mut self, vidhi: Arc<dyn VidhiEngine>) -> Self {
        self.vidhi = Some(vidhi);
        self
    }

    /// Commands stay disabled unless the host opts in.
    pub fn with_command_actions_enabled(mut self, enabled: bool) -> Self {
        self.enable_command_actions = enabled;
        self
    }

    fn record(&self, result: DispatchResult) -> DispatchResult {
        self.results.lock().unwrap().push(result.clone());
        result
    }

    /// Newest-first slice of the last dispatch results.
    pub fn get_results(&self, limit: Option<usize>) -> Vec<DispatchResult> {
        self.results.lock().unwrap().to_vec_newest_first(limit)
    }

    /// Execute one fired duty's action.
    pub async fn dispatch(&self, kartavya: &Kartavya) -> DispatchResult {
        let _permit = self.permits.acquire().await;
        let timestamp_ms = self.clock.now_ms();
        let base = DispatchResult {
            kartavya_id: kartavya.id.clone(),
            action: kartavya.action.kind().to_string(),
            success: false,
            result: None,
            error: None,
            timestamp_ms,
        };

        let outcome = match &kartavya.action {
            Action::Notification {
                channel,
                severity,
                content,
            } => self.dispatch_notification(kartavya, channel, *severity, content),
            Action::Command { command } => self.dispatch_command(command).await,
            Action::ToolSequence { steps } => self.dispatch_steps(kartavya, steps).await,
            Action::Vidhi { name } => match &self.vidhi {
                Some(vidhi) => match vidhi.resolve(name).await {
                    Some(steps) => self.dispatch_steps(kartavya, &steps).await,
                    None => Err(format!("unknown vidhi '{}'", name)),
                },
                None => Err("no vidhi engine attached".to_string()),
            },
        };

        let result = match outcome {
            Ok(detail) => DispatchResult {
                success: true,
                result: Some(detail),
                ..base
            },
            Err(error) => DispatchResult {
                error: Some(error),
                ..base
            },
        };
        self.record(result)
    }

    fn dispatch_notification(
        &self,
        kartavya: &Kartavya,
        channel: &str,
        severity: Severity,
        content: &str,
    ) -> Result<String, String> {
        match &self.samiti {
            Some(samiti) => {
                let draft = MessageDraft::new(
                    kartavya.id.clone(),
                    severity,
                    "kartavya",
                    content.to_string(),
                );
                samiti
                    .broadcast(channel, draft)
                    .map(|msg| format!("broadcast {}", msg.id))
                    .map_err(|e| e.to_string())
            }
            // Record-only when no hub is wired in.
            None => Ok(format!("recorded notification: {}", content)),
        }
    }

    async fn dispatch_command(&self, command: &str) -> Result<String, String> {
        if !self.enable_command_actions {
            return Err("command actions are disabled".to_string());
        }
        self.rta.check_command(command)?;
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| "no process pool attached".to_string())?;
        let output = pool
            .run(command, COMMAND_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        if output.killed {
            return Err(format!("command killed on timeout: {}", output.stderr));
        }
        if output.exit_code != 0 {
            return Err(format!(
                "exit {}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(output.stdout)
    }

    /// Run steps in order through the tool executor, aborting on the first
    /// failure.
    async fn dispatch_steps(
        &self,
        kartavya: &Kartavya,
        steps: &[ToolStep],
    ) -> Result<String, String> {
        let tools = self
            .tools
            .as_ref()
            .ok_or_else(|| "no tool executor attached".to_string())?;
        let ctx = ToolContext::new("kartavya", kartavya.id.clone());
        let mut outputs = Vec::with_capacity(steps.len());
        for (idx, step) in steps.iter().enumerate() {
            self.rta.check_tool(&step.tool, &step.args)?;
            let outcome = tools.execute(&step.tool, step.args.clone(), &ctx).await;
            if outcome.is_error {
                return Err(format!(
                    "step {} ({}) failed: {}",
                    idx + 1,
                    step.tool,
                    outcome.content
                ));
            }
            outputs.push(outcome.content);
        }
        Ok(outputs.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chitragupta::clock::ManualClock;

    #[test]
    fn test_cron_parse_and_match() {
        // 2023-11-14 22:13 UTC is a Tuesday.
        let ts = 1_700_000_000_000u64;
        assert!(CronExpr::parse("* * * * *").unwrap().matches(ts));
        assert!(CronExpr::parse("13 22 14 11 2").unwrap().matches(ts));
        assert!(!CronExpr::parse("14 22 14 11 2").unwrap().matches(ts));
        assert!(CronExpr::parse("*/13 * * * *").unwrap().matches(ts));
        assert!(CronExpr::parse("10-15 * * * *").unwrap().matches(ts));
        assert!(CronExpr::parse("1,13,40 * * * *").unwrap().matches(ts));
        assert!(!CronExpr::parse("* * * * 0").unwrap().matches(ts));
    }

    #[test]
    fn test_cron_rejects_garbage() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
    }

    #[test]
    fn test_threshold_ops() {
        assert!(ThresholdOp::Gt.evaluate(0.9, 0.8));
        assert!(ThresholdOp::Le.evaluate(0.8, 0.8));
        assert!(!ThresholdOp::Lt.evaluate(0.9, 0.8));
        assert!(ThresholdOp::Eq.evaluate(1.0, 1.0));
    }

    fn engine(clock: Arc<ManualClock>) -> KartavyaEngine {
        KartavyaEngine::new(clock as Arc<dyn Clock>, KartavyaConfig::default())
    }

    fn event_trigger(name: &str) -> Trigger {
        Trigger::Event {
            name: name.to_string(),
            cooldown_ms: 10_000,
        }
    }

    fn notify_action() -> Action {
        Action::Notification {
            channel: "#alerts".to_string(),
            severity: Severity::Info,
            content: "duty fired".to_string(),
        }
    }

    #[test]
    fn test_proposal_confidence_floor() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock);
        let err = engine
            .propose_niyama(
                "vas-1",
                "low",
                "",
                event_trigger("e"),
                notify_action(),
                vec![],
                0.5,
            )
            .unwrap_err();
        assert!(matches!(err, KartavyaError::ConfidenceTooLow { .. }));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock);
        let proposed = engine
            .propose_niyama(
                "vas-1",
                "daily-check",
                "",
                event_trigger("e"),
                notify_action(),
                vec!["seen 12 times".to_string()],
                0.8,
            )
            .unwrap();
        assert_eq!(proposed.status, KartavyaStatus::Proposed);

        let active = engine.approve_niyama(&proposed.id).unwrap();
        assert_eq!(active.status, KartavyaStatus::Active);

        let paused = engine.pause(&proposed.id).unwrap();
        assert_eq!(paused.status, KartavyaStatus::Paused);
        assert!(matches!(
            engine.pause(&proposed.id),
            Err(KartavyaError::InvalidTransition { .. })
        ));

        engine.resume(&proposed.id).unwrap();
        let retired = engine.retire(&proposed.id).unwrap();
        assert_eq!(retired.status, KartavyaStatus::Retired);
    }

    #[test]
    fn test_auto_approve_at_high_confidence() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock);
        let kartavya = engine
            .propose_niyama(
                "vas-1",
                "obvious",
                "",
                event_trigger("e"),
                notify_action(),
                vec![],
                0.97,
            )
            .unwrap();
        assert_eq!(kartavya.status, KartavyaStatus::Active);
    }

    #[test]
    fn test_event_trigger_fires_with_cooldown() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock.clone());
        let kartavya = engine
            .propose_niyama(
                "vas-1",
                "on-deploy",
                "",
                Trigger::Event {
                    name: "deploy".to_string(),
                    cooldown_ms: 120_000,
                },
                notify_action(),
                vec![],
                0.97,
            )
            .unwrap();

        let mut events = HashSet::new();
        events.insert("deploy".to_string());
        let ctx = |now| TriggerContext {
            now_ms: now,
            events: events.clone(),
            ..TriggerContext::default()
        };

        let fired = engine.evaluate_triggers(&ctx(clock.now_ms()));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, kartavya.id);

        // Within the cooldown: nothing fires.
        clock.advance(5_000);
        assert!(engine.evaluate_triggers(&ctx(clock.now_ms())).is_empty());

        // After the cooldown: fires again.
        clock.advance(130_000);
        assert_eq!(engine.evaluate_triggers(&ctx(clock.now_ms())).len(), 1);
    }

    #[test]
    fn test_hourly_rate_cap() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = KartavyaEngine::new(
            clock.clone() as Arc<dyn Clock>,
            KartavyaConfig {
                max_executions_per_hour: 3,
                ..KartavyaConfig::default()
            },
        );
        engine
            .propose_niyama(
                "vas-1",
                "chatty",
                "",
                event_trigger("tick"),
                notify_action(),
                vec![],
                0.97,
            )
            .unwrap();

        let mut events = HashSet::new();
        events.insert("tick".to_string());
        let mut fires = 0;
        for _ in 0..6 {
            clock.advance(11_000);
            fires += engine
                .evaluate_triggers(&TriggerContext {
                    now_ms: clock.now_ms(),
                    events: events.clone(),
                    ..TriggerContext::default()
                })
                .len();
        }
        assert_eq!(fires, 3);
    }

    #[test]
    fn test_pattern_and_threshold_triggers() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock);
        engine
            .propose_niyama(
                "vas-1",
                "panic-watch",
                "",
                Trigger::Pattern {
                    regex: "panic|stack overflow".to_string(),
                    cooldown_ms: 10_000,
                },
                notify_action(),
                vec![],
                0.97,
            )
            .unwrap();
        engine
            .propose_niyama(
                "vas-2",
                "mem-watch",
                "",
                Trigger::Threshold {
                    metric: "memory_pressure".to_string(),
                    op: ThresholdOp::Ge,
                    value: 0.9,
                    cooldown_ms: 10_000,
                },
                notify_action(),
                vec![],
                0.97,
            )
            .unwrap();

        let mut metrics = HashMap::new();
        metrics.insert("memory_pressure".to_string(), 0.95);
        let fired = engine.evaluate_triggers(&TriggerContext {
            now_ms: 0,
            metrics,
            patterns: vec!["thread 'main' panic at src/lib.rs".to_string()],
            ..TriggerContext::default()
        });
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_default_rta_blocks_destructive_commands() {
        let rta = DefaultRta;
        assert!(rta.check_command("echo hello").is_ok());
        assert!(rta.check_command("rm -rf / --no-preserve-root").is_err());
        assert!(rta.check_command("sudo shutdown -h now").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_notification_record_only() {
        let clock = Arc::new(ManualClock::new(0));
        let dispatcher = KartavyaDispatcher::new(clock.clone() as Arc<dyn Clock>, 4);
        let engine = engine(clock);
        let kartavya = engine
            .propose_niyama(
                "vas-1",
                "notify",
                "",
                event_trigger("e"),
                notify_action(),
                vec![],
                0.97,
            )
            .unwrap();

        let result = dispatcher.dispatch(&kartavya).await;
        assert!(result.success);
        assert_eq!(result.action, "notification");

        let results = dispatcher.get_results(Some(10));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kartavya_id, kartavya.id);
    }

    #[tokio::test]
    async fn test_dispatch_command_disabled_by_default() {
        let clock = Arc::new(ManualClock::new(0));
        let dispatcher = KartavyaDispatcher::new(clock.clone() as Arc<dyn Clock>, 4);
        let engine = engine(clock);
        let kartavya = engine
            .propose_niyama(
                "vas-1",
                "cmd",
                "",
                event_trigger("e"),
                Action::Command {
                    command: "echo hi".to_string(),
                },
                vec![],
                0.97,
            )
            .unwrap();
        let result = dispatcher.dispatch(&kartavya).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("disabled"));
    }
}
