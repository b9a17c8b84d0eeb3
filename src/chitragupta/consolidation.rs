//! Per-date consolidation of session logs.
//!
//! Compacts one day's sessions into a single record: a rule-based event
//! chain per session (tool invocations, decisions, errors, commits, facts,
//! preferences), grouped by project, plus personal facts de-duplicated by
//! embedding similarity. The consolidated record is written through the
//! memory store keyed by date and later participates in hierarchical
//! retrieval. Consolidation is idempotent unless forced.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::stores::{
    cosine_similarity, EmbeddingProvider, MemoryScope, MemoryStore, SessionStore, SessionTurn,
    StoreError,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Two facts above this cosine similarity are considered duplicates.
const FACT_DEDUP_THRESHOLD: f32 = 0.92;

/// What a session turn contributed to the event chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    ToolInvocation,
    Decision,
    Error,
    Commit,
    Fact,
    Preference,
}

/// One extracted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub detail: String,
    pub timestamp_ms: u64,
}

/// Per-project slice of the consolidated record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDigest {
    pub sessions: usize,
    pub turns: usize,
    pub events: Vec<SessionEvent>,
}

/// The record written to the memory store, keyed by date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedDay {
    pub date: String,
    pub projects: BTreeMap<String, ProjectDigest>,
    pub facts: Vec<String>,
}

/// Summary returned by [`DayConsolidator::consolidate_day`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationResult {
    pub date: String,
    /// Memory-store key the record was written under.
    pub key: String,
    pub sessions_processed: usize,
    pub project_count: usize,
    pub total_turns: usize,
    pub extracted_facts: Vec<String>,
    pub duration_ms: u64,
}

lazy_static! {
    static ref RE_COMMIT: Regex =
        Regex::new(r"(?i)\bcommit(ted)?\b|\b[0-9a-f]{7,40}\b").unwrap();
    static ref RE_ERROR: Regex =
        Regex::new(r"(?i)\berror\b|\bfailed\b|\bpanic(ked)?\b|\bexception\b").unwrap();
    static ref RE_DECISION: Regex =
        Regex::new(r"(?i)\bdecided to\b|\bwe will\b|\bchoosing\b|\bdecision:\b").unwrap();
    static ref RE_TOOL: Regex =
        Regex::new(r"(?i)\b(ran|executed|invoked|calling)\b.*\b(tool|command|grep|tests?)\b")
            .unwrap();
    static ref RE_FACT: Regex =
        Regex::new(r"(?i)\bmy name is\b|\bi am a\b|\bi work\b|\bi live\b|\bmy team\b").unwrap();
    static ref RE_PREFERENCE: Regex =
        Regex::new(r"(?i)\bi prefer\b|\bi like\b|\balways use\b|\bnever use\b").unwrap();
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.len() <= max {
        line.to_string()
    } else {
        let cut = line
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(line.len());
        line[..cut].to_string()
    }
}

/// Rule-based event extraction from one session turn.
pub fn extract_events(turn: &SessionTurn) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    let detail = first_line(&turn.content, 160);
    let mut push = |kind| {
        events.push(SessionEvent {
            kind,
            detail: detail.clone(),
            timestamp_ms: turn.timestamp_ms,
        })
    };

    if turn.role == "tool" || RE_TOOL.is_match(&turn.content) {
        push(SessionEventKind::ToolInvocation);
    }
    if RE_DECISION.is_match(&turn.content) {
        push(SessionEventKind::Decision);
    }
    if RE_ERROR.is_match(&turn.content) {
        push(SessionEventKind::Error);
    }
    if RE_COMMIT.is_match(&turn.content) {
        push(SessionEventKind::Commit);
    }
    // Facts and preferences only come from what the user said.
    if turn.role == "user" {
        if RE_FACT.is_match(&turn.content) {
            push(SessionEventKind::Fact);
        }
        if RE_PREFERENCE.is_match(&turn.content) {
            push(SessionEventKind::Preference);
        }
    }
    events
}

/// The consolidation engine.
pub struct DayConsolidator {
    sessions: Arc<dyn SessionStore>,
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
}

impl DayConsolidator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            memory,
            embedder,
            clock,
        }
    }

    fn key_for(date: &str) -> String {
        format!("consolidated/{}", date)
    }

    /// De-duplicate facts by embedding cosine similarity, keeping first
    /// occurrences.
    async fn dedup_facts(&self, facts: Vec<String>) -> Result<Vec<String>, StoreError> {
        let mut kept: Vec<String> = Vec::new();
        let mut kept_vectors: Vec<Vec<f32>> = Vec::new();
        for fact in facts {
            let vector = self.embedder.embed(&fact).await?;
            let duplicate = kept_vectors
                .iter()
                .any(|existing| cosine_similarity(existing, &vector) >= FACT_DEDUP_THRESHOLD);
            if !duplicate {
                kept.push(fact);
                kept_vectors.push(vector);
            }
        }
        Ok(kept)
    }

    /// Consolidate every session created on `date` (`YYYY-MM-DD`, UTC).
    ///
    /// When a consolidated record already exists and `force` is false the
    /// existing record is left untouched and the result reports zero
    /// sessions processed.
    pub async fn consolidate_day(
        &self,
        date: &str,
        force: bool,
    ) -> Result<ConsolidationResult, StoreError> {
        let started = self.clock.now_ms();
        let key = Self::key_for(date);

        if !force {
            if let Some(existing) = self.memory.get(&MemoryScope::Global, &key).await? {
                let record: ConsolidatedDay = serde_json::from_str(&existing)
                    .map_err(|e| StoreError::Other(format!("corrupt consolidated record: {}", e)))?;
                return Ok(ConsolidationResult {
                    date: date.to_string(),
                    key,
                    sessions_processed: 0,
                    project_count: record.projects.len(),
                    total_turns: 0,
                    extracted_facts: record.facts,
                    duration_ms: self.clock.now_ms().saturating_sub(started),
                });
            }
        }

        let session_ids = self.sessions.list_sessions_by_date(date).await?;
        let mut projects: BTreeMap<String, ProjectDigest> = BTreeMap::new();
        let mut facts: Vec<String> = Vec::new();
        let mut total_turns = 0usize;

        for session_id in &session_ids {
            let session = match self.sessions.load_session(session_id, "").await? {
                Some(session) => session,
                None => continue,
            };
            let digest = projects.entry(session.project.clone()).or_default();
            digest.sessions += 1;
            digest.turns += session.turns.len();
            total_turns += session.turns.len();

            for turn in &session.turns {
                for event in extract_events(turn) {
                    if matches!(
                        event.kind,
                        SessionEventKind::Fact | SessionEventKind::Preference
                    ) {
                        facts.push(event.detail.clone());
                    }
                    digest.events.push(event);
                }
            }
        }

        let facts = self.dedup_facts(facts).await?;
        let record = ConsolidatedDay {
            date: date.to_string(),
            projects,
            facts: facts.clone(),
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        self.memory
            .update(&MemoryScope::Global, &key, &json)
            .await?;
        log::info!(
            "consolidated {}: {} sessions, {} projects, {} facts",
            date,
            session_ids.len(),
            record.projects.len(),
            facts.len()
        );

        Ok(ConsolidationResult {
            date: date.to_string(),
            key,
            sessions_processed: session_ids.len(),
            project_count: record.projects.len(),
            total_turns,
            extracted_facts: facts,
            duration_ms: self.clock.now_ms().saturating_sub(started),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chitragupta::clock::ManualClock;
    use crate::chitragupta::stores::{HashEmbedder, InMemoryMemoryStore, InMemorySessionStore};

    fn turn(role: &str, content: &str) -> SessionTurn {
        SessionTurn {
            role: role.to_string(),
            content: content.to_string(),
            agent: "root".to_string(),
            model: "haiku-standard".to_string(),
            timestamp_ms: 1,
        }
    }

    #[test]
    fn test_event_extraction_rules() {
        let events = extract_events(&turn("assistant", "I ran the tests and they failed"));
        let kinds: Vec<SessionEventKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&SessionEventKind::ToolInvocation));
        assert!(kinds.contains(&SessionEventKind::Error));

        let fact_events = extract_events(&turn("user", "I prefer tabs over spaces"));
        assert!(fact_events
            .iter()
            .any(|e| e.kind == SessionEventKind::Preference));

        // Preferences from the assistant are not personal facts.
        let not_fact = extract_events(&turn("assistant", "I prefer tabs over spaces"));
        assert!(!not_fact
            .iter()
            .any(|e| e.kind == SessionEventKind::Preference));
    }

    async fn seeded() -> (DayConsolidator, Arc<ManualClock>) {
        // 2023-11-14 UTC.
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let sessions = Arc::new(InMemorySessionStore::new(clock.clone() as Arc<dyn Clock>));
        let memory = Arc::new(InMemoryMemoryStore::new(clock.clone() as Arc<dyn Clock>));
        let embedder = Arc::new(HashEmbedder::new(64));

        let s1 = sessions
            .create_session("alpha", "root", "morning work")
            .await
            .unwrap();
        sessions
            .add_turn(&s1, "t1", turn("user", "I prefer tabs over spaces"))
            .await
            .unwrap();
        sessions
            .add_turn(&s1, "t2", turn("user", "i prefer tabs over spaces"))
            .await
            .unwrap();
        sessions
            .add_turn(&s1, "t3", turn("assistant", "decided to split the module"))
            .await
            .unwrap();

        let s2 = sessions
            .create_session("beta", "root", "afternoon work")
            .await
            .unwrap();
        sessions
            .add_turn(&s2, "t1", turn("assistant", "committed 3f2a9c1 to main"))
            .await
            .unwrap();

        let consolidator = DayConsolidator::new(
            sessions,
            memory,
            embedder,
            clock.clone() as Arc<dyn Clock>,
        );
        (consolidator, clock)
    }

    #[tokio::test]
    async fn test_consolidate_day_groups_and_dedups() {
        let (consolidator, _) = seeded().await;
        let result = consolidator.consolidate_day("2023-11-14", false).await.unwrap();
        assert_eq!(result.sessions_processed, 2);
        assert_eq!(result.project_count, 2);
        assert_eq!(result.total_turns, 4);
        // The two near-identical preference lines collapse into one fact.
        assert_eq!(result.extracted_facts.len(), 1);
        assert!(result.key.ends_with("2023-11-14"));
    }

    #[tokio::test]
    async fn test_consolidation_is_idempotent_unless_forced() {
        let (consolidator, _) = seeded().await;
        let first = consolidator.consolidate_day("2023-11-14", false).await.unwrap();
        assert_eq!(first.sessions_processed, 2);

        let second = consolidator.consolidate_day("2023-11-14", false).await.unwrap();
        assert_eq!(second.sessions_processed, 0);
        assert_eq!(second.project_count, 2);

        let forced = consolidator.consolidate_day("2023-11-14", true).await.unwrap();
        assert_eq!(forced.sessions_processed, 2);
    }

    #[tokio::test]
    async fn test_empty_day() {
        let (consolidator, _) = seeded().await;
        let result = consolidator.consolidate_day("1999-01-01", false).await.unwrap();
        assert_eq!(result.sessions_processed, 0);
        assert_eq!(result.project_count, 0);
        assert!(result.extracted_facts.is_empty());
    }
}
