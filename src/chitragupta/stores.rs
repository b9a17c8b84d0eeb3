//! External collaborator contracts: sessions, memory, embeddings, processes.
//!
//! The runtime core treats these as injected handles. Sessions are opaque
//! append-only logs; memory is a scoped key → content store; embeddings back
//! fact de-duplication and retrieval indexing; the process pool executes
//! shell commands with bounded concurrency and a hard timeout. In-memory
//! implementations live here for tests and single-process hosts; anything
//! that honors the trait contracts is conforming.

use crate::chitragupta::clock::Clock;
use crate::chitragupta::ids::fnv1a_32;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Failure surfaced by a collaborator store.
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(String),
    Io(String),
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Io(msg) => write!(f, "store I/O error: {}", msg),
            StoreError::Other(msg) => write!(f, "store error: {}", msg),
        }
    }
}

impl Error for StoreError {}

// ---- Session store ----

/// One turn in a session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTurn {
    pub role: String,
    pub content: String,
    pub agent: String,
    pub model: String,
    pub timestamp_ms: u64,
}

/// A session: an opaque append-only log plus identifying metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project: String,
    pub branch: Option<String>,
    pub title: String,
    pub created_at_ms: u64,
    pub turns: Vec<SessionTurn>,
    pub metadata: HashMap<String, String>,
}

/// Append-only session log contract.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        project: &str,
        agent: &str,
        title: &str,
    ) -> Result<String, StoreError>;

    async fn list_sessions(&self, project: &str) -> Result<Vec<String>, StoreError>;

    /// Sessions created on `date` (`YYYY-MM-DD`, UTC), any project.
    async fn list_sessions_by_date(&self, date: &str) -> Result<Vec<String>, StoreError>;

    async fn load_session(&self, id: &str, project: &str)
        -> Result<Option<Session>, StoreError>;

    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn add_turn(
        &self,
        session_id: &str,
        turn_id: &str,
        turn: SessionTurn,
    ) -> Result<(), StoreError>;

    async fn list_turns_with_timestamps(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionTurn>, StoreError>;
}

/// Mutex-backed session store for tests and single-process hosts.
pub struct InMemorySessionStore {
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

fn date_of_ms(ms: u64) -> String {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        project: &str,
        agent: &str,
        title: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut metadata = HashMap::new();
        metadata.insert("agent".to_string(), agent.to_string());
        let session = Session {
            id: id.clone(),
            project: project.to_string(),
            branch: None,
            title: title.to_string(),
            created_at_ms: self.clock.now_ms(),
            turns: Vec::new(),
            metadata,
        };
        self.sessions.lock().unwrap().insert(id.clone(), session);
        Ok(id)
    }

    async fn list_sessions(&self, project: &str) -> Result<Vec<String>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        let mut ids: Vec<(u64, String)> = sessions
            .values()
            .filter(|s| s.project == project)
            .map(|s| (s.created_at_ms, s.id.clone()))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_sessions_by_date(&self, date: &str) -> Result<Vec<String>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        let mut ids: Vec<(u64, String)> = sessions
            .values()
            .filter(|s| date_of_ms(s.created_at_ms) == date)
            .map(|s| (s.created_at_ms, s.id.clone()))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn load_session(
        &self,
        id: &str,
        _project: &str,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.lock().unwrap().get(id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn add_turn(
        &self,
        session_id: &str,
        _turn_id: &str,
        turn: SessionTurn,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        session.turns.push(turn);
        Ok(())
    }

    async fn list_turns_with_timestamps(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionTurn>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        Ok(session.turns.clone())
    }
}

// ---- Memory store ----

/// Where a memory entry lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum MemoryScope {
    Global,
    Project(String),
    Agent(String),
    Session(String),
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryScope::Global => write!(f, "global"),
            MemoryScope::Project(p) => write!(f, "project:{}", p),
            MemoryScope::Agent(a) => write!(f, "agent:{}", a),
            MemoryScope::Session(s) => write!(f, "session:{}", s),
        }
    }
}

/// One search hit from [`MemoryStore::search`].
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub scope: MemoryScope,
    pub key: String,
    pub content: String,
}

/// Scoped key → content store.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get(&self, scope: &MemoryScope, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite the entry.
    async fn update(
        &self,
        scope: &MemoryScope,
        key: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Append a timestamped entry line.
    async fn append(&self, scope: &MemoryScope, key: &str, entry: &str)
        -> Result<(), StoreError>;

    async fn delete(&self, scope: &MemoryScope, key: &str) -> Result<bool, StoreError>;

    async fn list_scopes(&self) -> Result<Vec<MemoryScope>, StoreError>;

    /// Case-insensitive substring search across all scopes.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, StoreError>;
}

/// Mutex-backed memory store for tests and single-process hosts.
pub struct InMemoryMemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<(MemoryScope, String), String>>,
}

impl InMemoryMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn get(&self, scope: &MemoryScope, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(scope.clone(), key.to_string()))
            .cloned())
    }

    async fn update(
        &self,
        scope: &MemoryScope,
        key: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert((scope.clone(), key.to_string()), content.to_string());
        Ok(())
    }

    async fn append(
        &self,
        scope: &MemoryScope,
        key: &str,
        entry: &str,
    ) -> Result<(), StoreError> {
        let stamp = self.clock.now_ms();
        let mut entries = self.entries.lock().unwrap();
        let slot = entries
            .entry((scope.clone(), key.to_string()))
            .or_default();
        if !slot.is_empty() {
            slot.push('\n');
        }
        slot.push_str(&format!("[{}] {}", stamp, entry));
        Ok(())
    }

    async fn delete(&self, scope: &MemoryScope, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .remove(&(scope.clone(), key.to_string()))
            .is_some())
    }

    async fn list_scopes(&self) -> Result<Vec<MemoryScope>, StoreError> {
        let entries = self.entries.lock().unwrap();
        let mut scopes: Vec<MemoryScope> = Vec::new();
        for (scope, _) in entries.keys() {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        Ok(scopes)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, StoreError> {
        let needle = query.to_lowercase();
        let entries = self.entries.lock().unwrap();
        let mut hits = Vec::new();
        for ((scope, key), content) in entries.iter() {
            if content.to_lowercase().contains(&needle) || key.to_lowercase().contains(&needle) {
                hits.push(MemoryHit {
                    scope: scope.clone(),
                    key: key.clone(),
                    content: content.clone(),
                });
                if hits.len() >= limit {
                    break;
                }
            }
        }
        Ok(hits)
    }
}

// ---- Embedding provider ----

/// Text → vector contract used by fact extraction and retrieval indexing.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Vector dimension this provider produces.
    fn dimension(&self) -> usize;

    /// Longest input the underlying model accepts, in tokens.
    fn max_tokens(&self) -> usize;
}

/// Deterministic local embedder: hashed bag-of-words, L2-normalized.
///
/// Not a semantic model — it exists so de-duplication and similarity
/// thresholds behave deterministically in tests and offline hosts.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let mut vector = vec![0f32; self.dimension];
        for word in text.to_lowercase().split_whitespace() {
            let bucket = (fnv1a_32(word.as_bytes()) as usize) % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_tokens(&self) -> usize {
        8_192
    }
}

/// Cosine similarity of two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// ---- Process pool ----

/// Result of one shell command.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// True when the command was killed on timeout.
    pub killed: bool,
}

/// Bounded-concurrency shell executor with a per-command timeout.
#[async_trait]
pub trait ProcessPool: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ProcessOutput, StoreError>;
}

/// Tokio-backed process pool: FIFO admission through a semaphore, commands
/// run under `sh -c`, killed when the timeout elapses.
pub struct TokioProcessPool {
    permits: Semaphore,
}

impl TokioProcessPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }
}

#[async_trait]
impl ProcessPool for TokioProcessPool {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ProcessOutput, StoreError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoreError::Io(e.to_string()))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                let output = result.map_err(|e| StoreError::Io(e.to_string()))?;
                Ok(ProcessOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                    killed: false,
                })
            }
            Err(_) => Ok(ProcessOutput {
                stdout: String::new(),
                stderr: format!("command timed out after {:?}", timeout),
                exit_code: -1,
                killed: true,
            }),
        }
    }
}
