//! KaalaBrahma — the agent lifecycle and health registry.
//!
//! Every agent registers here at spawn and heartbeats while it runs.
//! [`sweep`](KaalaBrahma::sweep) ages records through
//! alive → stale → dead against the configured thresholds and fires the
//! status-change listeners on every transition. `kill_agent` evicts an
//! agent and its registered descendants; `heal` resurrects a record that
//! turned stale or dead while its agent was merely busy.

use crate::chitragupta::clock::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry-side view of an agent's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Alive,
    Stale,
    Dead,
}

/// One agent's health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent_id: String,
    pub status: AgentHealth,
    pub depth: usize,
    pub parent_id: Option<String>,
    pub purpose: String,
    pub last_heartbeat_ms: u64,
    pub first_seen_ms: u64,
}

/// Aggregate snapshot returned by [`KaalaBrahma::tree_health`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeHealth {
    pub total: usize,
    pub alive: usize,
    pub stale: usize,
    pub dead: usize,
    pub records: Vec<HealthRecord>,
}

/// Result of [`KaalaBrahma::kill_agent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillReport {
    /// Records evicted: the agent itself plus registered descendants.
    pub freed: usize,
}

/// Fired on every status transition: `(agent_id, from, to)`.
pub type StatusListener = Arc<dyn Fn(&str, AgentHealth, AgentHealth) + Send + Sync>;

/// The health registry.
pub struct KaalaBrahma {
    clock: Arc<dyn Clock>,
    stale_ms: u64,
    dead_ms: u64,
    records: Mutex<HashMap<String, HealthRecord>>,
    listeners: Mutex<Vec<StatusListener>>,
}

impl KaalaBrahma {
    pub fn new(clock: Arc<dyn Clock>, stale_ms: u64, dead_ms: u64) -> Self {
        Self {
            clock,
            stale_ms,
            dead_ms: dead_ms.max(stale_ms),
            records: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Attach a status-change listener; fired on every transition.
    pub fn on_status_change(&self, listener: StatusListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn fire(&self, agent_id: &str, from: AgentHealth, to: AgentHealth) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(agent_id, from, to);
        }
    }

    /// Register an agent; re-registering refreshes the heartbeat.
    pub fn register(
        &self,
        agent_id: &str,
        depth: usize,
        parent_id: Option<&str>,
        purpose: &str,
    ) {
        let now = self.clock.now_ms();
        let mut records = self.records.lock().unwrap();
        records.insert(
            agent_id.to_string(),
            HealthRecord {
                agent_id: agent_id.to_string(),
                status: AgentHealth::Alive,
                depth,
                parent_id: parent_id.map(|s| s.to_string()),
                purpose: purpose.to_string(),
                last_heartbeat_ms: now,
                first_seen_ms: now,
            },
        );
    }

    /// Refresh an agent's heartbeat; false when the agent is unknown.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        let now = self.clock.now_ms();
        let transition = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(agent_id) {
                Some(record) => {
                    record.last_heartbeat_ms = now;
                    let from = record.status;
                    record.status = AgentHealth::Alive;
                    Some(from)
                }
                None => None,
            }
        };
        match transition {
            Some(from) => {
                if from != AgentHealth::Alive {
                    self.fire(agent_id, from, AgentHealth::Alive);
                }
                true
            }
            None => false,
        }
    }

    /// Age every record against the thresholds, firing listeners on each
    /// transition. Returns the number of transitions applied.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut transitions: Vec<(String, AgentHealth, AgentHealth)> = Vec::new();
        {
            let mut records = self.records.lock().unwrap();
            for record in records.values_mut() {
                let age = now.saturating_sub(record.last_heartbeat_ms);
                let next = if age > self.dead_ms {
                    AgentHealth::Dead
                } else if age > self.stale_ms {
                    AgentHealth::Stale
                } else {
                    AgentHealth::Alive
                };
                if next != record.status {
                    transitions.push((record.agent_id.clone(), record.status, next));
                    record.status = next;
                }
            }
        }
        for (agent_id, from, to) in &transitions {
            self.fire(agent_id, *from, *to);
        }
        transitions.len()
    }

    pub fn status_of(&self, agent_id: &str) -> Option<AgentHealth> {
        self.records
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|r| r.status)
    }

    /// Evict an agent and every registered descendant.
    pub fn kill_agent(&self, agent_id: &str) -> KillReport {
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(agent_id) {
            return KillReport { freed: 0 };
        }
        // Collect the subtree by walking parent links.
        let mut doomed = vec![agent_id.to_string()];
        let mut index = 0;
        while index < doomed.len() {
            let current = doomed[index].clone();
            for record in records.values() {
                if record.parent_id.as_deref() == Some(current.as_str())
                    && !doomed.contains(&record.agent_id)
                {
                    doomed.push(record.agent_id.clone());
                }
            }
            index += 1;
        }
        for id in &doomed {
            records.remove(id);
        }
        log::info!("kaala-brahma: killed {} freeing {} records", agent_id, doomed.len());
        KillReport { freed: doomed.len() }
    }

    /// Reset a record to alive with a fresh heartbeat.
    pub fn heal(&self, agent_id: &str) -> bool {
        let now = self.clock.now_ms();
        let transition = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(agent_id) {
                Some(record) => {
                    let from = record.status;
                    record.status = AgentHealth::Alive;
                    record.last_heartbeat_ms = now;
                    Some(from)
                }
                None => None,
            }
        };
        match transition {
            Some(from) => {
                if from != AgentHealth::Alive {
                    self.fire(agent_id, from, AgentHealth::Alive);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every dead record; returns the number removed.
    pub fn prune_dead(&self) -> usize {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.status != AgentHealth::Dead);
        before - records.len()
    }

    /// Aggregate health snapshot, records sorted by depth then id.
    pub fn tree_health(&self) -> TreeHealth {
        let records = self.records.lock().unwrap();
        let mut list: Vec<HealthRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.agent_id.cmp(&b.agent_id)));
        TreeHealth {
            total: list.len(),
            alive: list.iter().filter(|r| r.status == AgentHealth::Alive).count(),
            stale: list.iter().filter(|r| r.status == AgentHealth::Stale).count(),
            dead: list.iter().filter(|r| r.status == AgentHealth::Dead).count(),
            records: list,
        }
    }
}
