//! Samiti — the inter-agent pub/sub hub.
//!
//! Channels are ring-buffered, TTL-bounded message boards that agents
//! broadcast observations into and listen on. Five defaults exist from
//! boot (`#security`, `#performance`, `#correctness`, `#style`,
//! `#alerts`); further channels are created explicitly up to the hub cap.
//!
//! Broadcasts are totally ordered by arrival within a channel. Live
//! listeners are invoked in registration order and in isolation: one
//! listener panicking never skips the others. Expired messages are evicted
//! lazily on [`listen`](Samiti::listen) and eagerly by
//! [`prune_expired`](Samiti::prune_expired).
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chitragupta::chitragupta::clock::system_clock;
//! use chitragupta::chitragupta::samiti::{MessageDraft, Samiti, Severity};
//!
//! let hub = Samiti::new(system_clock());
//! hub.subscribe("#alerts", "agent-1").unwrap();
//! let msg = hub
//!     .broadcast(
//!         "#alerts",
//!         MessageDraft::new("agent-1", Severity::Warning, "disk", "disk 90% full"),
//!     )
//!     .unwrap();
//! assert!(msg.id.starts_with("sam-"));
//! ```

use crate::chitragupta::clock::Clock;
use crate::chitragupta::ids::short_id;
use crate::chitragupta::ring::RingBuffer;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Hard ceilings from the resource model.
pub const MAX_CHANNELS: usize = 100;
pub const MAX_SUBSCRIBERS_PER_CHANNEL: usize = 50;
pub const MAX_HISTORY_PER_CHANNEL: usize = 10_000;
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_HISTORY: usize = 1_000;

/// Message urgency, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A message delivered through a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// `sam-` prefixed FNV id of (channel, sender, content, timestamp).
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub severity: Severity,
    pub category: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    pub timestamp_ms: u64,
    /// 0 = never expires.
    pub ttl_ms: u64,
}

impl ChannelMessage {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_ms > 0 && now_ms > self.timestamp_ms + self.ttl_ms
    }
}

/// Caller-supplied fields of a broadcast; the hub assigns id, timestamp,
/// and the default TTL.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: String,
    pub severity: Severity,
    pub category: String,
    pub content: String,
    pub data: Option<serde_json::Value>,
    pub references: Vec<String>,
    /// Overrides the 24 h default when set; 0 means never expire.
    pub ttl_ms: Option<u64>,
}

impl MessageDraft {
    pub fn new(
        sender: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            severity,
            category: category.into(),
            content: content.into(),
            data: None,
            references: Vec::new(),
            ttl_ms: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Filters for [`Samiti::listen`].
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Keep messages at or above this severity.
    pub severity: Option<Severity>,
    /// Keep messages with `timestamp_ms >= since_ms`.
    pub since_ms: Option<u64>,
    /// Truncate to the newest `limit` messages.
    pub limit: Option<usize>,
}

/// Channel metadata snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub description: String,
    pub created_at_ms: u64,
    pub subscriber_count: usize,
    pub message_count: usize,
    pub max_history: usize,
}

/// Hub operation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamitiError {
    DuplicateChannel(String),
    ChannelCapReached,
    UnknownChannel(String),
    SubscriberCapReached(String),
    MessageTooLarge(usize),
    Destroyed,
}

impl fmt::Display for SamitiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamitiError::DuplicateChannel(name) => write!(f, "channel already exists: {}", name),
            SamitiError::ChannelCapReached => {
                write!(f, "hub already has {} channels", MAX_CHANNELS)
            }
            SamitiError::UnknownChannel(name) => write!(f, "unknown channel: {}", name),
            SamitiError::SubscriberCapReached(name) => {
                write!(f, "channel {} already has {} subscribers", name, MAX_SUBSCRIBERS_PER_CHANNEL)
            }
            SamitiError::MessageTooLarge(size) => {
                write!(f, "message of {} bytes exceeds the 1 MiB cap", size)
            }
            SamitiError::Destroyed => write!(f, "hub has been destroyed"),
        }
    }
}

impl Error for SamitiError {}

/// Callback invoked for every broadcast on a channel.
pub type ChannelListener = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

struct Channel {
    description: String,
    created_at_ms: u64,
    subscribers: HashSet<String>,
    ring: RingBuffer<ChannelMessage>,
    listeners: Vec<(u64, ChannelListener)>,
}

struct Hub {
    channels: HashMap<String, Channel>,
    destroyed: bool,
}

/// The pub/sub hub. All operations are synchronous and internally
/// serialized; listener delivery happens outside the hub lock but under a
/// dedicated delivery lock so broadcast N is always observed before N+1.
pub struct Samiti {
    clock: Arc<dyn Clock>,
    listener_seq: AtomicU64,
    inner: Mutex<Hub>,
    delivery: Mutex<()>,
}

/// Channels every hub starts with.
pub const DEFAULT_CHANNELS: [&str; 5] = [
    "#security",
    "#performance",
    "#correctness",
    "#style",
    "#alerts",
];

impl Samiti {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        let mut channels = HashMap::new();
        for name in DEFAULT_CHANNELS.iter() {
            channels.insert(
                (*name).to_string(),
                Channel {
                    description: format!("default {} channel", &name[1..]),
                    created_at_ms: now,
                    subscribers: HashSet::new(),
                    ring: RingBuffer::new(DEFAULT_HISTORY),
                    listeners: Vec::new(),
                },
            );
        }
        Self {
            clock,
            listener_seq: AtomicU64::new(0),
            inner: Mutex::new(Hub {
                channels,
                destroyed: false,
            }),
            delivery: Mutex::new(()),
        }
    }

    fn check_alive(hub: &Hub) -> Result<(), SamitiError> {
        if hub.destroyed {
            Err(SamitiError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Create a channel. Fails on a duplicate name or when the hub cap is
    /// reached. `max_history` is clamped into `[1, 10_000]`.
    pub fn create_channel(
        &self,
        name: &str,
        description: &str,
        max_history: Option<usize>,
    ) -> Result<(), SamitiError> {
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        if hub.channels.contains_key(name) {
            return Err(SamitiError::DuplicateChannel(name.to_string()));
        }
        if hub.channels.len() >= MAX_CHANNELS {
            return Err(SamitiError::ChannelCapReached);
        }
        let capacity = max_history
            .unwrap_or(DEFAULT_HISTORY)
            .clamp(1, MAX_HISTORY_PER_CHANNEL);
        hub.channels.insert(
            name.to_string(),
            Channel {
                description: description.to_string(),
                created_at_ms: self.clock.now_ms(),
                subscribers: HashSet::new(),
                ring: RingBuffer::new(capacity),
                listeners: Vec::new(),
            },
        );
        log::debug!("samiti: created channel {}", name);
        Ok(())
    }

    /// Remove a channel and everything in it.
    pub fn delete_channel(&self, name: &str) -> Result<(), SamitiError> {
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        hub.channels
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SamitiError::UnknownChannel(name.to_string()))
    }

    /// Subscribe an agent. Idempotent; enforces the per-channel cap.
    pub fn subscribe(&self, channel: &str, agent_id: &str) -> Result<(), SamitiError> {
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get_mut(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;
        if chan.subscribers.contains(agent_id) {
            return Ok(());
        }
        if chan.subscribers.len() >= MAX_SUBSCRIBERS_PER_CHANNEL {
            return Err(SamitiError::SubscriberCapReached(channel.to_string()));
        }
        chan.subscribers.insert(agent_id.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, channel: &str, agent_id: &str) -> Result<bool, SamitiError> {
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get_mut(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;
        Ok(chan.subscribers.remove(agent_id))
    }

    /// Attach a live listener; returns a handle for
    /// [`remove_listener`](Samiti::remove_listener).
    ///
    /// Listeners must not call back into the hub from the callback.
    pub fn add_listener(
        &self,
        channel: &str,
        listener: ChannelListener,
    ) -> Result<u64, SamitiError> {
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get_mut(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;
        let id = self.listener_seq.fetch_add(1, Ordering::SeqCst);
        chan.listeners.push((id, listener));
        Ok(id)
    }

    pub fn remove_listener(&self, channel: &str, listener_id: u64) -> Result<bool, SamitiError> {
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get_mut(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;
        let before = chan.listeners.len();
        chan.listeners.retain(|(id, _)| *id != listener_id);
        Ok(chan.listeners.len() < before)
    }

    /// Broadcast a message into a channel.
    ///
    /// Assigns the `sam-` id, timestamp, and default 24 h TTL; enforces the
    /// 1 MiB size cap; appends to the ring; then invokes every live
    /// listener in registration order, each isolated from the others'
    /// panics.
    pub fn broadcast(
        &self,
        channel: &str,
        draft: MessageDraft,
    ) -> Result<ChannelMessage, SamitiError> {
        let now = self.clock.now_ms();
        let data_len = draft
            .data
            .as_ref()
            .map(|d| d.to_string().len())
            .unwrap_or(0);
        let size = draft.content.len() + data_len;
        if size > MAX_MESSAGE_BYTES {
            return Err(SamitiError::MessageTooLarge(size));
        }

        let (message, listeners) = {
            let mut hub = self.inner.lock().unwrap();
            Self::check_alive(&hub)?;
            let chan = hub
                .channels
                .get_mut(channel)
                .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;

            let ts = now.to_string();
            let message = ChannelMessage {
                id: short_id("sam", &[channel, &draft.sender, &draft.content, &ts]),
                channel: channel.to_string(),
                sender: draft.sender,
                severity: draft.severity,
                category: draft.category,
                content: draft.content,
                data: draft.data,
                references: draft.references,
                timestamp_ms: now,
                ttl_ms: draft.ttl_ms.unwrap_or(DEFAULT_TTL_MS),
            };
            chan.ring.push(message.clone());
            let listeners: Vec<ChannelListener> =
                chan.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (message, listeners)
        };

        // Deliver outside the hub lock, under the delivery lock so
        // broadcasts stay totally ordered for listeners.
        let _order = self.delivery.lock().unwrap();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&message)));
            if result.is_err() {
                log::warn!(
                    "samiti: listener on {} panicked; continuing with remaining listeners",
                    channel
                );
            }
        }

        Ok(message)
    }

    /// Filtered, most-recent-first slice of a channel. Expired messages are
    /// pruned before filtering.
    pub fn listen(
        &self,
        channel: &str,
        options: ListenOptions,
    ) -> Result<Vec<ChannelMessage>, SamitiError> {
        let now = self.clock.now_ms();
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get_mut(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;

        chan.ring.retain(|m| !m.is_expired(now));

        let mut messages: Vec<ChannelMessage> = chan
            .ring
            .iter()
            .filter(|m| {
                options.severity.map_or(true, |min| m.severity >= min)
                    && options.since_ms.map_or(true, |since| m.timestamp_ms >= since)
            })
            .cloned()
            .collect();
        messages.reverse();
        if let Some(limit) = options.limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    /// Unfiltered history, oldest-first, optionally truncated to the
    /// newest `limit` messages.
    pub fn get_history(
        &self,
        channel: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChannelMessage>, SamitiError> {
        let hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;
        let mut messages: Vec<ChannelMessage> = chan.ring.iter().cloned().collect();
        if let Some(limit) = limit {
            if messages.len() > limit {
                messages.drain(0..messages.len() - limit);
            }
        }
        Ok(messages)
    }

    /// Scan every channel and delete expired messages. Returns exactly the
    /// number of deleted messages.
    pub fn prune_expired(&self) -> Result<usize, SamitiError> {
        let now = self.clock.now_ms();
        let mut hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let mut removed = 0;
        for chan in hub.channels.values_mut() {
            removed += chan.ring.retain(|m| !m.is_expired(now));
        }
        Ok(removed)
    }

    pub fn get_channel_info(&self, channel: &str) -> Result<ChannelInfo, SamitiError> {
        let hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let chan = hub
            .channels
            .get(channel)
            .ok_or_else(|| SamitiError::UnknownChannel(channel.to_string()))?;
        Ok(ChannelInfo {
            name: channel.to_string(),
            description: chan.description.clone(),
            created_at_ms: chan.created_at_ms,
            subscriber_count: chan.subscribers.len(),
            message_count: chan.ring.len(),
            max_history: chan.ring.capacity(),
        })
    }

    /// Names of all channels, sorted.
    pub fn list_channels(&self) -> Result<Vec<String>, SamitiError> {
        let hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let mut names: Vec<String> = hub.channels.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Channels the given agent subscribes to, sorted.
    pub fn subscriptions_of(&self, agent_id: &str) -> Result<Vec<String>, SamitiError> {
        let hub = self.inner.lock().unwrap();
        Self::check_alive(&hub)?;
        let mut names: Vec<String> = hub
            .channels
            .iter()
            .filter(|(_, c)| c.subscribers.contains(agent_id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Tear the hub down; every subsequent operation fails with
    /// [`SamitiError::Destroyed`].
    pub fn destroy(&self) {
        let mut hub = self.inner.lock().unwrap();
        hub.channels.clear();
        hub.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chitragupta::clock::ManualClock;

    fn hub_with_clock() -> (Samiti, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (Samiti::new(clock.clone() as Arc<dyn Clock>), clock)
    }

    #[test]
    fn test_default_channels_exist() {
        let (hub, _) = hub_with_clock();
        let channels = hub.list_channels().unwrap();
        for name in DEFAULT_CHANNELS.iter() {
            assert!(channels.contains(&(*name).to_string()), "{} missing", name);
        }
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let (hub, _) = hub_with_clock();
        hub.create_channel("#x", "", None).unwrap();
        assert_eq!(
            hub.create_channel("#x", "", None).unwrap_err(),
            SamitiError::DuplicateChannel("#x".to_string())
        );
    }

    #[test]
    fn test_subscribe_idempotent_and_capped() {
        let (hub, _) = hub_with_clock();
        hub.create_channel("#small", "", None).unwrap();
        for i in 0..MAX_SUBSCRIBERS_PER_CHANNEL {
            hub.subscribe("#small", &format!("agent-{}", i)).unwrap();
        }
        // Re-subscribing an existing agent succeeds.
        hub.subscribe("#small", "agent-0").unwrap();
        // A new one is over the cap.
        assert_eq!(
            hub.subscribe("#small", "agent-new").unwrap_err(),
            SamitiError::SubscriberCapReached("#small".to_string())
        );
    }

    #[test]
    fn test_message_too_large() {
        let (hub, _) = hub_with_clock();
        let draft = MessageDraft::new("a", Severity::Info, "c", "x".repeat(MAX_MESSAGE_BYTES + 1));
        match hub.broadcast("#alerts", draft).unwrap_err() {
            SamitiError::MessageTooLarge(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_listener_isolation_and_order() {
        let (hub, _) = hub_with_clock();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let seen1 = Arc::clone(&seen);
        hub.add_listener("#alerts", Arc::new(move |_m| {
            seen1.lock().unwrap().push("first");
            panic!("listener blew up");
        }))
        .unwrap();
        let seen2 = Arc::clone(&seen);
        hub.add_listener("#alerts", Arc::new(move |_m| {
            seen2.lock().unwrap().push("second");
        }))
        .unwrap();

        hub.broadcast("#alerts", MessageDraft::new("a", Severity::Info, "c", "m"))
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["first", "second"]);
    }

    #[test]
    fn test_listen_filters() {
        let (hub, clock) = hub_with_clock();
        hub.broadcast("#alerts", MessageDraft::new("a", Severity::Info, "c", "one"))
            .unwrap();
        clock.advance(10);
        hub.broadcast(
            "#alerts",
            MessageDraft::new("a", Severity::Critical, "c", "two"),
        )
        .unwrap();

        let critical = hub
            .listen(
                "#alerts",
                ListenOptions {
                    severity: Some(Severity::Critical),
                    ..ListenOptions::default()
                },
            )
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].content, "two");

        let newest_first = hub.listen("#alerts", ListenOptions::default()).unwrap();
        assert_eq!(newest_first[0].content, "two");
        assert_eq!(newest_first[1].content, "one");
    }

    #[test]
    fn test_destroyed_hub_fails_everything() {
        let (hub, _) = hub_with_clock();
        hub.destroy();
        assert_eq!(hub.list_channels().unwrap_err(), SamitiError::Destroyed);
        assert_eq!(
            hub.broadcast("#alerts", MessageDraft::new("a", Severity::Info, "c", "m"))
                .unwrap_err(),
            SamitiError::Destroyed
        );
    }
}
