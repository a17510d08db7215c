//! In-process realtime bus: topic channels carrying row changes, broadcast
//! events and presence, shaped like a hosted postgres-changes service.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{AppErr, AppResult};

const CHANNEL_CAPACITY: usize = 256;

/// `presence key -> states tracked under that key`, oldest first.
pub type PresenceSnapshot = HashMap<String, Vec<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub kind:  ChangeKind,
    pub old:   Option<Value>,
    pub new:   Option<Value>,
}

/// `column = value` on a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value:  Value,
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self { column: column.into(), value: value.into() }
    }

    fn matches(&self, row: Option<&Value>) -> bool {
        row.and_then(|r| r.get(&self.column)) == Some(&self.value)
    }
}

#[derive(Debug, Clone)]
struct Binding {
    kind:   ChangeKind,
    table:  String,
    filter: Filter,
}

impl Binding {
    fn matches(&self, change: &RowChange) -> bool {
        if self.kind != change.kind || self.table != change.table {
            return false;
        }
        self.filter.matches(change.new.as_ref())
            || (change.kind != ChangeKind::Insert && self.filter.matches(change.old.as_ref()))
    }
}

#[derive(Debug, Clone)]
enum TopicMessage {
    Broadcast { from: u64, event: String, payload: Value },
    Presence(PresenceSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(RowChange),
    Broadcast { event: String, payload: Value },
    PresenceSync(PresenceSnapshot),
    /// The receiver fell behind and `n` messages were dropped.
    Lagged(u64),
}

/* ------------ per topic: fan-out + presence ------------ */
struct Topic {
    tx:       broadcast::Sender<TopicMessage>,
    presence: HashMap<String, Vec<(u64, Value)>>,
}

impl Topic {
    fn snapshot(&self) -> PresenceSnapshot {
        self.presence
            .iter()
            .map(|(k, metas)| (k.clone(), metas.iter().map(|(_, v)| v.clone()).collect()))
            .collect()
    }
}

struct Inner {
    changes:  broadcast::Sender<RowChange>,
    topics:   RwLock<HashMap<String, Topic>>,
    capacity: usize,
    next_ref: AtomicU64,
    shut:     AtomicBool,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                changes:  broadcast::channel(capacity).0,
                topics:   RwLock::new(HashMap::new()),
                capacity,
                next_ref: AtomicU64::new(1),
                shut:     AtomicBool::new(false),
            }),
        }
    }

    pub fn channel(&self, topic: &str) -> Channel {
        Channel {
            hub:        self.clone(),
            topic:      topic.to_string(),
            key:        uuid::Uuid::new_v4().to_string(),
            bindings:   Vec::new(),
            broadcasts: Vec::new(),
        }
    }

    /// Fans a committed row change out to every subscription.
    pub fn publish_change(&self, change: RowChange) {
        // no receivers is fine; nobody is watching
        let _ = self.inner.changes.send(change);
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, |t| t.tx.receiver_count())
    }

    pub fn presence(&self, topic: &str) -> PresenceSnapshot {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(Topic::snapshot)
            .unwrap_or_default()
    }

    /// Closes every topic and refuses new subscriptions. Open subscriptions
    /// see their channel end.
    pub fn shutdown(&self) {
        self.inner.shut.store(true, Ordering::SeqCst);
        let closed = {
            let mut topics = self.inner.topics.write();
            let n = topics.len();
            topics.clear();
            n
        };
        tracing::info!(topics = closed, "hub shut down");
    }

    fn set_presence(&self, topic: &str, key: &str, presence_ref: u64, state: Option<Value>) {
        let mut topics = self.inner.topics.write();
        let Some(t) = topics.get_mut(topic) else { return };

        let metas = t.presence.entry(key.to_string()).or_default();
        let changed = match state {
            Some(v) => {
                match metas.iter_mut().find(|(r, _)| *r == presence_ref) {
                    Some(slot) => slot.1 = v,
                    None       => metas.push((presence_ref, v)),
                }
                true
            }
            None => {
                let before = metas.len();
                metas.retain(|(r, _)| *r != presence_ref);
                metas.len() != before
            }
        };
        if metas.is_empty() {
            t.presence.remove(key);
        }
        if changed {
            let _ = t.tx.send(TopicMessage::Presence(t.snapshot()));
        }
    }

    fn release(&self, topic: &str) {
        let mut topics = self.inner.topics.write();
        if topics.get(topic).is_some_and(|t| t.tx.receiver_count() == 0) {
            topics.remove(topic);
        }
    }
}

/* ------------ channel builder ------------ */
pub struct Channel {
    hub:        Hub,
    topic:      String,
    key:        String,
    bindings:   Vec<Binding>,
    broadcasts: Vec<String>,
}

impl Channel {
    /// Key under which this connection's presence is grouped.
    pub fn presence_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn on_change(mut self, kind: ChangeKind, table: &str, filter: Filter) -> Self {
        self.bindings.push(Binding { kind, table: table.to_string(), filter });
        self
    }

    pub fn on_broadcast(mut self, event: &str) -> Self {
        self.broadcasts.push(event.to_string());
        self
    }

    pub fn subscribe(self) -> AppResult<Subscription> {
        if self.topic.is_empty() {
            return Err(AppErr::Bus("topic must not be empty".into()));
        }
        let hub = self.hub;
        if hub.inner.shut.load(Ordering::SeqCst) {
            return Err(AppErr::Bus("hub is shut down".into()));
        }
        let presence_ref = hub.inner.next_ref.fetch_add(1, Ordering::Relaxed);

        let changes = hub.inner.changes.subscribe();
        let topic_rx = {
            let mut topics = hub.inner.topics.write();
            topics
                .entry(self.topic.clone())
                .or_insert_with(|| Topic {
                    tx:       broadcast::channel(hub.inner.capacity).0,
                    presence: HashMap::new(),
                })
                .tx
                .subscribe()
        };
        tracing::debug!(topic = %self.topic, presence_ref, "channel subscribed");

        Ok(Subscription {
            hub,
            topic: self.topic,
            key: self.key,
            presence_ref,
            bindings: self.bindings,
            broadcasts: self.broadcasts,
            rx: Some((changes, topic_rx)),
            tracked: false,
        })
    }
}

enum Polled {
    Change(Result<RowChange, RecvError>),
    Topic(Result<TopicMessage, RecvError>),
}

/* ------------ live subscription ------------ */
pub struct Subscription {
    hub:          Hub,
    topic:        String,
    key:          String,
    presence_ref: u64,
    bindings:     Vec<Binding>,
    broadcasts:   Vec<String>,
    rx:           Option<(broadcast::Receiver<RowChange>, broadcast::Receiver<TopicMessage>)>,
    tracked:      bool,
}

impl Subscription {
    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Publishes (or replaces) this connection's presence state.
    pub fn track<S: Serialize>(&mut self, state: &S) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppErr::Bus("channel is closed".into()));
        }
        let value = serde_json::to_value(state).map_err(crate::error::bus)?;
        self.hub.set_presence(&self.topic, &self.key, self.presence_ref, Some(value));
        self.tracked = true;
        Ok(())
    }

    pub fn untrack(&mut self) {
        if std::mem::take(&mut self.tracked) {
            self.hub.set_presence(&self.topic, &self.key, self.presence_ref, None);
        }
    }

    /// Sends an event to every other subscriber of the topic.
    pub fn send_broadcast(&self, event: &str, payload: Value) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppErr::Bus("channel is closed".into()));
        }
        let topics = self.hub.inner.topics.read();
        let t = topics
            .get(&self.topic)
            .ok_or_else(|| AppErr::Bus(format!("topic {} is gone", self.topic)))?;
        let _ = t.tx.send(TopicMessage::Broadcast {
            from: self.presence_ref,
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    /// Next event for one of this channel's bindings; `None` once closed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            let polled = {
                let (changes, topic_rx) = self.rx.as_mut()?;
                tokio::select! {
                    r = changes.recv()  => Polled::Change(r),
                    r = topic_rx.recv() => Polled::Topic(r),
                }
            };
            match polled {
                Polled::Change(Ok(change)) => {
                    if self.bindings.iter().any(|b| b.matches(&change)) {
                        return Some(ChannelEvent::Change(change));
                    }
                }
                Polled::Topic(Ok(TopicMessage::Broadcast { from, event, payload })) => {
                    if from != self.presence_ref && self.broadcasts.contains(&event) {
                        return Some(ChannelEvent::Broadcast { event, payload });
                    }
                }
                Polled::Topic(Ok(TopicMessage::Presence(state))) => {
                    return Some(ChannelEvent::PresenceSync(state));
                }
                Polled::Change(Err(RecvError::Lagged(n)))
                | Polled::Topic(Err(RecvError::Lagged(n))) => return Some(ChannelEvent::Lagged(n)),
                Polled::Change(Err(RecvError::Closed))
                | Polled::Topic(Err(RecvError::Closed)) => {
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Untracks presence and leaves the topic. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.untrack();
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.hub.release(&self.topic);
            tracing::debug!(topic = %self.topic, presence_ref = self.presence_ref, "channel closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
