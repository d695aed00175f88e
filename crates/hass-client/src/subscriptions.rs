//! Event subscription registry.
//!
//! One server subscription is held per topic no matter how many local
//! listeners are attached to it. The registry survives reconnects; after a
//! new session is authenticated the topics are replayed and their server
//! subscription ids refreshed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hass_wire::EventResultInfo;
use parking_lot::Mutex;

/// What a listener subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// All event types.
    Any,
    /// A single named event type, e.g. `state_changed`.
    Event(String),
}

impl Topic {
    /// Event type to put on the wire, `None` for the wildcard.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::Any => None,
            Self::Event(name) => Some(name),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Event(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        if value == "*" {
            Self::Any
        } else {
            Self::Event(value.to_owned())
        }
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        if value == "*" {
            Self::Any
        } else {
            Self::Event(value)
        }
    }
}

/// Handle identifying one registered event listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type EventCallback = Arc<dyn Fn(&EventResultInfo) + Send + Sync>;

struct TopicSubscription {
    subscription_id: u64,
    listeners: Vec<(ListenerId, EventCallback)>,
}

/// Outcome of detaching a listener.
pub(crate) struct ListenerRemoval {
    pub(crate) topic: Topic,
    /// Server subscription id to cancel, set when the last listener left.
    pub(crate) unsubscribe: Option<u64>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    map: Mutex<HashMap<Topic, TopicSubscription>>,
    /// Serializes subscribe/unsubscribe/replay so their wire exchanges and
    /// registry edits interleave cleanly.
    op_lock: tokio::sync::Mutex<()>,
    next_listener_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn op_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.op_lock
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn contains(&self, topic: &Topic) -> bool {
        self.map.lock().contains_key(topic)
    }

    /// Attach a listener to an already-subscribed topic.
    ///
    /// Returns `None` when the topic has no subscription yet; the caller
    /// must subscribe on the wire first and use [`Self::insert_topic`].
    pub(crate) fn add_local(&self, topic: &Topic, callback: EventCallback) -> Option<ListenerId> {
        let mut map = self.map.lock();
        let subscription = map.get_mut(topic)?;
        let id = self.next_id();
        subscription.listeners.push((id, callback));
        Some(id)
    }

    /// Record a fresh server subscription with its first listener.
    pub(crate) fn insert_topic(
        &self,
        topic: Topic,
        subscription_id: u64,
        callback: EventCallback,
    ) -> ListenerId {
        let id = self.next_id();
        let _ = self.map.lock().insert(
            topic,
            TopicSubscription {
                subscription_id,
                listeners: vec![(id, callback)],
            },
        );
        id
    }

    /// Detach a listener. When it was the last one on its topic the whole
    /// entry is dropped and the server subscription id to cancel is
    /// returned.
    pub(crate) fn remove_listener(&self, listener: ListenerId) -> Option<ListenerRemoval> {
        let mut map = self.map.lock();
        let topic = map.iter().find_map(|(topic, sub)| {
            sub.listeners
                .iter()
                .any(|(id, _)| *id == listener)
                .then(|| topic.clone())
        })?;
        let now_empty = {
            let subscription = map.get_mut(&topic)?;
            subscription.listeners.retain(|(id, _)| *id != listener);
            subscription.listeners.is_empty()
        };
        let unsubscribe = if now_empty {
            map.remove(&topic).map(|sub| sub.subscription_id)
        } else {
            None
        };
        Some(ListenerRemoval { topic, unsubscribe })
    }

    /// Callbacks to run for an event carrying `subscription_id`.
    ///
    /// Both the named topic and the wildcard are consulted, each gated on
    /// its current subscription id so events from a superseded subscription
    /// are ignored.
    pub(crate) fn listeners_for(
        &self,
        subscription_id: u64,
        event_type: &str,
    ) -> Vec<EventCallback> {
        let map = self.map.lock();
        let mut callbacks = Vec::new();
        let named = Topic::Event(event_type.to_owned());
        if let Some(sub) = map
            .get(&named)
            .filter(|sub| sub.subscription_id == subscription_id)
        {
            callbacks.extend(sub.listeners.iter().map(|(_, cb)| Arc::clone(cb)));
        }
        if let Some(sub) = map
            .get(&Topic::Any)
            .filter(|sub| sub.subscription_id == subscription_id)
        {
            callbacks.extend(sub.listeners.iter().map(|(_, cb)| Arc::clone(cb)));
        }
        callbacks
    }

    /// Topics to re-subscribe after a reconnect.
    pub(crate) fn replay_targets(&self) -> Vec<Topic> {
        self.map.lock().keys().cloned().collect()
    }

    /// Store the server subscription id a replayed topic got this session.
    pub(crate) fn update_subscription_id(&self, topic: &Topic, subscription_id: u64) {
        if let Some(sub) = self.map.lock().get_mut(topic) {
            sub.subscription_id = subscription_id;
        }
    }

    /// Total listeners across all topics.
    pub(crate) fn listener_count(&self) -> usize {
        self.map.lock().values().map(|sub| sub.listeners.len()).sum()
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.map.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.map.lock().clear();
    }
}
