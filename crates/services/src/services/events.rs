use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-subscription queue depth. A subscriber that cannot drain this many
/// events gets marked lossy instead of blocking publishers.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Topic names. Ids are interpolated so subscribers can watch exactly one
/// entity; `execution_log.created` is the one fan-in topic.
pub mod topics {
    use uuid::Uuid;

    pub const EXECUTION_LOG_CREATED: &str = "execution_log.created";

    pub fn task(id: Uuid) -> String {
        format!("task.{id}")
    }

    pub fn task_project(project_id: Uuid) -> String {
        format!("task.project.{project_id}")
    }

    pub fn execution(id: Uuid) -> String {
        format!("execution.{id}")
    }

    pub fn plan(id: Uuid) -> String {
        format!("plan.{id}")
    }

    pub fn pull_request(id: Uuid) -> String {
        format!("pullrequest.{id}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl Event {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            data,
        }
    }

    fn resync_hint(topic: &str) -> Self {
        Self::new(topic, "resync_hint", Value::Null)
    }
}

struct SubscriberHandle {
    id: Uuid,
    tx: mpsc::Sender<Event>,
    lossy: Arc<AtomicBool>,
}

/// A subscription's receiving end. One queue serves all topics the
/// subscriber asked for, so a gateway connection maps to exactly one of
/// these.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    lossy: Arc<AtomicBool>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Whether this subscriber has dropped events since the last resync.
    pub fn is_lossy(&self) -> bool {
        self.lossy.load(Ordering::Relaxed)
    }
}

/// In-process publish/subscribe with named topics.
///
/// Publishes never block: full queues flag the subscriber lossy and the next
/// publish that finds room delivers a `resync_hint` before resuming, so a
/// slow consumer knows to re-query state. Delivery is per-topic FIFO per
/// subscriber; nothing is ordered across topics.
pub struct EventBus {
    subscribers: DashMap<String, Vec<SubscriberHandle>>,
    queue_depth: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl EventBus {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            queue_depth,
        }
    }

    /// Subscribe one queue to `topic_names`.
    pub fn subscribe<I, S>(&self, topic_names: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let lossy = Arc::new(AtomicBool::new(false));

        for topic in topic_names {
            self.subscribers
                .entry(topic.into())
                .or_default()
                .push(SubscriberHandle {
                    id,
                    tx: tx.clone(),
                    lossy: lossy.clone(),
                });
        }

        Subscription { id, rx, tx, lossy }
    }

    /// Attach an existing subscription to another topic.
    pub fn add_topic(&self, subscription: &Subscription, topic: impl Into<String>) {
        let mut handles = self.subscribers.entry(topic.into()).or_default();
        if handles.iter().any(|h| h.id == subscription.id) {
            return;
        }
        handles.push(SubscriberHandle {
            id: subscription.id,
            tx: subscription.tx.clone(),
            lossy: subscription.lossy.clone(),
        });
    }

    /// Detach a subscription from one topic. Idempotent.
    pub fn remove_topic(&self, subscription_id: Uuid, topic: &str) {
        if let Some(mut handles) = self.subscribers.get_mut(topic) {
            handles.retain(|h| h.id != subscription_id);
        }
    }

    /// Remove a subscriber everywhere. Idempotent.
    pub fn unsubscribe(&self, subscription_id: Uuid) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|h| h.id != subscription_id);
        }
        self.subscribers.retain(|_, handles| !handles.is_empty());
    }

    /// Non-blocking fan-out to every live subscriber of `topic`.
    pub fn publish(&self, topic: &str, event_type: &str, data: Value) {
        let Some(mut handles) = self.subscribers.get_mut(topic) else {
            return;
        };

        handles.retain(|handle| !handle.tx.is_closed());
        for handle in handles.iter() {
            if handle.lossy.load(Ordering::Relaxed) {
                // a lossy subscriber gets a resync hint first; until that
                // fits in the queue it keeps missing events
                match handle.tx.try_send(Event::resync_hint(topic)) {
                    Ok(()) => handle.lossy.store(false, Ordering::Relaxed),
                    Err(_) => continue,
                }
            }
            let event = Event::new(topic, event_type, data.clone());
            if handle.tx.try_send(event).is_err() {
                tracing::debug!(topic, "subscriber queue full, marking lossy");
                handle.lossy.store(true, Ordering::Relaxed);
            }
        }
    }
}
