//! In-process notification bus for test lifecycle and progress events.
//!
//! Delivery is synchronous, on the publishing task's thread, to every listener
//! registered at publish time, in registration order. Nothing is retained:
//! late subscribers never see earlier events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::lock;

/// A lifecycle or progress notification for one test invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    Started { test_id: usize },
    Update { test_id: usize, message: String },
    ShortUpdate { test_id: usize, message: String },
    Completed { test_id: usize },
}

impl NotificationEvent {
    pub fn test_id(&self) -> usize {
        match self {
            NotificationEvent::Started { test_id }
            | NotificationEvent::Update { test_id, .. }
            | NotificationEvent::ShortUpdate { test_id, .. }
            | NotificationEvent::Completed { test_id } => *test_id,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            NotificationEvent::Update { message, .. }
            | NotificationEvent::ShortUpdate { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationEvent::Started { test_id } => write!(f, "[{}] started", test_id),
            NotificationEvent::Update { test_id, message } => {
                write!(f, "[{}] {}", test_id, message.trim_end())
            }
            NotificationEvent::ShortUpdate { test_id, message } => {
                write!(f, "[{}] ~ {}", test_id, message)
            }
            NotificationEvent::Completed { test_id } => write!(f, "[{}] completed", test_id),
        }
    }
}

/// Receives bus events. Called on the publisher's thread; must not block for long.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &NotificationEvent);
}

impl<F> Listener for F
where
    F: Fn(&NotificationEvent) + Send + Sync,
{
    fn on_event(&self, event: &NotificationEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer-list fan-out.
#[derive(Default)]
pub struct NotificationBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Arc<dyn Listener>)>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Returns `false` if the subscription was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn publish(&self, event: NotificationEvent) {
        // Snapshot so listeners can (un)subscribe from inside a callback.
        let listeners: Vec<Arc<dyn Listener>> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        trace!(?event, listeners = listeners.len(), "Publishing notification");
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

/// Forwards events into an unbounded tokio channel for async consumers.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Listener for ChannelListener {
    fn on_event(&self, event: &NotificationEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Records every event it sees, in delivery order.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<NotificationEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl Listener for EventLog {
    fn on_event(&self, event: &NotificationEvent) {
        lock(&self.events).push(event.clone());
    }
}
