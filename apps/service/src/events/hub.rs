use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::Event;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

pub type SubscriberId = Uuid;

type Inbox = mpsc::Sender<Arc<Event>>;

struct HubInner {
    subscribers: Mutex<HashMap<SubscriberId, Inbox>>,
    capacity: usize,
}

impl HubInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, Inbox>> {
        // Sends never panic while holding the lock, so a poisoned map is still consistent
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fan-out broadcaster for scheduler events.
///
/// Each subscriber owns a bounded inbox. `broadcast` never waits: a subscriber
/// whose inbox is full, or whose receiving side is gone, is dropped on the
/// spot. Delivery is at-most-once with no replay for late subscribers.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = Uuid::new_v4();
        self.inner.subscribers().insert(id, tx);
        debug!(subscriber = %id, "Event subscriber connected");
        Subscription { id, rx, hub: Arc::downgrade(&self.inner) }
    }

    /// Returns false when the subscriber was already gone
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.subscribers().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Event subscriber disconnected");
        }
        removed
    }

    /// Deliver to every live subscriber; returns how many accepted the event
    pub fn broadcast(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut subscribers = self.inner.subscribers();

        subscribers.retain(|id, inbox| match inbox.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %id, event = event.type_name(), "Dropping subscriber with a full inbox");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %id, "Dropping closed subscriber");
                false
            }
        });

        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Disconnect everyone; their receivers drain and then end
    pub fn close(&self) {
        let drained = std::mem::take(&mut *self.inner.subscribers());
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closing event subscribers");
        }
    }
}

/// Receiving side of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Event>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub dropped this subscriber and the inbox is drained
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.subscribers().remove(&self.id);
        }
    }
}
