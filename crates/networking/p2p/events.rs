//! Publish/subscribe registry used for peer and chain head notifications.
//!
//! Every subscriber owns an unbounded channel receiver wrapped in a
//! [`Subscription`]. Dropping the subscription removes it from the registry,
//! so publishers never hold on to dead subscribers for longer than it takes
//! the drop to run.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;

type Subscribers<T> = Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>;

#[derive(Debug)]
pub struct EventBus<T> {
    subscribers: Arc<Subscribers<T>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).insert(id, sender);
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Sends `event` to every live subscriber and returns how many received it.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|_, sender| sender.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Receiving end of an [`EventBus`] subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    registry: Weak<Subscribers<T>>,
}

impl<T> Subscription<T> {
    /// Waits for the next event. Returns `None` once the bus is gone and the
    /// backlog is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

// A panic while holding the lock leaves the map itself consistent.
fn lock<T>(subscribers: &Subscribers<T>) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<T>>> {
    subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
