//! Value-changed notifications and their forwarding through the battery tree.

use crate::reading::{ReadingKey, ReadingValue};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

/// Raised after a reading was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChanged {
    pub key: ReadingKey,
    pub value: ReadingValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Delivery {
    Keep,
    Drop,
}

type Subscriber = Arc<dyn Fn(&ValueChanged) -> Delivery + Send + Sync>;

/// Synchronous dispatcher of [`ValueChanged`] events.
///
/// Subscribers run on the writer's thread, in subscription order. A subscriber that reports
/// its receiving end is gone is removed after the dispatch.
#[derive(Default)]
pub struct Notifier {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
}

impl Notifier {
    fn add(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, subscriber));
        id
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ValueChanged) + Send + Sync + 'static,
    {
        self.add(Arc::new(move |event| {
            callback(event);
            Delivery::Keep
        }))
    }

    /// Delivers events through a channel, for observers that consume them on their own
    /// schedule. The subscription ends when the receiver is dropped.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<ValueChanged> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(Arc::new(move |event| match tx.send(event.clone()) {
            Ok(()) => Delivery::Keep,
            Err(_) => Delivery::Drop,
        }));
        rx
    }

    /// Re-raises every event of this notifier on `parent`.
    ///
    /// Only a weak reference to the parent is kept; once the parent is gone the forwarding
    /// subscription removes itself.
    pub fn forward_to(&self, parent: &Arc<Notifier>) -> SubscriptionId {
        let parent: Weak<Notifier> = Arc::downgrade(parent);
        self.add(Arc::new(move |event| match parent.upgrade() {
            Some(parent) => {
                parent.raise(event);
                Delivery::Keep
            }
            None => Delivery::Drop,
        }))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn raise(&self, event: &ValueChanged) {
        // Snapshot, subscribers may subscribe or unsubscribe while being called.
        let subscribers: Vec<_> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut gone = Vec::new();
        for (id, subscriber) in subscribers {
            if let Delivery::Drop = subscriber(event) {
                gone.push(id);
            }
        }
        for id in gone {
            log::trace!("drop closed subscription {id:?}");
            self.unsubscribe(id);
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
