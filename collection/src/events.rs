//! Publish/subscribe registry for fetch events.
//!
//! Every [`EntityCollection`](crate::EntityCollection) owns one channel.
//! Subscribing returns a [`Subscription`] that removes the observer when it
//! is dropped or explicitly unsubscribed, so a torn-down view does not leak
//! its callback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    observers: Mutex<BTreeMap<u64, Observer<E>>>,
    next_id: AtomicU64,
}

pub struct EventChannel<E> {
    registry: Arc<Registry<E>>,
}

impl<E: Send + 'static> EventChannel<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                observers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `observer` for every event emitted on this channel.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        match self.registry.observers.lock() {
            Ok(mut observers) => {
                observers.insert(id, Arc::new(observer));
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, Arc::new(observer));
            }
        }
        debug!(subscription = id, "observer subscribed");

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            remove: Some(Box::new(move |id| {
                if let Some(registry) = registry.upgrade() {
                    let mut observers = match registry.observers.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    observers.remove(&id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Call every current observer with `event`, in subscription order.
    ///
    /// Observers run without the registry lock held, so they may subscribe or
    /// unsubscribe from inside the callback.
    pub fn emit(&self, event: &E) {
        for observer in self.snapshot() {
            observer(event);
        }
    }

    fn snapshot(&self) -> Vec<Observer<E>> {
        match self.registry.observers.lock() {
            Ok(observers) => observers.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }
}

impl<E: Clone + Send + 'static> EventChannel<E> {
    /// Subscribe with an async receiver instead of a callback.
    ///
    /// Events are queued until read; the channel closes when the subscription
    /// is dropped.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event: &E| {
            if tx.send(event.clone()).is_err() {
                warn!("fetch event receiver dropped before its subscription");
            }
        });
        (subscription, rx)
    }
}

impl<E: Send + 'static> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer for one observer registration.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    id: u64,
    remove: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove(self.id);
            debug!(subscription = self.id, "observer unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
