use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

type Observer<S> = Box<dyn FnMut(&S) + Send>;
type ObserverMap<S> = BTreeMap<u64, Arc<Mutex<Observer<S>>>>;

/// Selector-based change notification.
///
/// Every notification pass recomputes each registered selector against the
/// new state and invokes the callback only when the projection differs from
/// the previous one. The equality gate is part of the contract: whether an
/// observer fires at all is decided here, so unrelated state changes never
/// reach it.
pub struct SubscriptionBus<S> {
    observers: Arc<RwLock<ObserverMap<S>>>,
    next_id: Arc<AtomicU64>,
}

impl<S> Clone for SubscriptionBus<S> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<S> Default for SubscriptionBus<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SubscriptionBus<S> {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers an observer. `initial` seeds the previous projection, so
    /// the callback fires on the first *change* after subscribing, never on
    /// registration itself.
    pub fn subscribe<V, F, C>(&self, initial: &S, selector: F, mut callback: C) -> Subscription<S>
    where
        V: Clone + PartialEq + Send + 'static,
        F: Fn(&S) -> V + Send + 'static,
        C: FnMut(&V) + Send + 'static,
    {
        let mut last = selector(initial);
        let observer: Observer<S> = Box::new(move |state| {
            let next = selector(state);
            if next != last {
                callback(&next);
                last = next;
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.insert(id, Arc::new(Mutex::new(observer)));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Runs one synchronous notification pass. Observers fire in no
    /// particular order relative to each other. An observer whose callback
    /// re-enters the store (and thus this bus) skips itself in the nested
    /// pass; its projection catches up on the next one.
    pub fn notify(&self, state: &S) {
        let entries: Vec<Arc<Mutex<Observer<S>>>> = {
            let observers = match self.observers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            observers.values().cloned().collect()
        };
        for entry in entries {
            if let Ok(mut observer) = entry.try_lock() {
                (*observer)(state);
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        match self.observers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Handle returned by [`SubscriptionBus::subscribe`]. Dropping the handle
/// does not unsubscribe; removal is an explicit call.
pub struct Subscription<S> {
    id: u64,
    observers: Weak<RwLock<ObserverMap<S>>>,
}

impl<S> Subscription<S> {
    /// Removes the registration. Safe to call repeatedly; every call after
    /// the first is a no-op.
    pub fn unsubscribe(&self) {
        let Some(observers) = self.observers.upgrade() else {
            return;
        };
        let mut observers = match observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.remove(&self.id);
    }
}
