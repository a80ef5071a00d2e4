//! Observer registry
//!
//! Callers register callbacks and get back a [`Subscription`]. Dropping the
//! subscription (or calling [`Subscription::dispose`]) unregisters the
//! callback.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Set of callbacks notified with values of type `T`
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.len())
            .finish()
    }
}

fn lock<T>(m: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    // A panicking callback never runs under the lock, so the data is intact
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: 'static> Observers<T> {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register `callback`; it stays registered while the returned
    /// [`Subscription`] is alive.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut reg = lock(&self.inner);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).callbacks.retain(|(cb_id, _)| *cb_id != id);
                }
            })),
        }
    }

    /// Notify every registered callback, in registration order.
    /// Callbacks run after the registry lock is released, so they may
    /// subscribe or unsubscribe.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(value);
        }
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer returned by [`Observers::subscribe`]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Unsubscribe now
    pub fn dispose(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }

    /// Keep the callback registered for the lifetime of the registry
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &u32| sink.lock().unwrap().push(*v))
    }

    #[test]
    fn test_subscribe_and_emit() {
        let observers = Observers::<u32>::new();
        let (seen_a, cb_a) = collector();
        let (seen_b, cb_b) = collector();
        let _a = observers.subscribe(cb_a);
        let b = observers.subscribe(cb_b);
        assert_eq!(observers.len(), 2);

        observers.emit(&1);
        b.dispose();
        observers.emit(&2);

        assert_eq!(*seen_a.lock().unwrap(), vec![1, 2]);
        assert_eq!(*seen_b.lock().unwrap(), vec![1]);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let observers = Observers::<u32>::new();
        let (seen, cb) = collector();
        {
            let _sub = observers.subscribe(cb);
            observers.emit(&7);
        }
        observers.emit(&8);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_detach_keeps_callback() {
        let observers = Observers::<u32>::new();
        let (seen, cb) = collector();
        observers.subscribe(cb).detach();
        observers.emit(&3);
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_callback_may_subscribe_during_emit() {
        let observers = Observers::<u32>::new();
        let inner = observers.clone();
        let _sub = observers.subscribe(move |_| {
            inner.subscribe(|_| {}).detach();
        });
        observers.emit(&0);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let observers = Observers::<u32>::new();
        let sub = observers.subscribe(|_| {});
        drop(observers);
        sub.dispose();
    }

    #[test]
    fn test_default_and_debug() {
        let observers: Observers<String> = Observers::default();
        let _sub = observers.subscribe(|_| {});
        assert_eq!(format!("{:?}", observers), "Observers { len: 1 }");
    }
}
