// crates/reelkit-core/src/signal.rs
//
// Signal<T>: a current value plus synchronous change observers.
//
// Observers are invoked on the thread that calls set(); subscription
// returns a token whose Drop unsubscribes. Callbacks run with the signal
// unlocked, so an observer may read the signal it observes; removals and
// subscriptions made during emission take effect after it.

use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Inner<T> {
    value:     T,
    observers: Vec<(Uuid, Callback<T>)>,
    /// Unsubscribes requested while an emission had the observers checked
    /// out. Applied when they are checked back in.
    removed:   Vec<Uuid>,
}

pub struct Signal<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal { inner: Arc::clone(&self.inner) }
    }
}

/// Keeps a subscription alive; dropping it unsubscribes.
pub struct SignalToken {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for SignalToken {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Signal {
            inner: Arc::new(Mutex::new(Inner {
                value,
                observers: Vec::new(),
                removed:   Vec::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().unwrap().value.clone()
    }

    /// Store `value` and notify observers when it differs from the
    /// current value.
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        {
            let inner = self.inner.lock().unwrap();
            if inner.value == value {
                return;
            }
        }
        self.set_always(value);
    }

    /// Store `value` and notify observers unconditionally.
    pub fn set_always(&self, value: T) {
        let mut observers = {
            let mut inner = self.inner.lock().unwrap();
            inner.value = value.clone();
            std::mem::take(&mut inner.observers)
        };
        for (_, callback) in observers.iter_mut() {
            callback(&value);
        }
        let mut inner = self.inner.lock().unwrap();
        let added = std::mem::take(&mut inner.observers);
        observers.extend(added);
        let removed = std::mem::take(&mut inner.removed);
        observers.retain(|(id, _)| !removed.contains(id));
        inner.observers = observers;
    }

    /// Subscribe. The callback fires immediately with the current value,
    /// then on every change until the token drops.
    pub fn observe(&self, mut callback: impl FnMut(&T) + Send + 'static) -> SignalToken {
        let id = Uuid::new_v4();
        let current = {
            let inner = self.inner.lock().unwrap();
            inner.value.clone()
        };
        callback(&current);
        self.inner
            .lock()
            .unwrap()
            .observers
            .push((id, Box::new(callback)));
        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        SignalToken {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap();
                    let before = inner.observers.len();
                    inner.observers.retain(|(oid, _)| *oid != id);
                    if inner.observers.len() == before {
                        // Checked out by an in-progress emission.
                        inner.removed.push(id);
                    }
                }
            })),
        }
    }
}
