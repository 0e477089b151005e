// crates/reelkit-media/src/future.rs
//
// One-shot shared futures connecting reader workers to callers, with no
// executor. A Promise is the producer half, held by the worker that will
// fulfill it; a Pending is the consumer half, cloneable so one in-flight
// request can be shared by any number of coalesced callers.
//
// Settling is sticky: the first fulfill wins, later ones are ignored.
// Dropping an unfulfilled Promise settles Err(Cancelled), so a worker
// that drains its queue on shutdown can simply drop the requests and
// every caller still resolves.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use reelkit_core::IoError;

type SettleFn<T> = Box<dyn FnOnce(&Result<T, IoError>) + Send>;

struct Slot<T> {
    value:     Option<Result<T, IoError>>,
    callbacks: Vec<SettleFn<T>>,
}

struct Shared<T> {
    slot:  Mutex<Slot<T>>,
    ready: Condvar,
}

pub struct Promise<T> {
    shared:  Arc<Shared<T>>,
    settled: bool,
}

pub struct Pending<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Pending { shared: Arc::clone(&self.shared) }
    }
}

/// Create a connected producer/consumer pair.
pub fn pair<T: Clone>() -> (Promise<T>, Pending<T>) {
    let shared = Arc::new(Shared {
        slot:  Mutex::new(Slot { value: None, callbacks: Vec::new() }),
        ready: Condvar::new(),
    });
    (
        Promise { shared: Arc::clone(&shared), settled: false },
        Pending { shared },
    )
}

impl<T: Clone> Promise<T> {
    pub fn fulfill(mut self, result: Result<T, IoError>) {
        self.settle(result);
    }

    fn settle(&mut self, result: Result<T, IoError>) {
        if self.settled {
            return;
        }
        self.settled = true;
        let callbacks = {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.value.is_some() {
                return;
            }
            slot.value = Some(result.clone());
            std::mem::take(&mut slot.callbacks)
        };
        self.shared.ready.notify_all();
        for callback in callbacks {
            callback(&result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let callbacks = {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.value.is_some() {
                return;
            }
            slot.value = Some(Err(IoError::Cancelled));
            std::mem::take(&mut slot.callbacks)
        };
        self.shared.ready.notify_all();
        let result: Result<T, IoError> = Err(IoError::Cancelled);
        for callback in callbacks {
            callback(&result);
        }
    }
}

impl<T: Clone> Pending<T> {
    /// An already-settled future, for immediate errors and cached values.
    pub fn ready(result: Result<T, IoError>) -> Pending<T> {
        Pending {
            shared: Arc::new(Shared {
                slot:  Mutex::new(Slot { value: Some(result), callbacks: Vec::new() }),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.slot.lock().unwrap().value.is_some()
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<Result<T, IoError>> {
        self.shared.slot.lock().unwrap().value.clone()
    }

    /// Block until settled.
    pub fn wait(&self) -> Result<T, IoError> {
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            if let Some(value) = &slot.value {
                return value.clone();
            }
            slot = self.shared.ready.wait(slot).unwrap();
        }
    }

    /// Block for at most `timeout`; `None` if still unsettled.
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T, IoError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            if let Some(value) = &slot.value {
                return Some(value.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
        }
    }

    /// Run `callback` when the future settles — immediately if it already
    /// has, otherwise on the fulfilling thread.
    pub fn on_settle(&self, callback: impl FnOnce(&Result<T, IoError>) + Send + 'static) {
        let mut slot = self.shared.slot.lock().unwrap();
        match &slot.value {
            Some(value) => {
                let value = value.clone();
                drop(slot);
                callback(&value);
            }
            None => slot.callbacks.push(Box::new(callback)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn fulfill_wakes_waiters() {
        let (promise, pending) = pair::<u32>();
        let waiter = pending.clone();
        let handle = thread::spawn(move || waiter.wait());
        promise.fulfill(Ok(7));
        assert_eq!(handle.join().unwrap(), Ok(7));
        assert_eq!(pending.try_get(), Some(Ok(7)));
    }

    #[test]
    fn dropping_promise_cancels() {
        let (promise, pending) = pair::<u32>();
        drop(promise);
        assert_eq!(pending.wait(), Err(IoError::Cancelled));
    }

    #[test]
    fn on_settle_runs_immediately_when_ready() {
        let pending = Pending::ready(Ok(3u32));
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        pending.on_settle(move |r| {
            assert_eq!(*r, Ok(3));
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_settle_runs_on_fulfill() {
        let (promise, pending) = pair::<u32>();
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        pending.on_settle(move |r| {
            assert!(r.is_ok());
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        promise.fulfill(Ok(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_times_out() {
        let (_promise, pending) = pair::<u32>();
        assert!(pending.wait_for(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn clones_share_the_result() {
        let (promise, pending) = pair::<u32>();
        let other = pending.clone();
        promise.fulfill(Ok(42));
        assert_eq!(pending.wait(), Ok(42));
        assert_eq!(other.wait(), Ok(42));
    }
}
