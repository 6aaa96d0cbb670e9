use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Shared state of a one-shot promise.
struct PromiseCore<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

/// Producer end of a one-shot promise. The first `set` wins; later calls
/// are ignored.
pub struct PromiseSetter<T> {
    core: Arc<PromiseCore<T>>,
}

/// Consumer end of a one-shot promise.
///
/// The handle can be waited on any number of times; the value is cloned
/// out of the slot on each retrieval.
pub struct PromiseHandle<T> {
    core: Arc<PromiseCore<T>>,
}

/// Creates a connected setter/handle pair.
pub fn promise<T: Send>() -> (PromiseSetter<T>, PromiseHandle<T>) {
    let core = Arc::new(PromiseCore {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        PromiseSetter { core: Arc::clone(&core) },
        PromiseHandle { core },
    )
}

impl<T: Send> PromiseSetter<T> {
    /// Fulfils the promise. Returns `true` iff this call was the first.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.core.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.core.ready.notify_all();
        true
    }

    /// Whether the promise has already been fulfilled.
    pub fn is_set(&self) -> bool {
        self.core.slot.lock().is_some()
    }
}

impl<T: Send + Clone> PromiseHandle<T> {
    /// Blocks until the promise is fulfilled.
    pub fn wait(&self) -> T {
        let mut slot = self.core.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.core.ready.wait(&mut slot);
        }
    }

    /// Blocks up to `timeout`; `None` if the promise was not fulfilled in
    /// time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.core.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            if self.core.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.as_ref().cloned();
            }
        }
    }

    /// Non-blocking probe.
    pub fn try_get(&self) -> Option<T> {
        self.core.slot.lock().as_ref().cloned()
    }
}

impl<T> Clone for PromiseHandle<T> {
    fn clone(&self) -> Self {
        PromiseHandle { core: Arc::clone(&self.core) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_then_wait() {
        let (setter, handle) = promise();
        assert!(setter.set(7));
        assert_eq!(handle.wait(), 7);
        assert_eq!(handle.try_get(), Some(7));
    }

    #[test]
    fn first_set_wins() {
        let (setter, handle) = promise();
        assert!(setter.set(1));
        assert!(!setter.set(2));
        assert_eq!(handle.wait(), 1);
    }

    #[test]
    fn wait_blocks_until_set() {
        let (setter, handle) = promise();
        let waiter = thread::spawn(move || handle.wait());
        thread::sleep(Duration::from_millis(20));
        setter.set("done");
        assert_eq!(waiter.join().unwrap(), "done");
    }

    #[test]
    fn wait_timeout_expires() {
        let (_setter, handle) = promise::<u32>();
        assert_eq!(handle.wait_timeout(Duration::from_millis(20)), None);
    }
}
