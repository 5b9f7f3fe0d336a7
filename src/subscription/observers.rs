//! Token-keyed observer sets
//!
//! Each registration gets a unique token; removal is a map delete. Iteration
//! always works on a snapshot so callbacks may (un)register while a
//! notification is in flight.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{error, warn};

/// Callback fired on a lifecycle transition
pub type LifecycleCallback = dyn Fn() -> anyhow::Result<()> + Send + Sync;

/// Handle returned by every registration.
///
/// Dropping it keeps the registration alive; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[must_use = "keep the Subscription to be able to unsubscribe later"]
pub struct Subscription {
    remover: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(remover: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remover: Some(Box::new(remover)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remover.is_some())
            .finish()
    }
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered set of observers of one kind
pub struct Observers<T: ?Sized> {
    next_token: AtomicU64,
    entries: RwLock<BTreeMap<u64, Arc<T>>>,
}

impl<T: ?Sized> Default for Observers<T> {
    fn default() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer; returns its token
    pub fn insert(&self, observer: Arc<T>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        write_lock(&self.entries).insert(token, observer);
        token
    }

    pub fn remove(&self, token: u64) -> bool {
        write_lock(&self.entries).remove(&token).is_some()
    }

    /// Add an observer and wrap removal in a [`Subscription`]
    pub fn register(self: &Arc<Self>, observer: Arc<T>) -> Subscription {
        let token = self.insert(observer);
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(observers) = weak.upgrade() {
                observers.remove(token);
            }
        })
    }

    /// Observers in registration order
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        read_lock(&self.entries).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.entries).is_empty()
    }
}

impl Observers<LifecycleCallback> {
    /// Invoke every callback; a failing one never stops the rest
    pub fn notify(&self, label: &str) {
        for callback in self.snapshot() {
            invoke_isolated(label, || (*callback)());
        }
    }
}

/// Run a callback, turning both `Err` and panics into a log line.
///
/// Returns `true` if the callback completed successfully.
pub(crate) fn invoke_isolated(label: &str, f: impl FnOnce() -> anyhow::Result<()>) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("[{}] handler failed: {:#}", label, e);
            false
        }
        Err(panic) => {
            error!("[{}] handler panicked: {}", label, panic_message(&*panic));
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_register_and_unsubscribe() {
        let observers: Arc<Observers<LifecycleCallback>> = Arc::new(Observers::new());
        let calls = Arc::new(AtomicU64::new(0));

        let counter = calls.clone();
        let sub = observers.register(Arc::new(move || -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(observers.len(), 1);

        observers.notify("test");
        sub.unsubscribe();
        observers.notify("test");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_notify_isolates_failures() {
        let observers: Arc<Observers<LifecycleCallback>> = Arc::new(Observers::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _a = observers.register(Arc::new(|| -> anyhow::Result<()> {
            anyhow::bail!("first callback broke")
        }));
        let _b = observers.register(Arc::new(|| -> anyhow::Result<()> {
            panic!("second callback panicked")
        }));
        let log = seen.clone();
        let _c = observers.register(Arc::new(move || -> anyhow::Result<()> {
            log.lock().unwrap().push("third");
            Ok(())
        }));

        observers.notify("test");
        assert_eq!(*seen.lock().unwrap(), vec!["third"]);
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let observers: Observers<str> = Observers::new();
        observers.insert(Arc::from("a"));
        let b = observers.insert(Arc::from("b"));
        observers.insert(Arc::from("c"));
        observers.remove(b);

        let order: Vec<String> = observers.snapshot().iter().map(|s| s.to_string()).collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn test_unsubscribe_after_owner_dropped() {
        let observers: Arc<Observers<LifecycleCallback>> = Arc::new(Observers::new());
        let sub = observers.register(Arc::new(|| -> anyhow::Result<()> { Ok(()) }));
        drop(observers);
        sub.unsubscribe();
    }
}
