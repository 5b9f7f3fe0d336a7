//! Fan-out bus for inbound messages
//!
//! Feature code subscribes to message kinds here and never touches the
//! transport. Entries outlive any number of reconnects; only the returned
//! [`Subscription`] removes them.

use super::observers::{invoke_isolated, read_lock, write_lock, Observers, Subscription};
use pulse_shared::Message;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use tracing::{trace, warn};

/// Handler invoked for every delivered message
pub type MessageHandler = dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync;

/// Predicate deciding whether a handler sees a message
pub type MessageFilter = dyn Fn(&Message) -> bool + Send + Sync;

/// Something that can bring the link up in the background
pub trait ConnectionDriver: Send + Sync {
    /// Must not block; starting a connection happens on a spawned task
    fn ensure_connected(&self);
}

struct SubscriptionEntry {
    handler: Arc<MessageHandler>,
    filter: Option<Arc<MessageFilter>>,
}

impl SubscriptionEntry {
    fn accepts(&self, message: &Message) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match catch_unwind(AssertUnwindSafe(|| (**filter)(message))) {
            Ok(accepted) => accepted,
            Err(_) => {
                warn!("[DISPATCH] filter panicked for {:?}, skipping", message.kind());
                false
            }
        }
    }
}

/// Subscription registry keyed by message kind
pub struct SubscriptionRegistry {
    me: Weak<SubscriptionRegistry>,
    next_token: AtomicU64,
    by_kind: RwLock<HashMap<String, BTreeMap<u64, Arc<SubscriptionEntry>>>>,
    catch_all: Arc<Observers<MessageHandler>>,
    driver: OnceLock<Weak<dyn ConnectionDriver>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            next_token: AtomicU64::new(1),
            by_kind: RwLock::new(HashMap::new()),
            catch_all: Arc::new(Observers::new()),
            driver: OnceLock::new(),
        })
    }

    /// Attach the connection this registry nudges on subscribe.
    ///
    /// Only the first driver sticks; returns `false` if one was already set.
    pub fn attach_driver(&self, driver: Weak<dyn ConnectionDriver>) -> bool {
        self.driver.set(driver).is_ok()
    }

    /// Deliver every message of `kind` to `handler`
    pub fn subscribe<H>(&self, kind: &str, handler: H) -> Subscription
    where
        H: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(kind, Arc::new(handler), None)
    }

    /// Deliver messages of `kind` that pass `filter` to `handler`
    pub fn subscribe_where<F, H>(&self, kind: &str, filter: F, handler: H) -> Subscription
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(kind, Arc::new(handler), Some(Arc::new(filter)))
    }

    /// Deliver every message regardless of kind
    pub fn subscribe_all<H>(&self, handler: H) -> Subscription
    where
        H: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self.catch_all.register(Arc::new(handler));
        self.nudge_driver();
        subscription
    }

    fn add(
        &self,
        kind: &str,
        handler: Arc<MessageHandler>,
        filter: Option<Arc<MessageFilter>>,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SubscriptionEntry { handler, filter });
        write_lock(&self.by_kind)
            .entry(kind.to_string())
            .or_default()
            .insert(token, entry);

        self.nudge_driver();

        let registry = self.me.clone();
        let kind = kind.to_string();
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&kind, token);
            }
        })
    }

    fn remove(&self, kind: &str, token: u64) {
        let mut by_kind = write_lock(&self.by_kind);
        if let Some(entries) = by_kind.get_mut(kind) {
            entries.remove(&token);
            if entries.is_empty() {
                by_kind.remove(kind);
            }
        }
    }

    fn nudge_driver(&self) {
        if let Some(driver) = self.driver.get().and_then(Weak::upgrade) {
            driver.ensure_connected();
        }
    }

    /// Fan a message out to its subscribers.
    ///
    /// Handlers of one kind run in registration order; a failing handler
    /// never stops delivery to the next. Returns how many handlers succeeded.
    pub fn dispatch(&self, message: &Message) -> usize {
        let entries: Vec<Arc<SubscriptionEntry>> = read_lock(&self.by_kind)
            .get(message.kind())
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for entry in entries.iter().filter(|entry| entry.accepts(message)) {
            if invoke_isolated("DISPATCH", || (*entry.handler)(message)) {
                delivered += 1;
            }
        }

        for handler in self.catch_all.snapshot() {
            if invoke_isolated("DISPATCH", || (*handler)(message)) {
                delivered += 1;
            }
        }

        if entries.is_empty() {
            trace!("No subscribers for message type {:?}", message.kind());
        }
        delivered
    }

    /// Number of handlers registered for `kind`
    pub fn subscriber_count(&self, kind: &str) -> usize {
        read_lock(&self.by_kind).get(kind).map_or(0, BTreeMap::len)
    }

    /// All kinds with at least one subscriber
    pub fn kinds(&self) -> Vec<String> {
        read_lock(&self.by_kind).keys().cloned().collect()
    }
}
