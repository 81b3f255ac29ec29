//! Subscriber bookkeeping for stores that push scope snapshots

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{StoreError, StoreResult};
use crate::models::{Card, Scope};

/// One delivery on a live feed: a full snapshot or a listener failure
pub type FeedDelivery = StoreResult<Vec<Card>>;

/// Receiver of feed deliveries
pub type FeedCallback = Arc<dyn Fn(FeedDelivery) + Send + Sync>;

/// Owned teardown closure returned by `DocumentStore::subscribe`
pub type Unsubscribe = Box<dyn FnOnce() -> StoreResult<()> + Send>;

struct Subscriber {
    scope: Scope,
    callback: FeedCallback,
}

/// Registry of live listeners on a store
#[derive(Default)]
pub struct FeedHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl FeedHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener and return the closure that removes it
    pub fn add(self: &Arc<Self>, scope: Scope, callback: FeedCallback) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, Subscriber { scope, callback });
        log::debug!("Feed listener {} attached", id);

        let hub: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.lock().remove(&id);
                log::debug!("Feed listener {} detached", id);
            }
            Ok(())
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a fresh snapshot to every listener whose scope is affected.
    ///
    /// `snapshot` is called outside the subscriber lock so it may freely
    /// query the store.
    pub fn notify<F>(&self, touched: &[String], mut snapshot: F)
    where
        F: FnMut(&Scope) -> FeedDelivery,
    {
        for (scope, callback) in self.targets() {
            let affected = match &scope {
                Scope::All => true,
                Scope::Collection(id) => touched.is_empty() || touched.contains(id),
            };
            if affected {
                callback(snapshot(&scope));
            }
        }
    }

    /// Push a listener failure to every subscriber
    pub fn fail_all(&self, message: &str) {
        for (_, callback) in self.targets() {
            callback(Err(StoreError::Transient(message.to_string())));
        }
    }

    fn targets(&self) -> Vec<(Scope, FeedCallback)> {
        self.lock()
            .values()
            .map(|s| (s.scope.clone(), Arc::clone(&s.callback)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
