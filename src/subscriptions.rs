//! Ownership of live listener handles
//!
//! Every unsubscribe closure handed out by a store is parked here under an
//! opaque id. Teardown is idempotent and a failing handle never prevents
//! the others from being released.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::store::Unsubscribe;

/// Opaque handle id returned by [`SubscriptionRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SubscriptionHandle {
    name: String,
    unsubscribe: Unsubscribe,
}

/// Registry of active listener handles
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    handles: Mutex<HashMap<SubscriptionId, SubscriptionHandle>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, unsubscribe: Unsubscribe, name: impl Into<String>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let name = name.into();
        log::debug!("Registered subscription {:?} ({})", id, name);
        self.lock()
            .insert(id, SubscriptionHandle { name, unsubscribe });
        id
    }

    /// Release one handle. Unknown or already released ids are ignored.
    ///
    /// Returns whether a handle was found.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let handle = self.lock().remove(&id);
        match handle {
            Some(handle) => {
                release(id, handle);
                true
            }
            None => {
                log::debug!("Subscription {:?} already released", id);
                false
            }
        }
    }

    /// Release every handle, e.g. on logout
    ///
    /// Works on a snapshot taken up front; each failure is logged and the
    /// remaining handles are still released.
    pub fn cleanup_all(&self) -> usize {
        let snapshot: Vec<(SubscriptionId, SubscriptionHandle)> = self.lock().drain().collect();
        let count = snapshot.len();
        for (id, handle) in snapshot {
            release(id, handle);
        }
        if count > 0 {
            log::info!("Released {} subscription(s)", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().values().map(|h| h.name.clone()).collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, SubscriptionHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn release(id: SubscriptionId, handle: SubscriptionHandle) {
    let SubscriptionHandle { name, unsubscribe } = handle;
    match catch_unwind(AssertUnwindSafe(unsubscribe)) {
        Ok(Ok(())) => log::debug!("Released subscription {:?} ({})", id, name),
        Ok(Err(e)) => log::warn!("Failed to release subscription {}: {}", name, e),
        Err(_) => log::error!("Unsubscribe for {} panicked", name),
    }
}
