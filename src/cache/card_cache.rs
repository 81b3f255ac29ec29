//! Live, overlay-filtered view of the selected cards
//!
//! A selection change tears the old feed down through the
//! [`SubscriptionRegistry`], waits a settling interval and only then
//! subscribes to the new scope. Each setup captures a generation number;
//! deliveries and setups belonging to an older generation are discarded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, VaultError};
use crate::events::InvalidationEvent;
use crate::models::{Card, Scope};
use crate::overlay::SoldOverlay;
use crate::store::{DocumentStore, FeedCallback, FeedDelivery};
use crate::subscriptions::{SubscriptionId, SubscriptionRegistry};

/// Lifecycle of the live feed backing the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    Idle,
    Loading,
    Synced,
    Error(String),
}

struct ActiveFeed {
    id: SubscriptionId,
    scope: Scope,
}

struct CacheInner {
    store: Arc<dyn DocumentStore>,
    overlay: Arc<SoldOverlay>,
    registry: Arc<SubscriptionRegistry>,
    settle_delay: Duration,
    generation: AtomicU64,
    selection: Mutex<Option<Scope>>,
    active: Mutex<Option<ActiveFeed>>,
    /// Ids of optimistic creates the store has not confirmed yet
    in_flight: Mutex<HashSet<String>>,
    cards: RwLock<Vec<Card>>,
    state: watch::Sender<CacheState>,
    published: watch::Sender<Vec<Card>>,
}

impl CacheInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: CacheState) {
        self.state.send_replace(state);
    }

    fn read_cards(&self) -> RwLockReadGuard<'_, Vec<Card>> {
        self.cards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_cards(&self) -> RwLockWriteGuard<'_, Vec<Card>> {
        self.cards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveFeed>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn selection(&self) -> MutexGuard<'_, Option<Scope>> {
        self.selection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overlay-filtered copy of the stored cards
    fn visible(&self) -> Vec<Card> {
        let cards = self.read_cards().clone();
        self.overlay.apply(cards)
    }

    fn publish(&self) {
        self.published.send_replace(self.visible());
    }

    fn accept_delivery(&self, generation: u64, delivery: FeedDelivery) {
        if !self.is_current(generation) {
            log::debug!("Dropping delivery from stale feed generation {}", generation);
            return;
        }
        match delivery {
            Ok(cards) => {
                let mut fresh = self.overlay.apply(cards);
                {
                    let in_flight = self.in_flight();
                    let mut current = self.write_cards();
                    let pending = current
                        .iter()
                        .filter(|card| in_flight.contains(&card.id))
                        .cloned();
                    fresh.extend(pending.collect::<Vec<_>>());
                    *current = fresh;
                }
                self.set_state(CacheState::Synced);
                self.publish();
            }
            Err(e) => {
                log::error!("Live card feed failed: {}", e);
                self.set_state(CacheState::Error(e.to_string()));
            }
        }
    }

    /// Release the active feed, if any
    fn release_active(&self) {
        let feed = self.active().take();
        if let Some(feed) = feed {
            log::debug!("Tearing down feed for {}", feed.scope);
            self.registry.unregister(feed.id);
        }
    }
}

/// Cloneable handle to the card cache
#[derive(Clone)]
pub struct CardCache {
    inner: Arc<CacheInner>,
}

impl CardCache {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        overlay: Arc<SoldOverlay>,
        registry: Arc<SubscriptionRegistry>,
        settle_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(CacheState::Idle);
        let (published, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(CacheInner {
                store,
                overlay,
                registry,
                settle_delay,
                generation: AtomicU64::new(0),
                selection: Mutex::new(None),
                active: Mutex::new(None),
                in_flight: Mutex::new(HashSet::new()),
                cards: RwLock::new(Vec::new()),
                state,
                published,
            }),
        }
    }

    /// Switch the live feed to `scope`
    ///
    /// Returns once the new feed is established, or early without
    /// publishing anything if another selection superseded this one.
    pub async fn select(&self, scope: Scope) -> Result<()> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.selection() = Some(scope.clone());
        inner.set_state(CacheState::Loading);
        inner.release_active();

        tokio::time::sleep(inner.settle_delay).await;
        if !inner.is_current(generation) {
            log::debug!("Selection {} superseded before subscribing", scope);
            return Ok(());
        }

        let callback = feed_callback(Arc::downgrade(inner), generation);
        let unsubscribe = match inner.store.subscribe(&scope, callback).await {
            Ok(unsubscribe) => unsubscribe,
            Err(e) => {
                log::error!("Failed to subscribe to {}: {}", scope, e);
                if inner.is_current(generation) {
                    inner.set_state(CacheState::Error(e.to_string()));
                }
                return Err(VaultError::from(e));
            }
        };

        let mut active = inner.active();
        if !inner.is_current(generation) {
            drop(active);
            log::debug!("Selection {} superseded while subscribing", scope);
            if let Err(e) = unsubscribe() {
                log::warn!("Failed to release superseded feed {}: {}", scope, e);
            }
            return Ok(());
        }
        let id = inner
            .registry
            .register(unsubscribe, format!("cards:{}", scope));
        *active = Some(ActiveFeed { id, scope });
        Ok(())
    }

    /// Re-establish the feed for the current selection
    pub async fn retry(&self) -> Result<()> {
        let scope = self.selection().unwrap_or(Scope::All);
        self.select(scope).await
    }

    /// Drop the live feed and every cached card
    pub fn teardown(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.release_active();
        *inner.selection() = None;
        inner.in_flight().clear();
        inner.write_cards().clear();
        inner.set_state(CacheState::Idle);
        inner.publish();
    }

    pub fn state(&self) -> CacheState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CacheState> {
        self.inner.state.subscribe()
    }

    /// Wait until the feed has delivered or failed
    pub async fn settled(&self) -> CacheState {
        let mut rx = self.subscribe_state();
        let result = rx
            .wait_for(|state| matches!(state, CacheState::Synced | CacheState::Error(_)))
            .await
            .map(|state| (*state).clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    pub fn selection(&self) -> Option<Scope> {
        self.inner.selection().clone()
    }

    /// Receiver of every published card list
    pub fn watch(&self) -> watch::Receiver<Vec<Card>> {
        self.inner.published.subscribe()
    }

    /// Current cards, with the sold overlay applied at read time
    pub fn cards(&self) -> Vec<Card> {
        self.inner.visible()
    }

    pub fn get(&self, id: &str) -> Option<Card> {
        if self.inner.overlay.contains(id) {
            return None;
        }
        self.inner
            .read_cards()
            .iter()
            .find(|card| card.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.cards().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cards with a remotely confirmed id; in-flight creates are excluded
    pub fn candidates(&self) -> Vec<Card> {
        let in_flight = self.inner.in_flight().clone();
        self.cards()
            .into_iter()
            .filter(|card| !in_flight.contains(&card.id))
            .collect()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inner.in_flight().contains(id)
    }

    /// Remove ids proven absent remotely
    pub fn apply_invalidation(&self, event: &InvalidationEvent) -> usize {
        let removed = {
            let mut cards = self.inner.write_cards();
            let before = cards.len();
            cards.retain(|card| !event.removed_ids.contains(&card.id));
            before - cards.len()
        };
        if removed > 0 {
            log::info!("Purged {} invalidated card(s) from cache", removed);
            self.inner.publish();
        }
        removed
    }

    /// Apply invalidation events until the channel closes
    pub fn spawn_invalidation_listener(
        &self,
        mut rx: broadcast::Receiver<InvalidationEvent>,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        cache.apply_invalidation(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {} invalidation event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // Optimistic writes, reserved for the mutation engine.

    fn in_scope(&self, card: &Card) -> bool {
        self.selection().map_or(true, |scope| scope.matches(card))
    }

    pub(crate) fn insert_pending(&self, card: Card) {
        if !self.in_scope(&card) {
            return;
        }
        {
            let mut in_flight = self.inner.in_flight();
            let mut cards = self.inner.write_cards();
            in_flight.insert(card.id.clone());
            cards.push(card);
        }
        self.inner.publish();
    }

    /// Swap a temporary entry for the store-confirmed card
    pub(crate) fn confirm_pending(&self, temp_id: &str, card: Card) {
        let in_scope = self.in_scope(&card);
        {
            let mut in_flight = self.inner.in_flight();
            let mut cards = self.inner.write_cards();
            in_flight.remove(temp_id);
            cards.retain(|c| c.id != temp_id);
            if in_scope && !cards.iter().any(|c| c.id == card.id) {
                cards.push(card);
            }
        }
        self.inner.publish();
    }

    pub(crate) fn discard_pending(&self, temp_id: &str) {
        {
            let mut in_flight = self.inner.in_flight();
            let mut cards = self.inner.write_cards();
            in_flight.remove(temp_id);
            cards.retain(|c| c.id != temp_id);
        }
        self.inner.publish();
    }

    /// Position and value of a cached card, ignoring the overlay
    pub(crate) fn locate(&self, id: &str) -> Option<(usize, Card)> {
        self.inner
            .read_cards()
            .iter()
            .enumerate()
            .find(|(_, c)| c.id == id)
            .map(|(index, card)| (index, card.clone()))
    }

    /// Replace a cached card in place, returning the previous value.
    /// Cards that are not cached are left alone.
    pub(crate) fn replace(&self, card: Card) -> Option<Card> {
        let previous = {
            let mut cards = self.inner.write_cards();
            cards
                .iter_mut()
                .find(|c| c.id == card.id)
                .map(|slot| std::mem::replace(slot, card))
        };
        if previous.is_some() {
            self.inner.publish();
        }
        previous
    }

    /// Store a confirmed card: replaced in place while it matches the
    /// selection, dropped once it no longer does
    pub(crate) fn settle_card(&self, card: Card) {
        if self.in_scope(&card) {
            {
                let mut cards = self.inner.write_cards();
                match cards.iter_mut().find(|c| c.id == card.id) {
                    Some(slot) => *slot = card,
                    None => cards.push(card),
                }
            }
            self.inner.publish();
        } else {
            self.remove(&card.id);
        }
    }

    /// Remove a card regardless of the overlay, returning it
    pub(crate) fn remove(&self, id: &str) -> Option<Card> {
        self.take(id).map(|(_, card)| card)
    }

    /// Remove a card and report where it sat, for [`Self::restore_at`]
    pub(crate) fn take(&self, id: &str) -> Option<(usize, Card)> {
        let removed = {
            let mut cards = self.inner.write_cards();
            cards
                .iter()
                .position(|c| c.id == id)
                .map(|index| (index, cards.remove(index)))
        };
        if removed.is_some() {
            self.inner.publish();
        }
        removed
    }

    /// Republish after the overlay changed
    pub(crate) fn refresh(&self) {
        self.inner.publish();
    }

    /// Put a card back where it was before a failed mutation
    ///
    /// The index is clamped to the current length. A copy that arrived
    /// in the meantime is replaced in place.
    pub(crate) fn restore_at(&self, index: usize, card: Card) {
        if !self.in_scope(&card) {
            return;
        }
        {
            let mut cards = self.inner.write_cards();
            match cards.iter_mut().find(|c| c.id == card.id) {
                Some(slot) => *slot = card,
                None => {
                    let index = index.min(cards.len());
                    cards.insert(index, card);
                }
            }
        }
        self.inner.publish();
    }
}

fn feed_callback(inner: Weak<CacheInner>, generation: u64) -> FeedCallback {
    Arc::new(move |delivery| {
        if let Some(inner) = inner.upgrade() {
            inner.accept_delivery(generation, delivery);
        }
    })
}
