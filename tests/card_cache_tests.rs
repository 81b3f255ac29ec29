//! Integration tests for the live card cache.
//!
//! These drive the cache through the in-memory document store and check
//! feed switching, stale-setup handling and the sold overlay.

use async_trait::async_trait;
use card_vault::store::{
    DeleteOutcome, FeedCallback, Fault, MemoryDocumentStore, StoreOp, Unsubscribe,
};
use card_vault::{
    CacheState, Card, CardCache, Collection, DocumentStore, NewCard, SaleData, Scope,
    SoldOverlay, SoldRecord, StoreResult, SubscriptionRegistry,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn card(id: &str, collection: &str) -> Card {
    Card {
        id: id.to_string(),
        collection_id: collection.to_string(),
        name: format!("Card {}", id),
        investment_amount: 30.0,
        current_value: 45.0,
        currency: "EUR".to_string(),
        serial: None,
        metadata: BTreeMap::new(),
    }
}

fn seeded_store() -> Arc<MemoryDocumentStore> {
    Arc::new(MemoryDocumentStore::with_cards(vec![
        card("a", "x"),
        card("b", "x"),
        card("c", "y"),
    ]))
}

struct Fixture {
    store: Arc<MemoryDocumentStore>,
    overlay: Arc<SoldOverlay>,
    registry: Arc<SubscriptionRegistry>,
    cache: CardCache,
}

fn fixture_with(docs: Arc<dyn DocumentStore>, store: Arc<MemoryDocumentStore>, settle: Duration) -> Fixture {
    let overlay = Arc::new(SoldOverlay::in_memory());
    let registry = Arc::new(SubscriptionRegistry::new());
    let cache = CardCache::new(docs, overlay.clone(), registry.clone(), settle);
    Fixture {
        store,
        overlay,
        registry,
        cache,
    }
}

fn fixture(settle: Duration) -> Fixture {
    let store = seeded_store();
    fixture_with(store.clone(), store, settle)
}

fn ids(cards: &[Card]) -> Vec<String> {
    let mut ids: Vec<String> = cards.iter().map(|c| c.id.clone()).collect();
    ids.sort();
    ids
}

/// Delegating store whose first `subscribe` waits until released
struct SlowFirstSubscribe {
    inner: Arc<MemoryDocumentStore>,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl DocumentStore for SlowFirstSubscribe {
    async fn get_all(&self, scope: &Scope) -> StoreResult<Vec<Card>> {
        self.inner.get_all(scope).await
    }
    async fn subscribe(&self, scope: &Scope, callback: FeedCallback) -> StoreResult<Unsubscribe> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.subscribe(scope, callback).await
    }
    async fn get_by_id(&self, id: &str) -> StoreResult<Card> {
        self.inner.get_by_id(id).await
    }
    async fn create(&self, card: NewCard) -> StoreResult<Card> {
        self.inner.create(card).await
    }
    async fn update(&self, card: &Card) -> StoreResult<Card> {
        self.inner.update(card).await
    }
    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.inner.delete(id).await
    }
    async fn batch_delete(&self, ids: &[String]) -> StoreResult<Vec<DeleteOutcome>> {
        self.inner.batch_delete(ids).await
    }
    async fn mark_sold(&self, id: &str, sale: &SaleData) -> StoreResult<SoldRecord> {
        self.inner.mark_sold(id, sale).await
    }
    async fn record_sale(&self, record: &SoldRecord) -> StoreResult<SoldRecord> {
        self.inner.record_sale(record).await
    }
    async fn purge(&self, id: &str) -> StoreResult<()> {
        self.inner.purge(id).await
    }
    async fn collections(&self) -> StoreResult<Vec<Collection>> {
        self.inner.collections().await
    }
    async fn save_collection(&self, collection: &Collection) -> StoreResult<()> {
        self.inner.save_collection(collection).await
    }
    async fn sold_records(&self) -> StoreResult<Vec<SoldRecord>> {
        self.inner.sold_records().await
    }
}

// ==================== Feed Selection Tests ====================

mod selection {
    use super::*;

    #[tokio::test]
    async fn select_all_publishes_every_card() {
        let f = fixture(Duration::ZERO);

        f.cache.select(Scope::All).await.unwrap();

        assert_eq!(f.cache.state(), CacheState::Synced);
        assert_eq!(ids(&f.cache.cards()), vec!["a", "b", "c"]);
        assert_eq!(f.registry.names(), vec!["cards:all"]);
    }

    #[tokio::test]
    async fn switching_scope_replaces_the_feed() {
        let f = fixture(Duration::ZERO);
        f.cache.select(Scope::Collection("x".into())).await.unwrap();
        assert_eq!(ids(&f.cache.cards()), vec!["a", "b"]);

        f.cache.select(Scope::Collection("y".into())).await.unwrap();

        assert_eq!(ids(&f.cache.cards()), vec!["c"]);
        assert_eq!(f.store.listener_count(), 1);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.cache.selection(), Some(Scope::Collection("y".into())));
    }

    #[tokio::test]
    async fn superseded_selection_never_subscribes() {
        let f = fixture(Duration::from_millis(20));

        let (first, second) = tokio::join!(
            f.cache.select(Scope::Collection("x".into())),
            f.cache.select(Scope::Collection("y".into()))
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(f.store.calls(StoreOp::Subscribe), 1);
        assert_eq!(f.store.listener_count(), 1);
        assert_eq!(ids(&f.cache.cards()), vec!["c"]);
    }

    #[tokio::test]
    async fn setup_superseded_mid_subscribe_releases_its_listener() {
        let store = seeded_store();
        let slow = Arc::new(SlowFirstSubscribe {
            inner: store.clone(),
            gated: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let f = fixture_with(slow.clone(), store, Duration::ZERO);

        let stale = f.cache.select(Scope::Collection("x".into()));
        let winner = async {
            slow.entered.notified().await;
            f.cache.select(Scope::Collection("y".into())).await.unwrap();
            slow.release.notify_one();
        };
        let (stale, ()) = tokio::join!(stale, winner);
        stale.unwrap();

        assert_eq!(f.store.listener_count(), 1);
        assert_eq!(f.registry.names(), vec!["cards:collection:y"]);
        assert_eq!(ids(&f.cache.cards()), vec!["c"]);
    }

    #[tokio::test]
    async fn teardown_releases_listener_and_clears_cards() {
        let f = fixture(Duration::ZERO);
        f.cache.select(Scope::All).await.unwrap();

        f.cache.teardown();

        assert_eq!(f.store.listener_count(), 0);
        assert!(f.registry.is_empty());
        assert!(f.cache.is_empty());
        assert_eq!(f.cache.state(), CacheState::Idle);

        // Writes after teardown reach nobody
        f.store.redeliver();
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn cleanup_all_releases_cache_feed() {
        let f = fixture(Duration::ZERO);
        f.cache.select(Scope::All).await.unwrap();

        assert_eq!(f.registry.cleanup_all(), 1);
        assert_eq!(f.store.listener_count(), 0);
        assert_eq!(f.registry.cleanup_all(), 0);
    }
}

// ==================== Live Updates Tests ====================

mod live_updates {
    use super::*;

    #[tokio::test]
    async fn remote_writes_are_pushed_into_the_cache() {
        let f = fixture(Duration::ZERO);
        f.cache.select(Scope::All).await.unwrap();
        let mut watch = f.cache.watch();

        f.store.delete("b").await.unwrap();

        assert_eq!(ids(&f.cache.cards()), vec!["a", "c"]);
        assert!(watch.has_changed().unwrap());
        assert_eq!(ids(&watch.borrow_and_update()), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn listener_failure_surfaces_as_error_state() {
        let f = fixture(Duration::ZERO);
        f.cache.select(Scope::All).await.unwrap();

        f.store.emit_error("connection reset");

        assert!(matches!(f.cache.state(), CacheState::Error(msg) if msg.contains("connection reset")));
        // Last good snapshot stays readable
        assert_eq!(f.cache.len(), 3);
    }

    #[tokio::test]
    async fn retry_reestablishes_after_subscribe_failure() {
        let f = fixture(Duration::ZERO);
        f.store
            .fail_next(StoreOp::Subscribe, Fault::Transient("offline".into()));

        assert!(f.cache.select(Scope::All).await.is_err());
        assert!(matches!(f.cache.state(), CacheState::Error(_)));

        f.cache.retry().await.unwrap();
        assert_eq!(f.cache.settled().await, CacheState::Synced);
        assert_eq!(f.cache.len(), 3);
    }
}

// ==================== Sold Overlay Tests ====================

mod overlay {
    use super::*;

    #[tokio::test]
    async fn overlay_ids_never_reach_readers() {
        let f = fixture(Duration::ZERO);
        f.overlay.add("b");

        f.cache.select(Scope::All).await.unwrap();

        assert_eq!(ids(&f.cache.cards()), vec!["a", "c"]);
        assert!(f.cache.get("b").is_none());
        assert!(!f.cache.watch().borrow().iter().any(|c| c.id == "b"));

        f.store.redeliver();
        assert!(!f.cache.cards().iter().any(|c| c.id == "b"));
    }

    #[tokio::test]
    async fn overlay_added_after_delivery_hides_at_read_time() {
        let f = fixture(Duration::ZERO);
        f.cache.select(Scope::All).await.unwrap();

        f.overlay.add("a");
        assert!(f.cache.get("a").is_none());
        assert_eq!(ids(&f.cache.cards()), vec!["b", "c"]);

        f.overlay.remove("a");
        f.store.redeliver();
        assert!(f.cache.get("a").is_some());
    }
}
