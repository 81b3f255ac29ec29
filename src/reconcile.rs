//! Ghost detection: cards cached locally that the store no longer knows

use std::sync::Arc;

use crate::error::ItemError;
use crate::events::{EventBus, InvalidationEvent};
use crate::models::Card;
use crate::overlay::SoldOverlay;
use crate::store::DocumentStore;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct GhostReport {
    pub ghosts: Vec<Card>,
    pub valid: Vec<Card>,
    /// Lookups that failed; these cards are neither ghost nor valid
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub removed_ids: Vec<String>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub detection: GhostReport,
    pub cleanup: CleanupReport,
}

/// Finds and purges ghost records
///
/// Candidates must carry remotely confirmed ids; pass
/// `CardCache::candidates()`, never the raw card list.
pub struct GhostReconciler {
    store: Arc<dyn DocumentStore>,
    events: EventBus,
    overlay: Option<Arc<SoldOverlay>>,
}

impl GhostReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            overlay: None,
        }
    }

    /// Also clear overlay entries of removed ghosts
    pub fn with_overlay(mut self, overlay: Arc<SoldOverlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub async fn detect(&self, candidates: &[Card]) -> GhostReport {
        let mut report = GhostReport::default();
        for card in candidates {
            match self.store.get_by_id(&card.id).await {
                Ok(_) => report.valid.push(card.clone()),
                Err(e) if e.is_not_found() => {
                    log::info!("Card {} ({}) is a ghost", card.id, card.name);
                    report.ghosts.push(card.clone());
                }
                Err(e) => {
                    log::warn!("Could not verify card {}: {}", card.id, e);
                    report.errors.push(ItemError::new(&card.id, e));
                }
            }
        }
        log::info!(
            "Checked {} card(s): {} ghost(s), {} valid, {} unverified",
            candidates.len(),
            report.ghosts.len(),
            report.valid.len(),
            report.errors.len()
        );
        report
    }

    /// Purge every ghost remotely, then broadcast the removed ids
    pub async fn cleanup(&self, ghosts: &[Card]) -> CleanupReport {
        let mut report = CleanupReport::default();
        for ghost in ghosts {
            match self.store.purge(&ghost.id).await {
                Ok(()) => report.removed_ids.push(ghost.id.clone()),
                Err(e) => {
                    log::error!("Failed to purge ghost {}: {}", ghost.id, e);
                    report.errors.push(ItemError::new(&ghost.id, e));
                }
            }
        }

        if report.removed_ids.is_empty() {
            return report;
        }
        if let Some(overlay) = &self.overlay {
            for id in &report.removed_ids {
                overlay.remove(id);
            }
        }
        let receivers = self.events.publish(InvalidationEvent {
            removed_ids: report.removed_ids.clone(),
        });
        log::info!(
            "Removed {} ghost(s), notified {} listener(s)",
            report.removed_ids.len(),
            receivers
        );
        report
    }

    pub async fn reconcile(&self, candidates: &[Card]) -> ReconcileReport {
        let detection = self.detect(candidates).await;
        let cleanup = self.cleanup(&detection.ghosts).await;
        ReconcileReport { detection, cleanup }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use std::collections::BTreeMap;

    fn card(id: &str, collection: &str) -> Card {
        Card {
            id: id.to_string(),
            collection_id: collection.to_string(),
            name: format!("Card {}", id),
            investment_amount: 5.0,
            current_value: 6.0,
            currency: "EUR".to_string(),
            serial: None,
            metadata: BTreeMap::new(),
        }
    }

    fn ids(cards: &[Card]) -> Vec<&str> {
        cards.iter().map(|c| c.id.as_str()).collect()
    }

    fn setup(all: &[&str], missing: &[&str]) -> (Arc<MemoryDocumentStore>, Vec<Card>) {
        let cards: Vec<Card> = all.iter().map(|id| card(id, "x")).collect();
        let store = Arc::new(MemoryDocumentStore::with_cards(cards.clone()));
        for id in missing {
            store.forget(id);
        }
        (store, cards)
    }

    #[tokio::test]
    async fn detect_splits_k_ghosts_from_valid() {
        let (store, cards) = setup(&["a", "b", "c", "d", "e"], &["b", "e"]);
        let reconciler = GhostReconciler::new(store, EventBus::new());

        let report = reconciler.detect(&cards).await;

        assert_eq!(ids(&report.ghosts), vec!["b", "e"]);
        assert_eq!(ids(&report.valid), vec!["a", "c", "d"]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_is_neither_ghost_nor_valid() {
        let (store, cards) = setup(&["a", "b", "c"], &["c"]);
        store.fail_lookup("b");
        let reconciler = GhostReconciler::new(store, EventBus::new());

        let report = reconciler.detect(&cards).await;

        assert_eq!(ids(&report.ghosts), vec!["c"]);
        assert_eq!(ids(&report.valid), vec!["a"]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].id, "b");
    }

    #[tokio::test]
    async fn event_lists_only_successfully_purged_ids() {
        let (store, cards) = setup(&["a", "b", "c"], &["a", "b", "c"]);
        store.fail_purge("b");
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let reconciler = GhostReconciler::new(store, events);

        let report = reconciler.cleanup(&cards).await;

        assert_eq!(report.removed_ids, vec!["a", "c"]);
        assert_eq!(report.errors.len(), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.removed_ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn nothing_removed_means_no_event() {
        let (store, _) = setup(&["a"], &[]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let reconciler = GhostReconciler::new(store, events);

        let report = reconciler.cleanup(&[]).await;

        assert!(report.removed_ids.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_clears_overlay_entries_of_removed_ghosts() {
        let (store, cards) = setup(&["a", "b"], &["a"]);
        let overlay = Arc::new(SoldOverlay::in_memory());
        overlay.add("a");
        let reconciler =
            GhostReconciler::new(store, EventBus::new()).with_overlay(overlay.clone());

        let report = reconciler.reconcile(&cards).await;

        assert_eq!(report.cleanup.removed_ids, vec!["a"]);
        assert!(!overlay.contains("a"));
    }
}
