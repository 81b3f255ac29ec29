//! Optimistic mutations against the card cache and the document store
//!
//! Every operation applies its change to the [`CardCache`] first, then
//! calls the store and either confirms or rolls back. Sales and deletes
//! hide their card through the [`SoldOverlay`] for the whole transaction;
//! every exit path pairs the `add` with a `remove`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::cache::CardCache;
use crate::error::{ItemError, Result, VaultError};
use crate::models::{Card, Collection, NewCard, SaleData, SoldRecord};
use crate::overlay::SoldOverlay;
use crate::store::DocumentStore;

/// Prefix of temporary ids given to optimistic creates
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Process-wide sync indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
}

/// Result of a bulk delete; failures are itemized, not thrown
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BulkDeleteReport {
    pub deleted: Vec<String>,
    pub errors: Vec<ItemError>,
}

impl BulkDeleteReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

fn validate_amounts(investment: f64, value: f64) -> Result<()> {
    if !investment.is_finite() || !value.is_finite() {
        return Err(VaultError::Validation(
            "Investment and current value must be finite numbers".to_string(),
        ));
    }
    Ok(())
}

fn validate_new_card(card: &NewCard) -> Result<()> {
    if card.collection_id.trim().is_empty() {
        return Err(VaultError::Validation("Card needs a collection".to_string()));
    }
    if card.name.trim().is_empty() {
        return Err(VaultError::Validation("Card needs a name".to_string()));
    }
    validate_amounts(card.investment_amount, card.current_value)
}

pub struct MutationEngine {
    store: Arc<dyn DocumentStore>,
    cache: CardCache,
    overlay: Arc<SoldOverlay>,
    collections: RwLock<Vec<Collection>>,
    sold: RwLock<Vec<SoldRecord>>,
    status: Arc<watch::Sender<SyncStatus>>,
    status_epoch: Arc<AtomicU64>,
    status_reset: Duration,
}

impl MutationEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: CardCache,
        overlay: Arc<SoldOverlay>,
        status_reset: Duration,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            store,
            cache,
            overlay,
            collections: RwLock::new(Vec::new()),
            sold: RwLock::new(Vec::new()),
            status: Arc::new(status),
            status_epoch: Arc::new(AtomicU64::new(0)),
            status_reset,
        }
    }

    /// Pull collections and sold records from the store
    pub async fn load(&self) -> Result<()> {
        let collections = self.store.collections().await?;
        let sold = self.store.sold_records().await?;
        log::info!(
            "Loaded {} collection(s) and {} sold record(s)",
            collections.len(),
            sold.len()
        );
        *self.write_collections() = collections;
        *self.write_sold() = sold;
        Ok(())
    }

    pub fn cache(&self) -> &CardCache {
        &self.cache
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.read_collections().clone()
    }

    pub fn collection(&self, id: &str) -> Option<Collection> {
        self.read_collections().iter().find(|c| c.id == id).cloned()
    }

    pub fn sold_records(&self) -> Vec<SoldRecord> {
        self.sold
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(VaultError::Validation("Collection needs a name".to_string()));
        }
        let collection = Collection {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            card_count: 0,
            description,
        };

        self.begin();
        if let Err(e) = self.store.save_collection(&collection).await {
            self.finish(SyncStatus::Error);
            return Err(e.into());
        }
        self.write_collections().push(collection.clone());
        self.finish(SyncStatus::Synced);
        log::info!("Created collection {} ({})", collection.name, collection.id);
        Ok(collection)
    }

    /// Create a card; it is visible immediately under a temporary id
    pub async fn create_card(&self, card: NewCard) -> Result<Card> {
        validate_new_card(&card)?;

        self.begin();
        let temp_id = format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4());
        self.cache.insert_pending(card.clone().with_id(temp_id.as_str()));

        match self.store.create(card).await {
            Ok(created) => {
                self.cache.confirm_pending(&temp_id, created.clone());
                self.adjust_card_count(&created.collection_id, 1).await;
                self.finish(SyncStatus::Synced);
                log::info!("Created card {} in {}", created.id, created.collection_id);
                Ok(created)
            }
            Err(e) => {
                log::error!("Failed to create card: {}", e);
                self.cache.discard_pending(&temp_id);
                self.finish(SyncStatus::Error);
                Err(e.into())
            }
        }
    }

    pub async fn update_card(&self, card: Card) -> Result<Card> {
        validate_amounts(card.investment_amount, card.current_value)?;

        self.begin();
        let previous = self.cache.replace(card.clone());
        let previous_collection = match &previous {
            Some(cached) => Some(cached.collection_id.clone()),
            None => self.stored_collection(&card.id).await,
        };

        match self.store.update(&card).await {
            Ok(updated) => {
                self.cache.settle_card(updated.clone());
                if let Some(from) = previous_collection {
                    if from != updated.collection_id {
                        self.adjust_card_count(&from, -1).await;
                        self.adjust_card_count(&updated.collection_id, 1).await;
                    }
                }
                self.finish(SyncStatus::Synced);
                Ok(updated)
            }
            Err(e) => {
                log::error!("Failed to update card {}: {}", card.id, e);
                if let Some(previous) = previous {
                    self.cache.replace(previous);
                }
                self.finish(SyncStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Delete one card. A card that is already gone remotely counts as deleted.
    pub async fn delete_card(&self, id: &str) -> Result<()> {
        self.begin();
        self.overlay.add(id);
        let snapshot = self.cache.take(id);
        let collection_id = match &snapshot {
            Some((_, card)) => Some(card.collection_id.clone()),
            None => self.stored_collection(id).await,
        };

        match self.store.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                log::info!("Card {} was already deleted remotely", id);
            }
            Err(e) => {
                log::error!("Failed to delete card {}: {}", id, e);
                self.overlay.remove(id);
                if let Some((index, card)) = snapshot {
                    self.cache.restore_at(index, card);
                }
                self.cache.refresh();
                self.finish(SyncStatus::Error);
                return Err(e.into());
            }
        }

        self.overlay.remove(id);
        if let Some(collection_id) = collection_id {
            self.adjust_card_count(&collection_id, -1).await;
        }
        self.finish(SyncStatus::Synced);
        Ok(())
    }

    /// Delete many cards with one batch call
    ///
    /// Cards leave the cache only after the batch returns. Per-id failures
    /// are reported, not thrown, and the failed cards stay cached at their
    /// old position; the call itself failing is an error.
    pub async fn delete_cards(&self, ids: &[String]) -> Result<BulkDeleteReport> {
        if ids.is_empty() {
            return Ok(BulkDeleteReport::default());
        }

        self.begin();
        // Taken before the overlay hides anything: deliveries pushed during
        // the batch arrive filtered.
        let mut snapshots = HashMap::new();
        let mut owners = HashMap::new();
        for id in ids {
            match self.cache.locate(id) {
                Some((index, card)) => {
                    owners.insert(id.clone(), card.collection_id.clone());
                    snapshots.insert(id.clone(), (index, card));
                }
                None => {
                    if let Some(collection_id) = self.stored_collection(id).await {
                        owners.insert(id.clone(), collection_id);
                    }
                }
            }
        }
        for id in ids {
            self.overlay.add(id);
        }

        let outcomes = match self.store.batch_delete(ids).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                log::error!("Batch delete of {} card(s) failed: {}", ids.len(), e);
                self.restore_snapshots(snapshots.into_values());
                for id in ids {
                    self.overlay.remove(id);
                }
                self.cache.refresh();
                self.finish(SyncStatus::Error);
                return Err(e.into());
            }
        };

        let mut report = BulkDeleteReport::default();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Err(e) if !e.is_not_found() => {
                    log::warn!("Failed to delete card {}: {}", outcome.id, e);
                    if let Some(snapshot) = snapshots.remove(&outcome.id) {
                        failed.push(snapshot);
                    }
                    report.errors.push(ItemError::new(&outcome.id, e));
                }
                _ => {
                    self.cache.remove(&outcome.id);
                    if let Some(collection_id) = owners.get(&outcome.id) {
                        self.adjust_card_count(collection_id, -1).await;
                    }
                    report.deleted.push(outcome.id);
                }
            }
        }
        self.restore_snapshots(failed);
        for id in ids {
            self.overlay.remove(id);
        }
        self.cache.refresh();

        log::info!(
            "Bulk delete finished: {} deleted, {} failed",
            report.deleted.len(),
            report.errors.len()
        );
        self.finish(if report.is_complete() {
            SyncStatus::Synced
        } else {
            SyncStatus::Error
        });
        Ok(report)
    }

    /// Re-insert cards in their original order
    fn restore_snapshots(&self, snapshots: impl IntoIterator<Item = (usize, Card)>) {
        let mut snapshots: Vec<(usize, Card)> = snapshots.into_iter().collect();
        snapshots.sort_by_key(|(index, _)| *index);
        for (index, card) in snapshots {
            self.cache.restore_at(index, card);
        }
    }

    /// Collection a card belongs to according to the store, for cards
    /// outside the cached selection
    async fn stored_collection(&self, id: &str) -> Option<String> {
        match self.store.get_by_id(id).await {
            Ok(card) => Some(card.collection_id),
            Err(e) => {
                if !e.is_not_found() {
                    log::warn!("Could not look up collection of card {}: {}", id, e);
                }
                None
            }
        }
    }

    /// Move a card to the sold list
    ///
    /// When the store no longer knows the card, the sold record is built
    /// from the last local snapshot and written back; the sale still
    /// succeeds. Any other failure restores the card and is returned.
    pub async fn mark_card_as_sold(&self, id: &str, sale: SaleData) -> Result<SoldRecord> {
        sale.validate()?;

        self.begin();
        self.overlay.add(id);
        let snapshot = self.cache.take(id);

        let record = match self.store.mark_sold(id, &sale).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => match &snapshot {
                Some((_, card)) => {
                    log::warn!(
                        "Card {} not found remotely, recording sale from local data",
                        id
                    );
                    self.record_fallback_sale(card, &sale).await
                }
                None => {
                    self.overlay.remove(id);
                    self.finish(SyncStatus::Error);
                    return Err(VaultError::NotFound(id.to_string()));
                }
            },
            Err(e) => {
                log::error!("Failed to mark card {} as sold: {}", id, e);
                self.overlay.remove(id);
                if let Some((index, card)) = snapshot {
                    self.cache.restore_at(index, card);
                }
                self.cache.refresh();
                self.finish(SyncStatus::Error);
                return Err(e.into());
            }
        };

        self.write_sold().push(record.clone());
        self.adjust_card_count(&record.collection_id, -1).await;
        self.overlay.remove(id);
        self.finish(SyncStatus::Synced);
        log::info!(
            "Sold card {} for {:.2} (profit {:.2})",
            id,
            record.sold_price,
            record.profit
        );
        Ok(record)
    }

    async fn record_fallback_sale(&self, card: &Card, sale: &SaleData) -> SoldRecord {
        let synthesized = SoldRecord::from_card(card, sale);
        match self.store.record_sale(&synthesized).await {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!(
                    "Failed to write fallback sold record for {}: {}",
                    card.id,
                    e
                );
                synthesized
            }
        }
    }

    /// Shift a collection's card count, never below zero, and persist it
    async fn adjust_card_count(&self, collection_id: &str, delta: i64) {
        let updated = {
            let mut collections = self.write_collections();
            match collections.iter_mut().find(|c| c.id == collection_id) {
                Some(collection) => {
                    let count = (i64::from(collection.card_count) + delta).max(0);
                    collection.card_count = u32::try_from(count).unwrap_or(u32::MAX);
                    collection.clone()
                }
                None => {
                    log::debug!("No local collection {} to update", collection_id);
                    return;
                }
            }
        };
        if let Err(e) = self.store.save_collection(&updated).await {
            log::warn!(
                "Failed to persist card count of collection {}: {}",
                collection_id,
                e
            );
        }
    }

    fn begin(&self) {
        self.status_epoch.fetch_add(1, Ordering::SeqCst);
        self.status.send_replace(SyncStatus::Syncing);
    }

    /// Publish the final status and schedule the fall back to idle
    fn finish(&self, status: SyncStatus) {
        let epoch = self.status_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(status);

        let sender = Arc::clone(&self.status);
        let epochs = Arc::clone(&self.status_epoch);
        let delay = self.status_reset;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if epochs.load(Ordering::SeqCst) == epoch {
                sender.send_replace(SyncStatus::Idle);
            }
        });
    }

    fn read_collections(&self) -> RwLockReadGuard<'_, Vec<Collection>> {
        self.collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_collections(&self) -> RwLockWriteGuard<'_, Vec<Collection>> {
        self.collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sold(&self) -> RwLockWriteGuard<'_, Vec<SoldRecord>> {
        self.sold
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "mutations_tests.rs"]
mod tests;
