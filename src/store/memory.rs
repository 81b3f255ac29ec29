//! In-process document and blob stores with fault injection

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::feed::{FeedCallback, FeedHub, Unsubscribe};
use super::{join_path, AssetRef, BlobStore, DeleteOutcome, DocumentStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{Card, Collection, NewCard, SaleData, Scope, SoldRecord};

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Subscribe,
    GetAll,
    GetById,
    Create,
    Update,
    Delete,
    BatchDelete,
    MarkSold,
    RecordSale,
    Purge,
    SaveCollection,
    List,
    Upload,
    Download,
    DeleteBlob,
}

/// Injected failure kind
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    NotFound,
    Transient(String),
}

impl Fault {
    fn into_error(self, id: &str) -> StoreError {
        match self {
            Fault::NotFound => StoreError::NotFound(id.to_string()),
            Fault::Transient(msg) => StoreError::Transient(msg),
        }
    }
}

#[derive(Default)]
struct FaultPlan {
    queued: HashMap<StoreOp, VecDeque<Fault>>,
    calls: HashMap<StoreOp, usize>,
}

impl FaultPlan {
    fn check(&mut self, op: StoreOp, id: &str) -> StoreResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.queued.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(fault) => Err(fault.into_error(id)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct DocumentState {
    cards: BTreeMap<String, Card>,
    collections: BTreeMap<String, Collection>,
    sold: Vec<SoldRecord>,
    faults: FaultPlan,
    failing_lookups: HashSet<String>,
    failing_batch_items: HashSet<String>,
    failing_purges: HashSet<String>,
}

impl DocumentState {
    fn snapshot(&self, scope: &Scope) -> Vec<Card> {
        self.cards
            .values()
            .filter(|card| scope.matches(card))
            .cloned()
            .collect()
    }
}

/// Document store held entirely in memory
///
/// Behaves like a push-capable remote store: every write re-delivers the
/// affected scopes to live listeners. The `fail_*`, `forget` and
/// `emit_error` hooks simulate remote misbehaviour.
pub struct MemoryDocumentStore {
    state: Mutex<DocumentState>,
    hub: Arc<FeedHub>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DocumentState::default()),
            hub: FeedHub::new(),
        }
    }

    /// Seed the store without notifying listeners
    pub fn with_cards(cards: impl IntoIterator<Item = Card>) -> Self {
        let store = Self::new();
        for card in cards {
            store.insert_silently(card);
        }
        store
    }

    pub fn insert_silently(&self, card: Card) {
        self.lock().cards.insert(card.id.clone(), card);
    }

    pub fn insert_collection(&self, collection: Collection) {
        self.lock()
            .collections
            .insert(collection.id.clone(), collection);
    }

    /// Drop a card without telling listeners, leaving a ghost in any cache
    pub fn forget(&self, id: &str) -> Option<Card> {
        self.lock().cards.remove(id)
    }

    /// Make the next call of `op` fail with `fault`
    pub fn fail_next(&self, op: StoreOp, fault: Fault) {
        self.lock()
            .faults
            .queued
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// Make every `get_by_id` for `id` fail transiently
    pub fn fail_lookup(&self, id: &str) {
        self.lock().failing_lookups.insert(id.to_string());
    }

    /// Make `id` fail inside every batch delete
    pub fn fail_batch_item(&self, id: &str) {
        self.lock().failing_batch_items.insert(id.to_string());
    }

    pub fn fail_purge(&self, id: &str) {
        self.lock().failing_purges.insert(id.to_string());
    }

    /// Push a listener failure to every live feed
    pub fn emit_error(&self, message: &str) {
        self.hub.fail_all(message);
    }

    /// Re-deliver current snapshots to every listener
    pub fn redeliver(&self) {
        self.notify(&[]);
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().faults.calls.get(&op).copied().unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.hub.len()
    }

    pub fn card(&self, id: &str) -> Option<Card> {
        self.lock().cards.get(id).cloned()
    }

    pub fn collection(&self, id: &str) -> Option<Collection> {
        self.lock().collections.get(id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, touched: &[String]) {
        self.hub
            .notify(touched, |scope| Ok(self.lock().snapshot(scope)));
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_all(&self, scope: &Scope) -> StoreResult<Vec<Card>> {
        let mut state = self.lock();
        state.faults.check(StoreOp::GetAll, "*")?;
        Ok(state.snapshot(scope))
    }

    async fn subscribe(&self, scope: &Scope, callback: FeedCallback) -> StoreResult<Unsubscribe> {
        let initial = {
            let mut state = self.lock();
            state.faults.check(StoreOp::Subscribe, &scope.to_string())?;
            state.snapshot(scope)
        };
        let unsubscribe = self.hub.add(scope.clone(), Arc::clone(&callback));
        callback(Ok(initial));
        Ok(unsubscribe)
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Card> {
        let mut state = self.lock();
        state.faults.check(StoreOp::GetById, id)?;
        if state.failing_lookups.contains(id) {
            return Err(StoreError::Transient(format!("lookup of {} timed out", id)));
        }
        state
            .cards
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create(&self, card: NewCard) -> StoreResult<Card> {
        let card = {
            let mut state = self.lock();
            state.faults.check(StoreOp::Create, &card.name)?;
            let card = card.with_id(uuid::Uuid::new_v4().to_string());
            state.cards.insert(card.id.clone(), card.clone());
            card
        };
        self.notify(&[card.collection_id.clone()]);
        Ok(card)
    }

    async fn update(&self, card: &Card) -> StoreResult<Card> {
        let previous = {
            let mut state = self.lock();
            state.faults.check(StoreOp::Update, &card.id)?;
            let previous = state
                .cards
                .get(&card.id)
                .map(|c| c.collection_id.clone())
                .ok_or_else(|| StoreError::NotFound(card.id.clone()))?;
            state.cards.insert(card.id.clone(), card.clone());
            previous
        };
        self.notify(&[previous, card.collection_id.clone()]);
        Ok(card.clone())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let removed = {
            let mut state = self.lock();
            state.faults.check(StoreOp::Delete, id)?;
            state
                .cards
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?
        };
        self.notify(&[removed.collection_id]);
        Ok(())
    }

    async fn batch_delete(&self, ids: &[String]) -> StoreResult<Vec<DeleteOutcome>> {
        let mut touched = Vec::new();
        let outcomes = {
            let mut state = self.lock();
            state.faults.check(StoreOp::BatchDelete, "*")?;
            let mut outcomes = Vec::with_capacity(ids.len());
            for id in ids {
                let result = if state.failing_batch_items.contains(id) {
                    Err(StoreError::Transient(format!("delete of {} rejected", id)))
                } else {
                    match state.cards.remove(id) {
                        Some(card) => {
                            touched.push(card.collection_id);
                            Ok(())
                        }
                        None => Err(StoreError::NotFound(id.clone())),
                    }
                };
                outcomes.push(DeleteOutcome {
                    id: id.clone(),
                    result,
                });
            }
            outcomes
        };
        if !touched.is_empty() {
            self.notify(&touched);
        }
        Ok(outcomes)
    }

    async fn mark_sold(&self, id: &str, sale: &SaleData) -> StoreResult<SoldRecord> {
        let record = {
            let mut state = self.lock();
            state.faults.check(StoreOp::MarkSold, id)?;
            let card = state
                .cards
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let record = SoldRecord::from_card(&card, sale);
            state.sold.push(record.clone());
            record
        };
        self.notify(&[record.collection_id.clone()]);
        Ok(record)
    }

    async fn record_sale(&self, record: &SoldRecord) -> StoreResult<SoldRecord> {
        let removed = {
            let mut state = self.lock();
            state.faults.check(StoreOp::RecordSale, &record.original_card_id)?;
            if let Some(existing) = state
                .sold
                .iter()
                .find(|s| s.original_card_id == record.original_card_id)
            {
                return Ok(existing.clone());
            }
            state.sold.push(record.clone());
            state.cards.remove(&record.original_card_id)
        };
        if let Some(card) = removed {
            self.notify(&[card.collection_id]);
        }
        Ok(record.clone())
    }

    async fn purge(&self, id: &str) -> StoreResult<()> {
        let removed = {
            let mut state = self.lock();
            state.faults.check(StoreOp::Purge, id)?;
            if state.failing_purges.contains(id) {
                return Err(StoreError::Transient(format!("purge of {} rejected", id)));
            }
            state.cards.remove(id)
        };
        if let Some(card) = removed {
            self.notify(&[card.collection_id]);
        }
        Ok(())
    }

    async fn collections(&self) -> StoreResult<Vec<Collection>> {
        Ok(self.lock().collections.values().cloned().collect())
    }

    async fn save_collection(&self, collection: &Collection) -> StoreResult<()> {
        let mut state = self.lock();
        state.faults.check(StoreOp::SaveCollection, &collection.id)?;
        state
            .collections
            .insert(collection.id.clone(), collection.clone());
        Ok(())
    }

    async fn sold_records(&self) -> StoreResult<Vec<SoldRecord>> {
        Ok(self.lock().sold.clone())
    }
}

#[derive(Default)]
struct BlobState {
    objects: BTreeMap<String, Vec<u8>>,
    faults: FaultPlan,
    failing_paths: HashSet<String>,
}

/// Blob store held in memory, keyed by full object path
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<BlobState>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bytes: &[u8]) {
        self.lock().objects.insert(path.to_string(), bytes.to_vec());
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Make every upload or delete touching `path` fail
    pub fn fail_path(&self, path: &str) {
        self.lock().failing_paths.insert(path.to_string());
    }

    pub fn fail_next(&self, op: StoreOp, fault: Fault) {
        self.lock()
            .faults
            .queued
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().faults.calls.get(&op).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, BlobState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, prefix: &str) -> StoreResult<Vec<AssetRef>> {
        let mut state = self.lock();
        state.faults.check(StoreOp::List, prefix)?;
        let dir = join_path(prefix, "");
        Ok(state
            .objects
            .keys()
            .filter_map(|path| path.strip_prefix(&dir))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(|name| AssetRef::new(prefix, name))
            .collect())
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        let mut state = self.lock();
        state.faults.check(StoreOp::Upload, path)?;
        if state.failing_paths.contains(path) {
            return Err(StoreError::Transient(format!("upload of {} failed", path)));
        }
        state.objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn download(&self, path: &str) -> StoreResult<Vec<u8>> {
        let mut state = self.lock();
        state.faults.check(StoreOp::Download, path)?;
        state
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn delete(&self, asset: &AssetRef) -> StoreResult<()> {
        let mut state = self.lock();
        state.faults.check(StoreOp::DeleteBlob, &asset.path)?;
        if state.failing_paths.contains(&asset.path) {
            return Err(StoreError::Transient(format!(
                "delete of {} failed",
                asset.path
            )));
        }
        state
            .objects
            .remove(&asset.path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(asset.path.clone()))
    }
}
