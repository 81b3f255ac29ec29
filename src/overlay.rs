//! Pending-exclusion overlay for cards mid sale/delete
//!
//! The effective exclusion set is the in-memory set unioned with the id
//! arrays held by up to two persisted key-value stores (primary and
//! legacy). The persisted stores are re-read on every [`SoldOverlay::apply`]
//! so ids written before a crash or reload keep hiding their cards.
//!
//! The overlay is pure data: caches query it, it never queries a cache.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreResult;
use crate::models::Card;

/// Default key of the primary persisted store
pub const PRIMARY_KEY: &str = "pending_sold_cards";
/// Default key of the legacy persisted store
pub const LEGACY_KEY: &str = "pendingSoldCardIds";

/// Minimal string key-value store
///
/// Entries are read-merge-written without locking; last writer wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Key-value store kept in memory
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Key-value store persisted as a single JSON object file
pub struct JsonFileKvStore {
    path: PathBuf,
}

impl JsonFileKvStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn load(&self) -> StoreResult<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl KeyValueStore for JsonFileKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.load()?.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), Value::String(value.to_string()));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }
}

/// A persisted store together with the key holding the id array
pub struct PersistedIds {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PersistedIds {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Read the id array; unreadable or malformed contents count as empty
    fn read(&self) -> Vec<String> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("Failed to read pending ids under {}: {}", self.key, e);
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Ignoring malformed pending ids under {}: {}", self.key, e);
                Vec::new()
            }
        }
    }

    fn write(&self, ids: &[String]) {
        let result = serde_json::to_string(ids)
            .map_err(Into::into)
            .and_then(|json| self.store.set(&self.key, &json));
        if let Err(e) = result {
            log::warn!("Failed to persist pending ids under {}: {}", self.key, e);
        }
    }

    fn insert(&self, id: &str) {
        let mut ids = self.read();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            self.write(&ids);
        }
    }

    fn remove(&self, id: &str) {
        let ids = self.read();
        if ids.iter().any(|existing| existing == id) {
            let remaining: Vec<String> = ids.into_iter().filter(|e| e != id).collect();
            self.write(&remaining);
        }
    }
}

/// Multi-source set of card ids hidden pending a sale or delete
pub struct SoldOverlay {
    pending: Mutex<HashSet<String>>,
    primary: Option<PersistedIds>,
    legacy: Option<PersistedIds>,
}

impl SoldOverlay {
    /// Overlay without persistence
    pub fn in_memory() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            primary: None,
            legacy: None,
        }
    }

    pub fn new(primary: Option<PersistedIds>, legacy: Option<PersistedIds>) -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            primary,
            legacy,
        }
    }

    /// Hide a card; called before any remote call of its transaction
    pub fn add(&self, id: &str) {
        self.lock().insert(id.to_string());
        if let Some(primary) = &self.primary {
            primary.insert(id);
        }
        log::debug!("Card {} added to sold overlay", id);
    }

    /// Stop hiding a card; called once its transaction has terminated
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
        for store in [&self.primary, &self.legacy].into_iter().flatten() {
            store.remove(id);
        }
        log::debug!("Card {} removed from sold overlay", id);
    }

    /// The deduplicated union of all sources, read fresh
    pub fn excluded(&self) -> HashSet<String> {
        let mut ids = self.lock().clone();
        for store in [&self.primary, &self.legacy].into_iter().flatten() {
            ids.extend(store.read());
        }
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.excluded().contains(id)
    }

    /// Drop every record whose id is currently excluded
    pub fn apply(&self, records: Vec<Card>) -> Vec<Card> {
        let excluded = self.excluded();
        if excluded.is_empty() {
            return records;
        }
        let before = records.len();
        let filtered: Vec<Card> = records
            .into_iter()
            .filter(|card| !excluded.contains(&card.id))
            .collect();
        if filtered.len() != before {
            log::debug!(
                "Sold overlay hid {} card(s) from delivery",
                before - filtered.len()
            );
        }
        filtered
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "overlay_tests.rs"]
mod tests;
