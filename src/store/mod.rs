//! Contracts for the remote collaborators plus local implementations
//!
//! The engine only talks to [`DocumentStore`] and [`BlobStore`]; concrete
//! stores are injected at construction time.

mod blob_fs;
mod database;
mod feed;
mod memory;

pub use blob_fs::FsBlobStore;
pub use database::SqliteDocumentStore;
pub use feed::{FeedCallback, FeedDelivery, FeedHub, Unsubscribe};
pub use memory::{Fault, MemoryBlobStore, MemoryDocumentStore, StoreOp};

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{Card, Collection, NewCard, SaleData, Scope, SoldRecord};

/// Outcome of one id inside a batch delete
#[derive(Debug)]
pub struct DeleteOutcome {
    pub id: String,
    pub result: StoreResult<()>,
}

/// Remote holder of cards, collections and sold records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_all(&self, scope: &Scope) -> StoreResult<Vec<Card>>;

    /// Start a live feed; the callback receives the full scope snapshot on
    /// every change. Dropping the returned closure without calling it leaks
    /// the listener.
    async fn subscribe(&self, scope: &Scope, callback: FeedCallback) -> StoreResult<Unsubscribe>;

    /// `StoreError::NotFound` when the card does not exist
    async fn get_by_id(&self, id: &str) -> StoreResult<Card>;

    async fn create(&self, card: NewCard) -> StoreResult<Card>;
    async fn update(&self, card: &Card) -> StoreResult<Card>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
    async fn batch_delete(&self, ids: &[String]) -> StoreResult<Vec<DeleteOutcome>>;

    /// Move a card to the sold list; `StoreError::NotFound` when the card
    /// is already gone
    async fn mark_sold(&self, id: &str, sale: &SaleData) -> StoreResult<SoldRecord>;

    /// Authoritative write of a sold record built by the caller
    async fn record_sale(&self, record: &SoldRecord) -> StoreResult<SoldRecord>;

    /// Remove every residual artifact of a card; succeeds when nothing is left
    async fn purge(&self, id: &str) -> StoreResult<()>;

    async fn collections(&self) -> StoreResult<Vec<Collection>>;
    async fn save_collection(&self, collection: &Collection) -> StoreResult<()>;
    async fn sold_records(&self) -> StoreResult<Vec<SoldRecord>>;
}

/// Reference to an object in a [`BlobStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Object name without its prefix, e.g. `abc.jpg`
    pub name: String,
    /// Full object path, e.g. `backup/images/abc.jpg`
    pub path: String,
}

impl AssetRef {
    pub fn new(prefix: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: join_path(prefix, name),
        }
    }

    /// Object name with its extension stripped
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => &self.name,
        }
    }

    pub fn extension(&self) -> Option<&str> {
        self.name.rsplit_once('.').map(|(_, ext)| ext)
    }
}

/// Join blob path segments with `/`
pub fn join_path(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Remote holder of binary backup artifacts
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Objects directly below `prefix`
    async fn list(&self, prefix: &str) -> StoreResult<Vec<AssetRef>>;
    async fn upload(&self, path: &str, bytes: &[u8]) -> StoreResult<()>;
    /// `StoreError::NotFound` when no object exists at `path`
    async fn download(&self, path: &str) -> StoreResult<Vec<u8>>;
    async fn delete(&self, asset: &AssetRef) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_ref_splits_stem_and_extension() {
        let asset = AssetRef::new("backup/images", "card-1.webp");
        assert_eq!(asset.path, "backup/images/card-1.webp");
        assert_eq!(asset.stem(), "card-1");
        assert_eq!(asset.extension(), Some("webp"));
    }

    #[test]
    fn join_path_handles_empty_and_trailing_slash() {
        assert_eq!(join_path("", "metadata.json"), "metadata.json");
        assert_eq!(join_path("backup/", "metadata.json"), "backup/metadata.json");
    }
}
