//! Card Vault - collectible card inventory engine
//!
//! Keeps a live, locally cached view of a remote card store in sync:
//! optimistic mutations with rollback, an exclusion overlay for cards in
//! the middle of being sold, ghost-record reconciliation and incremental
//! image backups.

pub mod backup;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod models;
pub mod mutations;
pub mod overlay;
pub mod reconcile;
pub mod store;
pub mod subscriptions;

pub use backup::{BackupSummary, IncrementalSyncDiffer, LocalSnapshot, SyncPlan};
pub use cache::{CacheState, CardCache};
pub use config::VaultConfig;
pub use error::{ItemError, Result, StoreError, StoreResult, VaultError};
pub use events::{EventBus, InvalidationEvent};
pub use models::{
    BackupMetadata, Card, Collection, CollectionSnapshot, ImageAsset, ImageFormat, NewCard,
    SaleData, Scope, SoldRecord,
};
pub use mutations::{BulkDeleteReport, MutationEngine, SyncStatus};
pub use overlay::SoldOverlay;
pub use reconcile::{CleanupReport, GhostReconciler, GhostReport};
pub use store::{BlobStore, DocumentStore};
pub use subscriptions::{SubscriptionId, SubscriptionRegistry};
