//! Incremental backup of collections and card images to a blob store
//!
//! Collections are cheap and always re-uploaded in full. Images are
//! diffed against the ids already present remotely so that a backup only
//! transfers what changed. Images of cards that no longer exist locally
//! are never uploaded.
//!
//! Remote layout under the configured prefix:
//!
//! ```text
//! <prefix>/metadata.json
//! <prefix>/collections.json
//! <prefix>/images/<card id>.<ext>
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{ItemError, Result, StoreError};
use crate::ingest;
use crate::models::{BackupMetadata, CollectionSnapshot, ImageAsset, ImageFormat};
use crate::store::{join_path, AssetRef, BlobStore};

pub const METADATA_FILE: &str = "metadata.json";
pub const COLLECTIONS_FILE: &str = "collections.json";
pub const IMAGES_DIR: &str = "images";

/// Everything a backup is computed from
#[derive(Debug, Default, Clone)]
pub struct LocalSnapshot {
    pub collections: Vec<CollectionSnapshot>,
    /// Legacy `{ collectionName: [records] }` view, scanned only when
    /// `collections` yields no card ids
    pub by_name: BTreeMap<String, Vec<Value>>,
    pub images: Vec<ImageAsset>,
}

impl LocalSnapshot {
    /// Ids of every card that may own an image
    pub fn valid_card_ids(&self) -> HashSet<String> {
        let ids: HashSet<String> = self
            .collections
            .iter()
            .flat_map(|snapshot| snapshot.cards.iter().map(|card| card.id.clone()))
            .collect();
        if !ids.is_empty() {
            return ids;
        }

        log::warn!("No card ids found in collections, scanning collections by name");
        ingest::cards_from_collections_by_name(&self.by_name)
            .into_iter()
            .map(|card| card.id)
            .collect()
    }
}

/// Image delta between a local snapshot and a remote backup
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncPlan {
    pub images_to_add: Vec<String>,
    pub images_to_remove: Vec<String>,
    /// Local images without an owning card; never uploaded
    pub orphans: Vec<String>,
}

/// Upload progress, reported after each image attempt
#[derive(Debug, Clone, PartialEq)]
pub struct BackupProgress {
    pub current: usize,
    pub total: usize,
    pub image_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupSummary {
    pub added_count: usize,
    pub removed_count: usize,
    pub collections_count: usize,
    pub timestamp: DateTime<Utc>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoredBackup {
    pub metadata: BackupMetadata,
    pub collections: Vec<CollectionSnapshot>,
    pub images: Vec<ImageAsset>,
}

pub struct IncrementalSyncDiffer {
    blobs: Arc<dyn BlobStore>,
    prefix: String,
}

impl IncrementalSyncDiffer {
    pub fn new(blobs: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            blobs,
            prefix: prefix.into(),
        }
    }

    fn path(&self, name: &str) -> String {
        join_path(&self.prefix, name)
    }

    fn images_prefix(&self) -> String {
        self.path(IMAGES_DIR)
    }

    /// Compute the image delta without touching any store
    pub fn plan(snapshot: &LocalSnapshot, remote_ids: &BTreeSet<String>) -> SyncPlan {
        let valid = snapshot.valid_card_ids();
        let mut local = BTreeSet::new();
        let mut orphans = Vec::new();
        for image in &snapshot.images {
            if valid.contains(&image.id) {
                local.insert(image.id.clone());
            } else {
                orphans.push(image.id.clone());
            }
        }

        SyncPlan {
            images_to_add: local.difference(remote_ids).cloned().collect(),
            images_to_remove: remote_ids.difference(&local).cloned().collect(),
            orphans,
        }
    }

    /// Metadata of the latest backup, `None` when there is none yet
    pub async fn remote_metadata(&self) -> Result<Option<BackupMetadata>> {
        let bytes = match self.blobs.download(&self.path(METADATA_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                log::warn!("Ignoring unreadable backup metadata: {}", e);
                Ok(None)
            }
        }
    }

    async fn remote_images(&self) -> Result<Vec<AssetRef>> {
        match self.blobs.list(&self.images_prefix()).await {
            Ok(assets) => Ok(assets),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn run(&self, snapshot: &LocalSnapshot) -> Result<BackupSummary> {
        self.run_with_progress(snapshot, |_| {}).await
    }

    /// Back up `snapshot`, transferring only images the remote lacks
    ///
    /// Metadata and collections failures abort the run. Per-image
    /// failures are logged, collected and skipped.
    pub async fn run_with_progress<F>(
        &self,
        snapshot: &LocalSnapshot,
        mut progress: F,
    ) -> Result<BackupSummary>
    where
        F: FnMut(&BackupProgress) + Send,
    {
        let previous = self.remote_metadata().await?;
        let remote = self.remote_images().await?;
        let remote_ids: BTreeSet<String> = remote.iter().map(|a| a.stem().to_string()).collect();
        let plan = Self::plan(snapshot, &remote_ids);
        if !plan.orphans.is_empty() {
            log::info!("Skipping {} orphaned image(s)", plan.orphans.len());
        }

        let timestamp = Utc::now();
        let metadata = BackupMetadata {
            timestamp,
            collection_count: snapshot.collections.len(),
            image_count: snapshot.images.len() - plan.orphans.len(),
            incremental_update: previous.is_some(),
            last_full_backup: previous.as_ref().map(|m| m.timestamp),
        };
        log::info!(
            "Starting {} backup: {} image(s) to add, {} to remove",
            if metadata.incremental_update { "incremental" } else { "full" },
            plan.images_to_add.len(),
            plan.images_to_remove.len()
        );

        let metadata_json = serde_json::to_vec_pretty(&metadata).map_err(StoreError::from)?;
        self.blobs
            .upload(&self.path(METADATA_FILE), &metadata_json)
            .await?;
        let collections_json =
            serde_json::to_vec_pretty(&snapshot.collections).map_err(StoreError::from)?;
        self.blobs
            .upload(&self.path(COLLECTIONS_FILE), &collections_json)
            .await?;

        let mut errors = Vec::new();
        let mut added_count = 0;
        let total = plan.images_to_add.len();
        for (index, id) in plan.images_to_add.iter().enumerate() {
            let Some(image) = snapshot.images.iter().find(|image| &image.id == id) else {
                continue;
            };
            let path = join_path(&self.images_prefix(), &image.file_name());
            match self.blobs.upload(&path, &image.bytes).await {
                Ok(()) => added_count += 1,
                Err(e) => {
                    log::warn!("Failed to upload image {}: {}", id, e);
                    errors.push(ItemError::new(id, e));
                }
            }
            progress(&BackupProgress {
                current: index + 1,
                total,
                image_id: id.clone(),
            });
        }

        let mut removed_count = 0;
        for id in &plan.images_to_remove {
            // The stored format is only known from the listing
            for asset in remote.iter().filter(|asset| asset.stem() == id) {
                match self.blobs.delete(asset).await {
                    Ok(()) => removed_count += 1,
                    Err(e) => {
                        log::warn!("Failed to delete remote image {}: {}", asset.path, e);
                        errors.push(ItemError::new(id, e));
                    }
                }
            }
        }

        log::info!(
            "Backup finished: {} added, {} removed, {} collection(s), {} error(s)",
            added_count,
            removed_count,
            snapshot.collections.len(),
            errors.len()
        );
        Ok(BackupSummary {
            added_count,
            removed_count,
            collections_count: snapshot.collections.len(),
            timestamp,
            errors,
        })
    }

    /// Download the latest backup; unreadable images are skipped
    pub async fn restore(&self) -> Result<RestoredBackup> {
        let metadata = match self.remote_metadata().await? {
            Some(metadata) => metadata,
            None => {
                return Err(StoreError::NotFound(self.path(METADATA_FILE)).into());
            }
        };
        let bytes = self.blobs.download(&self.path(COLLECTIONS_FILE)).await?;
        let collections: Vec<CollectionSnapshot> =
            serde_json::from_slice(&bytes).map_err(StoreError::from)?;

        let mut images = Vec::new();
        for asset in self.remote_images().await? {
            let Some(format) = asset.extension().and_then(ImageFormat::from_extension) else {
                log::debug!("Skipping non-image object {}", asset.path);
                continue;
            };
            match self.blobs.download(&asset.path).await {
                Ok(bytes) => images.push(ImageAsset {
                    id: asset.stem().to_string(),
                    bytes,
                    format,
                }),
                Err(e) => log::warn!("Failed to download {}: {}", asset.path, e),
            }
        }

        log::info!(
            "Restored backup from {}: {} collection(s), {} image(s)",
            metadata.timestamp,
            collections.len(),
            images.len()
        );
        Ok(RestoredBackup {
            metadata,
            collections,
            images,
        })
    }
}

/// Read every image in `dir`, named `<card id>.<ext>`
pub async fn load_local_images(dir: &Path) -> Result<Vec<ImageAsset>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::from(e).into()),
    };

    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StoreError::from)? {
        let path = entry.path();
        let (Some(stem), Some(format)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(ImageFormat::from_extension),
        ) else {
            continue;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => images.push(ImageAsset {
                id: stem.to_string(),
                bytes,
                format,
            }),
            Err(e) => log::warn!("Failed to read image {:?}: {}", path, e),
        }
    }
    images.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(images)
}

/// Write images into `dir`, overwriting existing files
pub async fn save_local_images(dir: &Path, images: &[ImageAsset]) -> Result<usize> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(StoreError::from)?;
    let mut written = 0;
    for image in images {
        let path = dir.join(image.file_name());
        match tokio::fs::write(&path, &image.bytes).await {
            Ok(()) => written += 1,
            Err(e) => log::warn!("Failed to write image {:?}: {}", path, e),
        }
    }
    Ok(written)
}

#[cfg(test)]
#[path = "backup_tests.rs"]
mod tests;
