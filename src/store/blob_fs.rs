//! Directory-backed blob store
//!
//! Object paths map to files below the root directory, so a backup with
//! prefix `backup` lands in `<root>/backup/metadata.json`,
//! `<root>/backup/collections.json` and `<root>/backup/images/<id>.<ext>`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use super::{AssetRef, BlobStore};
use crate::error::{StoreError, StoreResult};

/// Blob store rooted at a local directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: &Path) -> Self {
        if let Err(e) = std::fs::create_dir_all(root) {
            log::warn!("Failed to create blob store directory: {}", e);
        } else {
            log::info!("Blob store directory: {:?}", root);
        }
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::Transient(format!(
                "Refusing object path outside the store: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn not_found_as_typed(err: std::io::Error, path: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, prefix: &str) -> StoreResult<Vec<AssetRef>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut refs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                refs.push(AssetRef::new(prefix, name));
            }
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        log::debug!("Stored {} ({} bytes)", path, bytes.len());
        Ok(())
    }

    async fn download(&self, path: &str) -> StoreResult<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| not_found_as_typed(e, path))
    }

    async fn delete(&self, asset: &AssetRef) -> StoreResult<()> {
        let target = self.resolve(&asset.path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| not_found_as_typed(e, &asset.path))?;
        log::debug!("Deleted {}", asset.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upload_list_download_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path());
        let jpeg = vec![0xFF, 0xD8, 0xFF];

        store.upload("backup/images/a.jpg", &jpeg).await.unwrap();
        store.upload("backup/images/b.png", &[1, 2]).await.unwrap();
        store.upload("backup/metadata.json", b"{}").await.unwrap();

        let listed = store.list("backup/images").await.unwrap();
        let names: Vec<&str> = listed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
        assert_eq!(listed[0].path, "backup/images/a.jpg");

        assert_eq!(store.download("backup/images/a.jpg").await.unwrap(), jpeg);

        store.delete(&listed[0]).await.unwrap();
        assert!(store
            .download("backup/images/a.jpg")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn list_of_missing_prefix_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path());
        assert!(store.list("nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_skips_directories() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path());
        store.upload("backup/metadata.json", b"{}").await.unwrap();
        store.upload("backup/images/a.jpg", b"x").await.unwrap();

        let listed = store.list("backup").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "metadata.json");
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path());
        assert!(store.upload("../escape.txt", b"x").await.is_err());
    }
}
