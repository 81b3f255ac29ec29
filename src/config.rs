//! Runtime configuration
//!
//! Read from `<config_dir>/card_vault/config.json` when present; every
//! field has a default so a partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, VaultError};
use crate::overlay::{LEGACY_KEY, PRIMARY_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding the database, overlay stores and local images
    pub data_dir: PathBuf,
    /// Pause between tearing down a feed and establishing the next one
    pub settle_delay_ms: u64,
    /// Delay after which the sync status falls back to idle
    pub status_reset_ms: u64,
    /// Blob prefix under which backups are written
    pub backup_prefix: String,
    pub overlay_primary_key: String,
    pub overlay_legacy_key: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            settle_delay_ms: 100,
            status_reset_ms: 2000,
            backup_prefix: "backup".to_string(),
            overlay_primary_key: PRIMARY_KEY.to_string(),
            overlay_legacy_key: LEGACY_KEY.to_string(),
        }
    }
}

/// Returns the default data directory: ~/.local/share/card_vault
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("card_vault")
}

/// Returns the default config file path: ~/.config/card_vault/config.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("card_vault")
        .join("config.json")
}

impl VaultConfig {
    /// Load configuration from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VaultError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn status_reset(&self) -> Duration {
        Duration::from_millis(self.status_reset_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("vault.db")
    }

    pub fn overlay_primary_path(&self) -> PathBuf {
        self.data_dir.join("overlay.json")
    }

    pub fn overlay_legacy_path(&self) -> PathBuf {
        self.data_dir.join("overlay_legacy.json")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("card_images")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_yields_defaults() {
        let config = VaultConfig::load(Path::new("/definitely/not/here.json")).unwrap();
        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"settle_delay_ms": 5, "backup_prefix": "nightly"}}"#).unwrap();

        let config = VaultConfig::load(file.path()).unwrap();
        assert_eq!(config.settle_delay_ms, 5);
        assert_eq!(config.backup_prefix, "nightly");
        assert_eq!(config.status_reset_ms, 2000);
        assert_eq!(config.overlay_primary_key, PRIMARY_KEY);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = VaultConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn paths_live_under_data_dir() {
        let config = VaultConfig {
            data_dir: PathBuf::from("/tmp/vault"),
            ..VaultConfig::default()
        };
        assert_eq!(config.database_path(), PathBuf::from("/tmp/vault/vault.db"));
        assert_eq!(config.image_dir(), PathBuf::from("/tmp/vault/card_images"));
    }
}
