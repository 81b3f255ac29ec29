//! Error types for card_vault

use thiserror::Error;

/// Failure reported by a remote collaborator (document store, blob store,
/// persisted overlay store).
///
/// `NotFound` is the typed "record absent" kind; callers branch on
/// [`StoreError::is_not_found`] rather than on message text.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record or object does not exist remotely
    #[error("Record not found: {0}")]
    NotFound(String),
    /// Network or listener failure
    #[error("Transient I/O failure: {0}")]
    Transient(String),
    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to (de)serialize a stored document
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Unified error type for engine operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed input, rejected before any remote call
    #[error("Validation error: {0}")]
    Validation(String),
    /// Card is unknown both locally and remotely
    #[error("Card not found: {0}")]
    NotFound(String),
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        match self {
            VaultError::NotFound(_) => true,
            VaultError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Per-item failure inside a batch operation
#[derive(Debug, Clone, PartialEq)]
pub struct ItemError {
    pub id: String,
    pub message: String,
}

impl ItemError {
    pub fn new(id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            message: err.to_string(),
        }
    }
}

/// Result alias for card_vault operations
pub type Result<T> = std::result::Result<T, VaultError>;
