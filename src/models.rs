//! Data model shared by the cache, the mutation engine and the stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, VaultError};

/// Which records a live feed covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Every card in the user's record space
    All,
    /// Cards of a single collection
    Collection(String),
}

impl Scope {
    pub fn matches(&self, card: &Card) -> bool {
        match self {
            Scope::All => true,
            Scope::Collection(id) => card.collection_id == *id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Collection(id) => write!(f, "collection:{}", id),
        }
    }
}

/// A single graded card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub collection_id: String,
    pub name: String,
    pub investment_amount: f64,
    pub current_value: f64,
    pub currency: String,
    /// Slab serial / certification number
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Card data before the store has assigned an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCard {
    pub collection_id: String,
    pub name: String,
    pub investment_amount: f64,
    pub current_value: f64,
    pub currency: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewCard {
    /// Attach an id, producing a full card
    pub fn with_id(self, id: impl Into<String>) -> Card {
        Card {
            id: id.into(),
            collection_id: self.collection_id,
            name: self.name,
            investment_amount: self.investment_amount,
            current_value: self.current_value,
            currency: self.currency,
            serial: self.serial,
            metadata: self.metadata,
        }
    }
}

/// A named group of cards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub card_count: u32,
    #[serde(default)]
    pub description: Option<String>,
}

/// Sale details supplied by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleData {
    pub sold_price: f64,
    #[serde(default)]
    pub sold_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub buyer: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
}

impl SaleData {
    pub fn new(sold_price: f64) -> Self {
        Self {
            sold_price,
            sold_date: None,
            buyer: None,
            invoice: None,
        }
    }

    /// Parse a user-entered price ("12.50", "12,50")
    pub fn parse_price(raw: &str) -> Result<f64> {
        let normalized = raw.trim().replace(',', ".");
        let price: f64 = normalized
            .parse()
            .map_err(|_| VaultError::Validation(format!("Sale price is not a number: {:?}", raw)))?;
        Ok(price)
    }

    /// Reject non-numeric prices before anything touches the store
    pub fn validate(&self) -> Result<()> {
        if !self.sold_price.is_finite() {
            return Err(VaultError::Validation(format!(
                "Sale price must be a finite number, got {}",
                self.sold_price
            )));
        }
        Ok(())
    }
}

/// Append-only record of a sold card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoldRecord {
    pub original_card_id: String,
    pub collection_id: String,
    pub card_name: String,
    pub investment_amount: f64,
    pub sold_price: f64,
    pub sold_date: DateTime<Utc>,
    pub profit: f64,
    pub currency: String,
    #[serde(default)]
    pub buyer: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
}

impl SoldRecord {
    /// Build a sold record from the last known card snapshot
    pub fn from_card(card: &Card, sale: &SaleData) -> Self {
        Self {
            original_card_id: card.id.clone(),
            collection_id: card.collection_id.clone(),
            card_name: card.name.clone(),
            investment_amount: card.investment_amount,
            sold_price: sale.sold_price,
            sold_date: sale.sold_date.unwrap_or_else(Utc::now),
            profit: sale.sold_price - card.investment_amount,
            currency: card.currency.clone(),
            buyer: sale.buyer.clone(),
            invoice: sale.invoice.clone(),
        }
    }
}

/// Metadata document written at the root of every backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub collection_count: usize,
    pub image_count: usize,
    pub incremental_update: bool,
    /// Timestamp of the backup this one was diffed against
    #[serde(default)]
    pub last_full_backup: Option<DateTime<Utc>>,
}

/// A collection together with its full card contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub collection: Collection,
    pub cards: Vec<Card>,
}

/// Supported image encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }
}

/// Binary card image; the id must equal a card id to be kept in backups
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAsset {
    pub id: String,
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl ImageAsset {
    /// Object name used in the blob store: `<id>.<extension>`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, self.format.extension())
    }
}
