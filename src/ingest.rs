//! Adaptation of legacy record shapes into the canonical [`Card`]
//!
//! Older exports store the card id under `id` or `slabSerial` and the
//! owning collection under `collectionId`, `collection` or
//! `collectionName`. Only this module knows about those spellings.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Result, VaultError};
use crate::models::Card;

const ID_FIELDS: [&str; 2] = ["id", "slabSerial"];
const COLLECTION_FIELDS: [&str; 3] = ["collectionId", "collection", "collectionName"];
const KNOWN_FIELDS: [&str; 11] = [
    "id",
    "slabSerial",
    "collectionId",
    "collection",
    "collectionName",
    "name",
    "cardName",
    "investmentAmount",
    "currentValue",
    "currency",
    "serial",
];

fn first_string(obj: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match obj.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Monetary field of card `id`; absent or blank counts as zero, anything
/// else must be a finite number (`"12,50"` is read as `12.50`)
fn amount(obj: &Map<String, Value>, field: &str, id: &str) -> Result<f64> {
    let parsed = match obj.get(field) {
        None | Some(Value::Null) => return Ok(0.0),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(0.0),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(value) if value.is_finite() => Ok(value),
        _ => Err(VaultError::Validation(format!(
            "Card {} has a non-numeric {}: {}",
            id,
            field,
            obj.get(field).map_or_else(String::new, Value::to_string)
        ))),
    }
}

/// Convert one legacy record, falling back to `default_collection` when the
/// record carries no collection field of its own.
pub fn card_from_legacy(value: &Value, default_collection: Option<&str>) -> Result<Card> {
    let obj = value
        .as_object()
        .ok_or_else(|| VaultError::Validation("Card record is not a JSON object".to_string()))?;

    let id = first_string(obj, &ID_FIELDS)
        .ok_or_else(|| VaultError::Validation("Card record has no id or slabSerial".to_string()))?;

    let collection_id = first_string(obj, &COLLECTION_FIELDS)
        .or_else(|| default_collection.map(str::to_string))
        .ok_or_else(|| VaultError::Validation(format!("Card {} has no collection", id)))?;

    let metadata: BTreeMap<String, Value> = obj
        .iter()
        .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let investment_amount = amount(obj, "investmentAmount", &id)?;
    let current_value = amount(obj, "currentValue", &id)?;

    Ok(Card {
        name: first_string(obj, &["name", "cardName"]).unwrap_or_default(),
        investment_amount,
        current_value,
        currency: first_string(obj, &["currency"]).unwrap_or_else(|| "USD".to_string()),
        serial: first_string(obj, &["serial", "slabSerial"]),
        id,
        collection_id,
        metadata,
    })
}

/// Parse a JSON array of legacy card records
///
/// Records that cannot be adapted are skipped with a warning.
pub fn cards_from_json(json: &str) -> Result<Vec<Card>> {
    let values: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| VaultError::Validation(format!("Import file is not a JSON array: {}", e)))?;

    let mut cards = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        match card_from_legacy(value, None) {
            Ok(card) => cards.push(card),
            Err(e) => log::warn!("Skipping record {} during import: {}", index, e),
        }
    }
    Ok(cards)
}

/// Flatten a `{ collectionName: [records] }` map into canonical cards
pub fn cards_from_collections_by_name(by_name: &BTreeMap<String, Vec<Value>>) -> Vec<Card> {
    let mut cards = Vec::new();
    for (collection_name, records) in by_name {
        for record in records {
            match card_from_legacy(record, Some(collection_name)) {
                Ok(card) => cards.push(card),
                Err(e) => log::warn!(
                    "Skipping record in collection {}: {}",
                    collection_name,
                    e
                ),
            }
        }
    }
    cards
}
