//! Tests for the sold overlay and its persisted stores

use super::*;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn card(id: &str) -> Card {
    Card {
        id: id.to_string(),
        collection_id: "binder".to_string(),
        name: format!("Card {}", id),
        investment_amount: 10.0,
        current_value: 12.0,
        currency: "EUR".to_string(),
        serial: None,
        metadata: BTreeMap::new(),
    }
}

fn ids(cards: &[Card]) -> Vec<&str> {
    cards.iter().map(|c| c.id.as_str()).collect()
}

fn persisted_overlay() -> (SoldOverlay, Arc<MemoryKvStore>, Arc<MemoryKvStore>) {
    let primary = Arc::new(MemoryKvStore::new());
    let legacy = Arc::new(MemoryKvStore::new());
    let overlay = SoldOverlay::new(
        Some(PersistedIds::new(primary.clone(), PRIMARY_KEY)),
        Some(PersistedIds::new(legacy.clone(), LEGACY_KEY)),
    );
    (overlay, primary, legacy)
}

#[test]
fn apply_hides_in_memory_ids() {
    let overlay = SoldOverlay::in_memory();
    overlay.add("b");

    let result = overlay.apply(vec![card("a"), card("b"), card("c")]);
    assert_eq!(ids(&result), vec!["a", "c"]);
}

#[test]
fn remove_makes_card_visible_again() {
    let overlay = SoldOverlay::in_memory();
    overlay.add("b");
    overlay.remove("b");

    let result = overlay.apply(vec![card("a"), card("b")]);
    assert_eq!(ids(&result), vec!["a", "b"]);
    assert!(!overlay.contains("b"));
}

#[test]
fn add_persists_to_primary_store() {
    let (overlay, primary, legacy) = persisted_overlay();
    overlay.add("x");

    let stored = primary.get(PRIMARY_KEY).unwrap().unwrap();
    assert_eq!(stored, r#"["x"]"#);
    assert!(legacy.get(LEGACY_KEY).unwrap().is_none());
}

#[test]
fn persisted_ids_are_read_fresh_on_each_apply() {
    let (overlay, primary, legacy) = persisted_overlay();
    let result = overlay.apply(vec![card("a"), card("b"), card("c")]);
    assert_eq!(result.len(), 3);

    // Written by another process / an earlier session
    primary.set(PRIMARY_KEY, r#"["a"]"#).unwrap();
    legacy.set(LEGACY_KEY, r#"["c", "a"]"#).unwrap();

    let result = overlay.apply(vec![card("a"), card("b"), card("c")]);
    assert_eq!(ids(&result), vec!["b"]);
    assert_eq!(overlay.excluded().len(), 2);
}

#[test]
fn remove_clears_id_from_every_source() {
    let (overlay, primary, legacy) = persisted_overlay();
    legacy.set(LEGACY_KEY, r#"["a", "b"]"#).unwrap();
    overlay.add("a");

    overlay.remove("a");

    assert!(!overlay.contains("a"));
    assert_eq!(primary.get(PRIMARY_KEY).unwrap().unwrap(), "[]");
    assert_eq!(legacy.get(LEGACY_KEY).unwrap().unwrap(), r#"["b"]"#);
}

#[test]
fn malformed_persisted_value_counts_as_empty() {
    let (overlay, primary, _legacy) = persisted_overlay();
    primary.set(PRIMARY_KEY, "not json").unwrap();

    let result = overlay.apply(vec![card("a")]);
    assert_eq!(ids(&result), vec!["a"]);
}

#[test]
fn add_is_idempotent_in_persisted_store() {
    let (overlay, primary, _legacy) = persisted_overlay();
    overlay.add("a");
    overlay.add("a");
    assert_eq!(primary.get(PRIMARY_KEY).unwrap().unwrap(), r#"["a"]"#);
}

#[test]
fn json_file_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("overlay.json");

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileKvStore::new(&path));
        let overlay = SoldOverlay::new(Some(PersistedIds::new(store, PRIMARY_KEY)), None);
        overlay.add("slab-7");
    }

    // Fresh overlay, as after an app restart
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileKvStore::new(&path));
    let overlay = SoldOverlay::new(Some(PersistedIds::new(store, PRIMARY_KEY)), None);
    assert!(overlay.contains("slab-7"));
    assert!(overlay.apply(vec![card("slab-7")]).is_empty());
}

#[test]
fn json_file_store_keeps_other_keys() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonFileKvStore::new(&temp_dir.path().join("kv.json"));
    store.set("theme", "dark").unwrap();
    store.set(PRIMARY_KEY, "[]").unwrap();

    assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));
    assert_eq!(store.get(PRIMARY_KEY).unwrap().as_deref(), Some("[]"));
    assert!(store.get("missing").unwrap().is_none());
}
