//! SQLite-backed document store
//!
//! Uses parameterized queries exclusively (no SQL string concatenation).
//! All multi-row writes are transactional. Listeners are notified after a
//! write has been committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::feed::{FeedCallback, FeedHub, Unsubscribe};
use super::{DeleteOutcome, DocumentStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{Card, Collection, NewCard, SaleData, Scope, SoldRecord};

const CARD_COLUMNS: &str =
    "id, collection_id, name, investment_amount, current_value, currency, serial, metadata";

/// Initialize the database schema
///
/// Creates tables if they don't exist:
/// - `collections`: named card groups with their derived card count
/// - `cards`: active cards
/// - `sold_cards`: append-only sold records, keyed by the original card id
pub fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            card_count INTEGER NOT NULL DEFAULT 0,
            description TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS cards (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            name TEXT NOT NULL,
            investment_amount REAL NOT NULL,
            current_value REAL NOT NULL,
            currency TEXT NOT NULL,
            serial TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_cards_collection ON cards(collection_id);

        CREATE TABLE IF NOT EXISTS sold_cards (
            original_card_id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            card_name TEXT NOT NULL,
            investment_amount REAL NOT NULL,
            sold_price REAL NOT NULL,
            sold_date TEXT NOT NULL,
            profit REAL NOT NULL,
            currency TEXT NOT NULL,
            buyer TEXT,
            invoice TEXT,
            inserted_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    log::info!("Database schema initialized");
    Ok(())
}

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<(Card, String)> {
    Ok((
        Card {
            id: row.get(0)?,
            collection_id: row.get(1)?,
            name: row.get(2)?,
            investment_amount: row.get(3)?,
            current_value: row.get(4)?,
            currency: row.get(5)?,
            serial: row.get(6)?,
            metadata: Default::default(),
        },
        row.get(7)?,
    ))
}

fn with_metadata((mut card, metadata): (Card, String)) -> StoreResult<Card> {
    card.metadata = serde_json::from_str(&metadata)?;
    Ok(card)
}

fn sold_from_row(row: &Row<'_>) -> rusqlite::Result<(SoldRecord, String)> {
    let sold_date: String = row.get(5)?;
    Ok((
        SoldRecord {
            original_card_id: row.get(0)?,
            collection_id: row.get(1)?,
            card_name: row.get(2)?,
            investment_amount: row.get(3)?,
            sold_price: row.get(4)?,
            sold_date: DateTime::<Utc>::MIN_UTC,
            profit: row.get(6)?,
            currency: row.get(7)?,
            buyer: row.get(8)?,
            invoice: row.get(9)?,
        },
        sold_date,
    ))
}

fn with_sold_date((mut record, sold_date): (SoldRecord, String)) -> StoreResult<SoldRecord> {
    record.sold_date = DateTime::parse_from_rfc3339(&sold_date)
        .map_err(|e| StoreError::Transient(format!("Invalid sold date {}: {}", sold_date, e)))?
        .with_timezone(&Utc);
    Ok(record)
}

fn query_cards(conn: &Connection, scope: &Scope) -> StoreResult<Vec<Card>> {
    let rows = match scope {
        Scope::All => {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {} FROM cards ORDER BY id", CARD_COLUMNS))?;
            let rows = stmt
                .query_map([], card_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        Scope::Collection(collection_id) => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM cards WHERE collection_id = ?1 ORDER BY id",
                CARD_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![collection_id], card_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    rows.into_iter().map(with_metadata).collect()
}

fn query_card(conn: &Connection, id: &str) -> StoreResult<Option<Card>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM cards WHERE id = ?1", CARD_COLUMNS),
            params![id],
            card_from_row,
        )
        .optional()?;
    row.map(with_metadata).transpose()
}

fn upsert_card_tx(tx: &Transaction<'_>, card: &Card) -> StoreResult<()> {
    let metadata = serde_json::to_string(&card.metadata)?;
    tx.execute(
        "INSERT OR REPLACE INTO cards
         (id, collection_id, name, investment_amount, current_value, currency, serial, metadata, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))",
        params![
            &card.id,
            &card.collection_id,
            &card.name,
            card.investment_amount,
            card.current_value,
            &card.currency,
            &card.serial,
            metadata,
        ],
    )?;
    Ok(())
}

/// Insert a sold record unless one already exists for the card.
/// Returns the stored record.
fn insert_sold_tx(tx: &Transaction<'_>, record: &SoldRecord) -> StoreResult<SoldRecord> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO sold_cards
         (original_card_id, collection_id, card_name, investment_amount, sold_price, sold_date,
          profit, currency, buyer, invoice)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            &record.original_card_id,
            &record.collection_id,
            &record.card_name,
            record.investment_amount,
            record.sold_price,
            record.sold_date.to_rfc3339(),
            record.profit,
            &record.currency,
            &record.buyer,
            &record.invoice,
        ],
    )?;

    if inserted == 0 {
        log::info!(
            "Sold record for {} already exists, keeping the original",
            record.original_card_id
        );
        let existing = tx.query_row(
            "SELECT original_card_id, collection_id, card_name, investment_amount, sold_price,
                    sold_date, profit, currency, buyer, invoice
             FROM sold_cards WHERE original_card_id = ?1",
            params![&record.original_card_id],
            sold_from_row,
        )?;
        return with_sold_date(existing);
    }
    Ok(record.clone())
}

/// Document store persisted in a local SQLite database
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
    hub: Arc<FeedHub>,
}

impl SqliteDocumentStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                log::info!("Created directory: {}", parent.display());
            }
        }
        let conn = Connection::open(path)?;
        log::info!("Opened database: {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hub: FeedHub::new(),
        })
    }

    pub fn card_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Upsert cards keeping their ids, creating any missing collection
    /// and recounting the touched ones. Returns the number of cards written.
    pub fn import_cards(&self, cards: &[Card]) -> StoreResult<usize> {
        let mut touched: Vec<String> = Vec::new();
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            for card in cards {
                upsert_card_tx(&tx, card)?;
                if !touched.contains(&card.collection_id) {
                    touched.push(card.collection_id.clone());
                }
            }
            {
                let mut ensure = tx.prepare_cached(
                    "INSERT OR IGNORE INTO collections (id, name) VALUES (?1, ?1)",
                )?;
                let mut recount = tx.prepare_cached(
                    "UPDATE collections
                     SET card_count = (SELECT COUNT(*) FROM cards WHERE collection_id = ?1),
                         updated_at = datetime('now')
                     WHERE id = ?1",
                )?;
                for collection_id in &touched {
                    ensure.execute(params![collection_id])?;
                    recount.execute(params![collection_id])?;
                }
            }
            tx.commit()?;
        }
        log::info!(
            "Imported {} card(s) into {} collection(s)",
            cards.len(),
            touched.len()
        );
        if !cards.is_empty() {
            self.notify(&touched);
        }
        Ok(cards.len())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, touched: &[String]) {
        self.hub
            .notify(touched, |scope| query_cards(&self.lock(), scope));
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_all(&self, scope: &Scope) -> StoreResult<Vec<Card>> {
        query_cards(&self.lock(), scope)
    }

    async fn subscribe(&self, scope: &Scope, callback: FeedCallback) -> StoreResult<Unsubscribe> {
        let initial = query_cards(&self.lock(), scope)?;
        let unsubscribe = self.hub.add(scope.clone(), Arc::clone(&callback));
        callback(Ok(initial));
        Ok(unsubscribe)
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Card> {
        query_card(&self.lock(), id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create(&self, card: NewCard) -> StoreResult<Card> {
        let card = card.with_id(uuid::Uuid::new_v4().to_string());
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            upsert_card_tx(&tx, &card)?;
            tx.commit()?;
        }
        log::debug!("Created card {} in {}", card.id, card.collection_id);
        self.notify(&[card.collection_id.clone()]);
        Ok(card)
    }

    async fn update(&self, card: &Card) -> StoreResult<Card> {
        let previous = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT collection_id FROM cards WHERE id = ?1",
                    params![&card.id],
                    |row| row.get(0),
                )
                .optional()?;
            let previous = previous.ok_or_else(|| StoreError::NotFound(card.id.clone()))?;
            upsert_card_tx(&tx, card)?;
            tx.commit()?;
            previous
        };
        self.notify(&[previous, card.collection_id.clone()]);
        Ok(card.clone())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let collection_id = {
            let conn = self.lock();
            let collection_id: Option<String> = conn
                .query_row(
                    "SELECT collection_id FROM cards WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let collection_id = collection_id.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            conn.execute("DELETE FROM cards WHERE id = ?1", params![id])?;
            collection_id
        };
        self.notify(&[collection_id]);
        Ok(())
    }

    async fn batch_delete(&self, ids: &[String]) -> StoreResult<Vec<DeleteOutcome>> {
        let mut touched = Vec::new();
        let outcomes = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let mut outcomes = Vec::with_capacity(ids.len());
            {
                let mut lookup =
                    tx.prepare_cached("SELECT collection_id FROM cards WHERE id = ?1")?;
                let mut remove = tx.prepare_cached("DELETE FROM cards WHERE id = ?1")?;
                for id in ids {
                    let result = match lookup
                        .query_row(params![id], |row| row.get::<_, String>(0))
                        .optional()
                    {
                        Ok(Some(collection_id)) => match remove.execute(params![id]) {
                            Ok(_) => {
                                touched.push(collection_id);
                                Ok(())
                            }
                            Err(e) => Err(StoreError::from(e)),
                        },
                        Ok(None) => Err(StoreError::NotFound(id.clone())),
                        Err(e) => Err(StoreError::from(e)),
                    };
                    outcomes.push(DeleteOutcome {
                        id: id.clone(),
                        result,
                    });
                }
            }
            tx.commit()?;
            outcomes
        };
        if !touched.is_empty() {
            self.notify(&touched);
        }
        Ok(outcomes)
    }

    async fn mark_sold(&self, id: &str, sale: &SaleData) -> StoreResult<SoldRecord> {
        let record = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let card = tx
                .query_row(
                    &format!("SELECT {} FROM cards WHERE id = ?1", CARD_COLUMNS),
                    params![id],
                    card_from_row,
                )
                .optional()?
                .map(with_metadata)
                .transpose()?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let record = insert_sold_tx(&tx, &SoldRecord::from_card(&card, sale))?;
            tx.execute("DELETE FROM cards WHERE id = ?1", params![id])?;
            tx.commit()?;
            record
        };
        self.notify(&[record.collection_id.clone()]);
        Ok(record)
    }

    async fn record_sale(&self, record: &SoldRecord) -> StoreResult<SoldRecord> {
        let (stored, removed) = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let stored = insert_sold_tx(&tx, record)?;
            let removed = tx.execute(
                "DELETE FROM cards WHERE id = ?1",
                params![&record.original_card_id],
            )?;
            tx.commit()?;
            (stored, removed)
        };
        if removed > 0 {
            self.notify(&[record.collection_id.clone()]);
        }
        Ok(stored)
    }

    async fn purge(&self, id: &str) -> StoreResult<()> {
        let removed = self
            .lock()
            .execute("DELETE FROM cards WHERE id = ?1", params![id])?;
        if removed > 0 {
            log::info!("Purged residual card row {}", id);
            self.notify(&[]);
        }
        Ok(())
    }

    async fn collections(&self) -> StoreResult<Vec<Collection>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, card_count, description FROM collections ORDER BY name",
        )?;
        let collections = stmt
            .query_map([], |row| {
                Ok(Collection {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    card_count: row.get(2)?,
                    description: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(collections)
    }

    async fn save_collection(&self, collection: &Collection) -> StoreResult<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO collections (id, name, card_count, description, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            params![
                &collection.id,
                &collection.name,
                collection.card_count,
                &collection.description,
            ],
        )?;
        Ok(())
    }

    async fn sold_records(&self) -> StoreResult<Vec<SoldRecord>> {
        let rows = {
            let conn = self.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT original_card_id, collection_id, card_name, investment_amount, sold_price,
                        sold_date, profit, currency, buyer, invoice
                 FROM sold_cards ORDER BY sold_date",
            )?;
            let rows = stmt
                .query_map([], sold_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(with_sold_date).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn new_card(collection: &str, name: &str) -> NewCard {
        NewCard {
            collection_id: collection.to_string(),
            name: name.to_string(),
            investment_amount: 100.0,
            current_value: 150.0,
            currency: "EUR".to_string(),
            serial: Some("PSA-1".to_string()),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_round_trips_metadata() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let mut card = new_card("vintage", "Mewtwo");
        card.metadata
            .insert("grade".to_string(), serde_json::json!(9.5));

        let created = store.create(card).await.unwrap();
        assert!(!created.id.is_empty());

        let fetched = store.get_by_id(&created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.metadata.get("grade"), Some(&serde_json::json!(9.5)));
    }

    #[tokio::test]
    async fn get_by_id_reports_not_found() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let err = store.get_by_id("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn scope_filters_by_collection() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        store.create(new_card("x", "A")).await.unwrap();
        store.create(new_card("x", "B")).await.unwrap();
        store.create(new_card("y", "C")).await.unwrap();

        assert_eq!(store.get_all(&Scope::All).await.unwrap().len(), 3);
        assert_eq!(
            store
                .get_all(&Scope::Collection("x".to_string()))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn mark_sold_moves_card_to_sold_list() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let card = store.create(new_card("x", "Lugia")).await.unwrap();

        let record = store
            .mark_sold(&card.id, &SaleData::new(180.0))
            .await
            .unwrap();

        assert!((record.profit - 80.0).abs() < 0.001);
        assert!(store.get_by_id(&card.id).await.unwrap_err().is_not_found());
        let sold = store.sold_records().await.unwrap();
        assert_eq!(sold.len(), 1);
        assert_eq!(sold[0].original_card_id, card.id);
        assert_eq!(sold[0].sold_date, record.sold_date);
    }

    #[tokio::test]
    async fn mark_sold_of_missing_card_is_not_found() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let err = store
            .mark_sold("gone", &SaleData::new(1.0))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn record_sale_is_append_only() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let card = new_card("x", "Ho-Oh").with_id("c1");
        let first = SoldRecord::from_card(&card, &SaleData::new(120.0));
        let second = SoldRecord::from_card(&card, &SaleData::new(999.0));

        store.record_sale(&first).await.unwrap();
        let stored = store.record_sale(&second).await.unwrap();

        assert!((stored.sold_price - 120.0).abs() < 0.001);
        assert_eq!(store.sold_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_delete_reports_per_id_outcomes() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let a = store.create(new_card("x", "A")).await.unwrap();
        let b = store.create(new_card("x", "B")).await.unwrap();

        let outcomes = store
            .batch_delete(&[a.id.clone(), "nope".to_string(), b.id.clone()])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.as_ref().unwrap_err().is_not_found());
        assert!(outcomes[2].result.is_ok());
        assert_eq!(store.card_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_snapshot_after_write() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: FeedCallback = Arc::new(move |delivery| {
            if let Ok(cards) = delivery {
                sink.lock().unwrap().push(cards.len());
            }
        });

        let unsubscribe = store
            .subscribe(&Scope::Collection("x".to_string()), callback)
            .await
            .unwrap();
        store.create(new_card("x", "A")).await.unwrap();
        store.create(new_card("y", "B")).await.unwrap();
        unsubscribe().unwrap();
        store.create(new_card("x", "C")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn collections_round_trip() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let collection = Collection {
            id: "vintage".to_string(),
            name: "Vintage".to_string(),
            card_count: 3,
            description: Some("WOTC era".to_string()),
        };
        store.save_collection(&collection).await.unwrap();
        assert_eq!(store.collections().await.unwrap(), vec![collection]);
    }

    #[tokio::test]
    async fn import_keeps_ids_and_recounts_collections() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let cards: Vec<Card> = ["slab-1", "slab-2"]
            .iter()
            .map(|id| new_card("binder", "Lugia").with_id(*id))
            .collect();

        assert_eq!(store.import_cards(&cards).unwrap(), 2);
        assert_eq!(store.import_cards(&cards).unwrap(), 2);

        assert_eq!(store.card_count().unwrap(), 2);
        assert_eq!(store.get_by_id("slab-2").await.unwrap(), cards[1]);
        let collections = store.collections().await.unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].id, "binder");
        assert_eq!(collections[0].card_count, 2);
    }
}
