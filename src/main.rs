//! Card Vault - command line front end
//!
//! Opens the local SQLite document store, brings the card cache online and
//! runs a single command against it.

use card_vault::backup::{load_local_images, save_local_images};
use card_vault::config::default_config_path;
use card_vault::overlay::{JsonFileKvStore, PersistedIds};
use card_vault::store::{FsBlobStore, SqliteDocumentStore};
use card_vault::{
    ingest, CardCache, EventBus, GhostReconciler, IncrementalSyncDiffer, LocalSnapshot,
    MutationEngine, NewCard, Result, SaleData, Scope, SoldOverlay, SubscriptionRegistry,
    VaultConfig, VaultError,
};
use card_vault::{CollectionSnapshot, DocumentStore};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Collectible card inventory with sold tracking and incremental backups
#[derive(Parser, Debug)]
#[command(name = "card_vault")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List collections with their card counts
    Collections,
    /// Create a new collection
    AddCollection {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List cards, optionally limited to one collection
    List {
        #[arg(long)]
        collection: Option<String>,
    },
    /// Add a card to a collection
    Add {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        name: String,
        /// Purchase price; `12,50` and `12.50` are both accepted
        #[arg(long)]
        investment: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value = "EUR")]
        currency: String,
        #[arg(long)]
        serial: Option<String>,
    },
    /// Mark a card as sold
    Sell {
        id: String,
        #[arg(long)]
        price: String,
        #[arg(long)]
        buyer: Option<String>,
        #[arg(long)]
        invoice: Option<String>,
    },
    /// Delete one or more cards
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Import cards from a legacy JSON export
    Import { file: PathBuf },
    /// Find and purge cards that exist locally but not in the store
    Reconcile,
    /// Incrementally back up collections and images into a directory
    Backup {
        #[arg(long)]
        dest: PathBuf,
    },
    /// Restore collections and images from a backup directory
    Restore {
        #[arg(long)]
        from: PathBuf,
    },
}

/// Wired-up services for one CLI invocation
struct Vault {
    config: VaultConfig,
    store: Arc<SqliteDocumentStore>,
    overlay: Arc<SoldOverlay>,
    registry: Arc<SubscriptionRegistry>,
    engine: MutationEngine,
}

impl Vault {
    async fn open(config: VaultConfig) -> Result<Self> {
        let store = Arc::new(SqliteDocumentStore::open(&config.database_path())?);

        let primary = Arc::new(JsonFileKvStore::new(&config.overlay_primary_path()));
        let legacy = Arc::new(JsonFileKvStore::new(&config.overlay_legacy_path()));
        let overlay = Arc::new(SoldOverlay::new(
            Some(PersistedIds::new(primary, config.overlay_primary_key.clone())),
            Some(PersistedIds::new(legacy, config.overlay_legacy_key.clone())),
        ));

        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = CardCache::new(
            store.clone(),
            overlay.clone(),
            registry.clone(),
            config.settle_delay(),
        );
        let engine = MutationEngine::new(
            store.clone(),
            cache,
            overlay.clone(),
            config.status_reset(),
        );
        engine.load().await?;

        Ok(Self {
            config,
            store,
            overlay,
            registry,
            engine,
        })
    }

    fn cache(&self) -> &CardCache {
        self.engine.cache()
    }

    /// Bring the live feed up for `scope` and wait for its first snapshot
    async fn select(&self, scope: Scope) -> Result<()> {
        self.cache().select(scope).await?;
        let state = self.cache().settled().await;
        log::debug!("Card cache state: {:?}", state);
        Ok(())
    }

    fn close(&self) {
        let released = self.registry.cleanup_all();
        log::debug!("Released {} subscription(s)", released);
    }

    async fn local_snapshot(&self) -> Result<LocalSnapshot> {
        let mut collections = Vec::new();
        for collection in self.engine.collections() {
            let cards = self
                .store
                .get_all(&Scope::Collection(collection.id.clone()))
                .await?;
            collections.push(CollectionSnapshot { collection, cards });
        }

        // Cards whose collection has no record of its own
        let known: Vec<String> = collections
            .iter()
            .map(|s| s.collection.id.clone())
            .collect();
        let mut by_name: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        for card in self.store.get_all(&Scope::All).await? {
            if known.contains(&card.collection_id) {
                continue;
            }
            let value = serde_json::to_value(&card).map_err(card_vault::StoreError::from)?;
            by_name
                .entry(card.collection_id.clone())
                .or_default()
                .push(value);
        }

        Ok(LocalSnapshot {
            collections,
            by_name,
            images: load_local_images(&self.config.image_dir()).await?,
        })
    }
}

fn load_config(args: &Args) -> Result<VaultConfig> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = VaultConfig::load(&path)?;
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    log::info!("Data directory: {}", config.data_dir.display());

    let vault = match Vault::open(config).await {
        Ok(vault) => vault,
        Err(e) => {
            log::error!("Failed to open card vault: {}", e);
            std::process::exit(1);
        }
    };

    let result = run(&vault, args.command).await;
    vault.close();

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(vault: &Vault, command: Command) -> Result<()> {
    match command {
        Command::Collections => {
            for collection in vault.engine.collections() {
                println!(
                    "{:<38} {:<30} {:>5} card(s)",
                    collection.id, collection.name, collection.card_count
                );
            }
        }

        Command::AddCollection { name, description } => {
            let collection = vault.engine.create_collection(&name, description).await?;
            println!("Created collection {} ({})", collection.name, collection.id);
        }

        Command::List { collection } => {
            let scope = collection.map_or(Scope::All, Scope::Collection);
            vault.select(scope).await?;
            let cards = vault.cache().cards();
            for card in &cards {
                println!(
                    "{:<38} {:<20} {:<30} {:>10.2} {:>10.2} {}",
                    card.id,
                    card.collection_id,
                    card.name,
                    card.investment_amount,
                    card.current_value,
                    card.currency
                );
            }
            println!("{} card(s)", cards.len());
        }

        Command::Add {
            collection,
            name,
            investment,
            value,
            currency,
            serial,
        } => {
            vault.select(Scope::Collection(collection.clone())).await?;
            let card = NewCard {
                collection_id: collection,
                name,
                investment_amount: SaleData::parse_price(&investment)?,
                current_value: SaleData::parse_price(&value)?,
                currency,
                serial,
                metadata: BTreeMap::new(),
            };
            let created = vault.engine.create_card(card).await?;
            println!("Added card {}", created.id);
        }

        Command::Sell {
            id,
            price,
            buyer,
            invoice,
        } => {
            let sale = SaleData {
                buyer,
                invoice,
                ..SaleData::new(SaleData::parse_price(&price)?)
            };
            vault.select(Scope::All).await?;
            let record = vault.engine.mark_card_as_sold(&id, sale).await?;
            println!(
                "Sold {} for {:.2} {} (profit {:.2})",
                record.card_name, record.sold_price, record.currency, record.profit
            );
        }

        Command::Delete { ids } => {
            vault.select(Scope::All).await?;
            if let [id] = ids.as_slice() {
                vault.engine.delete_card(id).await?;
                println!("Deleted {}", id);
            } else {
                let report = vault.engine.delete_cards(&ids).await?;
                println!("Deleted {} card(s)", report.deleted.len());
                for error in &report.errors {
                    println!("  {} failed: {}", error.id, error.message);
                }
            }
        }

        Command::Import { file } => {
            let json = std::fs::read_to_string(&file).map_err(card_vault::StoreError::from)?;
            let cards = ingest::cards_from_json(&json)?;
            let imported = vault.store.import_cards(&cards)?;
            println!("Imported {} card(s) from {}", imported, file.display());
        }

        Command::Reconcile => {
            vault.select(Scope::All).await?;
            let events = EventBus::new();
            let listener = vault.cache().spawn_invalidation_listener(events.subscribe());
            let reconciler = GhostReconciler::new(vault.store.clone(), events)
                .with_overlay(vault.overlay.clone());

            let report = reconciler.reconcile(&vault.cache().candidates()).await;
            drop(reconciler);
            if let Err(e) = listener.await {
                log::warn!("Invalidation listener ended abnormally: {}", e);
            }

            println!(
                "{} valid, {} ghost(s), {} purged, {} error(s)",
                report.detection.valid.len(),
                report.detection.ghosts.len(),
                report.cleanup.removed_ids.len(),
                report.detection.errors.len() + report.cleanup.errors.len()
            );
            println!("{} card(s) cached", vault.cache().len());
        }

        Command::Backup { dest } => {
            let snapshot = vault.local_snapshot().await?;
            let blobs = Arc::new(FsBlobStore::new(&dest));
            let differ = IncrementalSyncDiffer::new(blobs, vault.config.backup_prefix.clone());
            let summary = differ
                .run_with_progress(&snapshot, |progress| {
                    log::info!(
                        "Uploaded image {}/{} ({})",
                        progress.current,
                        progress.total,
                        progress.image_id
                    );
                })
                .await?;
            println!(
                "Backup {}: {} image(s) added, {} removed, {} collection(s)",
                summary.timestamp,
                summary.added_count,
                summary.removed_count,
                summary.collections_count
            );
            for error in &summary.errors {
                println!("  {} failed: {}", error.id, error.message);
            }
        }

        Command::Restore { from } => {
            if !from.is_dir() {
                return Err(VaultError::Validation(format!(
                    "Backup directory {} does not exist",
                    from.display()
                )));
            }
            let blobs = Arc::new(FsBlobStore::new(&from));
            let differ = IncrementalSyncDiffer::new(blobs, vault.config.backup_prefix.clone());
            let restored = differ.restore().await?;

            let mut card_total = 0;
            for snapshot in &restored.collections {
                vault.store.save_collection(&snapshot.collection).await?;
                card_total += vault.store.import_cards(&snapshot.cards)?;
            }
            let images = save_local_images(&vault.config.image_dir(), &restored.images).await?;
            println!(
                "Restored backup from {}: {} collection(s), {} card(s), {} image(s)",
                restored.metadata.timestamp,
                restored.collections.len(),
                card_total,
                images
            );
        }
    }
    Ok(())
}
