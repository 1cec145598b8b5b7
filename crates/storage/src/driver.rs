//! Storage drivers: the entry point controllers use to reach ledgers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ledgerflow_core::{Ledger, Metadata};
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::ledger::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use crate::system::PostgresSystemStore;

/// Creates, finds and opens ledgers.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Store: LedgerStore + Clone;

    /// Register a new ledger, filling in its id. A taken name is a conflict.
    async fn create_ledger(&self, ledger: &mut Ledger) -> StorageResult<()>;

    /// The ledger's store together with the ledger as currently persisted.
    async fn open_ledger(&self, name: &str) -> StorageResult<(Self::Store, Ledger)>;

    async fn get_ledger(&self, name: &str) -> StorageResult<Ledger>;

    async fn update_ledger_metadata(&self, name: &str, metadata: &Metadata) -> StorageResult<()>;

    async fn delete_ledger_metadata(&self, name: &str, key: &str) -> StorageResult<()>;
}

#[derive(Debug, Clone)]
pub struct PostgresDriver {
    pool: Arc<PgPool>,
    system: PostgresSystemStore,
}

impl PostgresDriver {
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            system: PostgresSystemStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        Ok(Self::new(config.connect().await?))
    }

    pub fn system(&self) -> &PostgresSystemStore {
        &self.system
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    type Store = PostgresLedgerStore;

    async fn create_ledger(&self, ledger: &mut Ledger) -> StorageResult<()> {
        self.system.create_ledger(ledger).await
    }

    #[instrument(skip(self), err)]
    async fn open_ledger(&self, name: &str) -> StorageResult<(PostgresLedgerStore, Ledger)> {
        let ledger = self.system.get_ledger(name).await?;
        Ok((PostgresLedgerStore::new(self.pool.clone(), ledger.clone()), ledger))
    }

    async fn get_ledger(&self, name: &str) -> StorageResult<Ledger> {
        self.system.get_ledger(name).await
    }

    async fn update_ledger_metadata(&self, name: &str, metadata: &Metadata) -> StorageResult<()> {
        self.system.update_ledger_metadata(name, metadata).await
    }

    async fn delete_ledger_metadata(&self, name: &str, key: &str) -> StorageResult<()> {
        self.system.delete_ledger_metadata(name, key).await
    }
}

#[derive(Debug)]
struct RegisteredLedger {
    ledger: Ledger,
    store: InMemoryLedgerStore,
}

impl RegisteredLedger {
    /// The registered ledger with its committed lifecycle state.
    fn current(&self) -> StorageResult<Ledger> {
        let mut ledger = self.ledger.clone();
        ledger.state = self.store.state()?;
        Ok(ledger)
    }
}

/// Driver keeping every ledger in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    ledgers: RwLock<HashMap<String, RegisteredLedger>>,
    last_id: AtomicU32,
}

fn poisoned() -> StorageError {
    StorageError::Database {
        operation: "in_memory_driver".to_string(),
        message: "ledger registry lock poisoned".to_string(),
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to a ledger's store, for inspection.
    pub fn store(&self, name: &str) -> StorageResult<InMemoryLedgerStore> {
        let ledgers = self.ledgers.read().map_err(|_| poisoned())?;
        ledgers
            .get(name)
            .map(|registered| registered.store.clone())
            .ok_or(StorageError::NotFound)
    }

    fn with_ledger<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut RegisteredLedger) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut ledgers = self.ledgers.write().map_err(|_| poisoned())?;
        ledgers.get_mut(name).ok_or(StorageError::NotFound).and_then(f)
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    type Store = InMemoryLedgerStore;

    async fn create_ledger(&self, ledger: &mut Ledger) -> StorageResult<()> {
        let mut ledgers = self.ledgers.write().map_err(|_| poisoned())?;
        if ledgers.contains_key(&ledger.name) {
            return Err(StorageError::Conflict(format!(
                "ledger '{}' already exists",
                ledger.name
            )));
        }

        ledger.id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(ledger = %ledger.name, id = ledger.id, "registered in-memory ledger");
        ledgers.insert(
            ledger.name.clone(),
            RegisteredLedger {
                ledger: ledger.clone(),
                store: InMemoryLedgerStore::new(ledger.clone()),
            },
        );
        Ok(())
    }

    async fn open_ledger(&self, name: &str) -> StorageResult<(InMemoryLedgerStore, Ledger)> {
        let ledgers = self.ledgers.read().map_err(|_| poisoned())?;
        let registered = ledgers.get(name).ok_or(StorageError::NotFound)?;
        Ok((registered.store.clone(), registered.current()?))
    }

    async fn get_ledger(&self, name: &str) -> StorageResult<Ledger> {
        let ledgers = self.ledgers.read().map_err(|_| poisoned())?;
        ledgers
            .get(name)
            .ok_or(StorageError::NotFound)
            .and_then(RegisteredLedger::current)
    }

    async fn update_ledger_metadata(&self, name: &str, metadata: &Metadata) -> StorageResult<()> {
        self.with_ledger(name, |registered| {
            registered
                .ledger
                .configuration
                .metadata
                .extend(metadata.clone());
            Ok(())
        })
    }

    async fn delete_ledger_metadata(&self, name: &str, key: &str) -> StorageResult<()> {
        self.with_ledger(name, |registered| {
            registered.ledger.configuration.metadata.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ledger::LedgerTx;
    use ledgerflow_core::{Configuration, LedgerState};

    fn ledger(name: &str) -> Ledger {
        Ledger::new(name, Configuration::default()).unwrap()
    }

    #[tokio::test]
    async fn ledgers_get_increasing_ids() {
        let driver = InMemoryDriver::new();
        let mut first = ledger("a");
        let mut second = ledger("b");
        driver.create_ledger(&mut first).await.unwrap();
        driver.create_ledger(&mut second).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        let err = driver.create_ledger(&mut ledger("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn reported_state_follows_commits() {
        let driver = InMemoryDriver::new();
        driver.create_ledger(&mut ledger("main")).await.unwrap();

        let (store, opened) = driver.open_ledger("main").await.unwrap();
        assert_eq!(opened.state, LedgerState::Initializing);

        let mut tx = store.begin().await.unwrap();
        tx.update_ledger_state(LedgerState::InUse).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(driver.get_ledger("main").await.unwrap().state, LedgerState::InUse);
    }

    #[tokio::test]
    async fn ledger_metadata_round() {
        let driver = InMemoryDriver::new();
        driver.create_ledger(&mut ledger("main")).await.unwrap();
        let metadata = Metadata::from([("owner".to_string(), "ops".to_string())]);
        driver.update_ledger_metadata("main", &metadata).await.unwrap();
        assert_eq!(
            driver.get_ledger("main").await.unwrap().configuration.metadata,
            metadata
        );

        driver.delete_ledger_metadata("main", "owner").await.unwrap();
        assert!(driver.get_ledger("main").await.unwrap().configuration.metadata.is_empty());

        let err = driver.delete_ledger_metadata("nope", "owner").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
