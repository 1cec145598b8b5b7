//! In-memory ledger store.
//!
//! Mirrors the Postgres store closely enough to exercise the lifecycle:
//! - writes are buffered per transaction and applied atomically on commit;
//! - reads see committed data plus the transaction's own writes;
//! - id sequences are shared and never rolled back;
//! - the ledger lock is an async mutex whose guard lives in the transaction,
//!   so dropping the transaction releases it;
//! - logs are hash-chained under that lock when the ledger hashes logs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_core::{
    Account, AccountMetadata, Ledger, LedgerState, Log, Metadata, Transaction, Volumes,
};
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;

use super::store::{LedgerStore, LedgerTx};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Default)]
struct Data {
    state: LedgerState,
    transactions: BTreeMap<u64, Transaction>,
    logs: BTreeMap<u64, Log>,
    accounts: BTreeMap<String, Account>,
    volumes: BTreeMap<(String, String), Volumes>,
}

#[derive(Debug, Clone)]
enum Op {
    SetState(LedgerState),
    InsertLog(Log),
    InsertTransaction(Transaction),
    Revert { id: u64, at: DateTime<Utc> },
    SetTransactionMetadata { id: u64, metadata: Metadata, at: DateTime<Utc> },
    DeleteTransactionMetadata { id: u64, key: String, at: DateTime<Utc> },
    SetAccountsMetadata { metadata: AccountMetadata, at: DateTime<Utc> },
    DeleteAccountMetadata { address: String, key: String, at: DateTime<Utc> },
}

impl Data {
    fn transaction_mut(&mut self, id: u64) -> StorageResult<&mut Transaction> {
        self.transactions.get_mut(&id).ok_or(StorageError::NotFound)
    }

    fn apply(&mut self, op: &Op) -> StorageResult<()> {
        match op {
            Op::SetState(state) => self.state = *state,
            Op::InsertLog(log) => {
                let id = log
                    .id
                    .ok_or_else(|| StorageError::MalformedRow("log without id".into()))?;
                if self.logs.contains_key(&id) {
                    return Err(StorageError::Conflict(format!("log {id} already exists")));
                }
                if let Some(key) = &log.idempotency_key {
                    if self.logs.values().any(|l| l.idempotency_key.as_ref() == Some(key)) {
                        return Err(StorageError::Conflict(format!("idempotency key '{key}' already used")));
                    }
                }
                self.logs.insert(id, log.clone());
            }
            Op::InsertTransaction(tx) => {
                let id = tx
                    .id
                    .ok_or_else(|| StorageError::MalformedRow("transaction without id".into()))?;
                if self.transactions.contains_key(&id) {
                    return Err(StorageError::Conflict(format!("transaction {id} already exists")));
                }
                if let Some(reference) = &tx.reference {
                    if self.transactions.values().any(|t| t.reference.as_ref() == Some(reference)) {
                        return Err(StorageError::Conflict(format!(
                            "reference '{reference}' already used"
                        )));
                    }
                }
                for address in tx.accounts() {
                    let account = self
                        .accounts
                        .entry(address.to_string())
                        .or_insert_with(|| Account::new(address, tx.timestamp));
                    account.first_usage = account.first_usage.min(tx.timestamp);
                }
                for (key, volumes) in tx.volume_updates() {
                    self.volumes.entry(key).or_default().merge(&volumes);
                }
                self.transactions.insert(id, tx.clone());
            }
            Op::Revert { id, at } => {
                let tx = self.transaction_mut(*id)?;
                if tx.reverted_at.is_none() {
                    tx.reverted_at = Some(*at);
                    tx.updated_at = Some(*at);
                }
            }
            Op::SetTransactionMetadata { id, metadata, at } => {
                let tx = self.transaction_mut(*id)?;
                tx.metadata.extend(metadata.clone());
                tx.updated_at = Some(*at);
            }
            Op::DeleteTransactionMetadata { id, key, at } => {
                let tx = self.transaction_mut(*id)?;
                tx.metadata.remove(key);
                tx.updated_at = Some(*at);
            }
            Op::SetAccountsMetadata { metadata, at } => {
                for (address, values) in metadata {
                    let account = self
                        .accounts
                        .entry(address.clone())
                        .or_insert_with(|| Account::new(address.as_str(), *at));
                    account.metadata.extend(values.clone());
                    account.updated_at = *at;
                }
            }
            Op::DeleteAccountMetadata { address, key, at } => {
                let account = self.accounts.get_mut(address).ok_or(StorageError::NotFound)?;
                account.metadata.remove(key);
                account.updated_at = *at;
            }
        }
        Ok(())
    }

    fn next_free(ids: impl Iterator<Item = u64>) -> u64 {
        ids.max().map_or(1, |max| max + 1)
    }
}

#[derive(Debug)]
struct Shared {
    data: Mutex<Data>,
    next_transaction_id: AtomicU64,
    next_log_id: AtomicU64,
    lock: Arc<tokio::sync::Mutex<()>>,
    repairs: AtomicUsize,
}

impl Shared {
    fn data(&self) -> StorageResult<MutexGuard<'_, Data>> {
        self.data.lock().map_err(|_| StorageError::Database {
            operation: "in_memory".to_string(),
            message: "ledger data lock poisoned".to_string(),
        })
    }
}

/// Ledger store keeping everything in process memory.
///
/// Clones share the same data, sequences and lock.
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    ledger: Ledger,
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new(ledger: Ledger) -> Self {
        let data = Data {
            state: ledger.state,
            ..Data::default()
        };
        Self {
            ledger,
            shared: Arc::new(Shared {
                data: Mutex::new(data),
                next_transaction_id: AtomicU64::new(1),
                next_log_id: AtomicU64::new(1),
                lock: Arc::new(tokio::sync::Mutex::new(())),
                repairs: AtomicUsize::new(0),
            }),
        }
    }

    /// How many times the id sequences were repaired.
    pub fn repair_count(&self) -> usize {
        self.shared.repairs.load(Ordering::SeqCst)
    }

    /// Committed lifecycle state.
    pub fn state(&self) -> StorageResult<LedgerState> {
        Ok(self.shared.data()?.state)
    }

    pub fn transactions(&self) -> StorageResult<Vec<Transaction>> {
        Ok(self.shared.data()?.transactions.values().cloned().collect())
    }

    pub fn logs(&self) -> StorageResult<Vec<Log>> {
        Ok(self.shared.data()?.logs.values().cloned().collect())
    }

    pub fn account(&self, address: &str) -> StorageResult<Account> {
        self.shared
            .data()?
            .accounts
            .get(address)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    pub fn volumes(&self, address: &str, asset: &str) -> StorageResult<Volumes> {
        let data = self.shared.data()?;
        Ok(data
            .volumes
            .get(&(address.to_string(), asset.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    /// Next ids the sequences would hand out, transactions then logs.
    pub fn next_ids(&self) -> (u64, u64) {
        (
            self.shared.next_transaction_id.load(Ordering::SeqCst),
            self.shared.next_log_id.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryLedgerTx;

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    async fn begin(&self) -> StorageResult<InMemoryLedgerTx> {
        Ok(InMemoryLedgerTx {
            shared: self.shared.clone(),
            ledger: self.ledger.clone(),
            ops: Vec::new(),
            guard: None,
            floor_ids: false,
        })
    }
}

pub struct InMemoryLedgerTx {
    shared: Arc<Shared>,
    ledger: Ledger,
    ops: Vec<Op>,
    guard: Option<OwnedMutexGuard<()>>,
    floor_ids: bool,
}

impl InMemoryLedgerTx {
    /// Committed data with this transaction's writes applied.
    fn view(&self) -> StorageResult<Data> {
        let mut data = self.shared.data()?.clone();
        for op in &self.ops {
            data.apply(op)?;
        }
        Ok(data)
    }

    fn allocate(&self, sequence: &AtomicU64, stored: impl Iterator<Item = u64>) -> u64 {
        let id = sequence.fetch_add(1, Ordering::SeqCst);
        if self.floor_ids {
            id.max(Data::next_free(stored))
        } else {
            id
        }
    }

    fn write(&mut self, op: Op) -> StorageResult<Data> {
        let mut data = self.view()?;
        data.apply(&op)?;
        self.ops.push(op);
        Ok(data)
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn lock_ledger(&mut self) -> StorageResult<()> {
        if self.guard.is_none() {
            self.guard = Some(self.shared.lock.clone().lock_owned().await);
        }
        Ok(())
    }

    async fn ledger_state(&mut self) -> StorageResult<LedgerState> {
        Ok(self.view()?.state)
    }

    async fn update_ledger_state(&mut self, state: LedgerState) -> StorageResult<()> {
        self.write(Op::SetState(state)).map(|_| ())
    }

    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn repair_sequences(&mut self) -> StorageResult<()> {
        let data = self.view()?;
        self.shared.next_transaction_id.store(
            Data::next_free(data.transactions.keys().copied()),
            Ordering::SeqCst,
        );
        self.shared
            .next_log_id
            .store(Data::next_free(data.logs.keys().copied()), Ordering::SeqCst);
        self.shared.repairs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn floor_sequences(&mut self) -> StorageResult<()> {
        self.floor_ids = true;
        Ok(())
    }

    async fn commit(self) -> StorageResult<()> {
        let mut data = self.shared.data()?;
        let mut next = data.clone();
        for op in &self.ops {
            next.apply(op)?;
        }
        *data = next;
        Ok(())
    }

    async fn rollback(self) -> StorageResult<()> {
        Ok(())
    }

    async fn has_logs(&mut self) -> StorageResult<bool> {
        Ok(!self.view()?.logs.is_empty())
    }

    async fn find_log_by_idempotency_key(&mut self, key: &str) -> StorageResult<Option<Log>> {
        Ok(self
            .view()?
            .logs
            .into_values()
            .find(|log| log.idempotency_key.as_deref() == Some(key)))
    }

    async fn insert_log(&mut self, log: &mut Log) -> StorageResult<()> {
        let hashed = self.ledger.hashes_logs();
        if hashed {
            self.lock_ledger().await?;
        }
        let data = self.view()?;
        let mut stored = log.clone();
        if stored.id.is_none() {
            stored.id = Some(self.allocate(&self.shared.next_log_id, data.logs.keys().copied()));
        }
        if hashed {
            stored.chain(data.logs.values().next_back())?;
        }
        self.write(Op::InsertLog(stored.clone()))?;
        log.id = stored.id;
        log.hash = stored.hash;
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &mut Transaction) -> StorageResult<()> {
        let now = Utc::now();
        let mut stored = transaction.clone();
        if stored.id.is_none() {
            let data = self.view()?;
            stored.id = Some(self.allocate(
                &self.shared.next_transaction_id,
                data.transactions.keys().copied(),
            ));
        }
        stored.inserted_at = Some(now);
        stored.updated_at = Some(now);

        self.write(Op::InsertTransaction(stored.clone()))?;
        *transaction = stored;
        Ok(())
    }

    async fn get_transaction(&mut self, id: u64) -> StorageResult<Transaction> {
        self.view()?
            .transactions
            .remove(&id)
            .ok_or(StorageError::NotFound)
    }

    async fn revert_transaction(
        &mut self,
        id: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<(Transaction, bool)> {
        let current = self.get_transaction(id).await?;
        if current.is_reverted() {
            return Ok((current, false));
        }
        let mut data = self.write(Op::Revert { id, at })?;
        Ok((data.transactions.remove(&id).ok_or(StorageError::NotFound)?, true))
    }

    async fn update_transaction_metadata(
        &mut self,
        id: u64,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> StorageResult<Transaction> {
        let mut data = self.write(Op::SetTransactionMetadata {
            id,
            metadata: metadata.clone(),
            at,
        })?;
        data.transactions.remove(&id).ok_or(StorageError::NotFound)
    }

    async fn delete_transaction_metadata(
        &mut self,
        id: u64,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Transaction> {
        let mut data = self.write(Op::DeleteTransactionMetadata {
            id,
            key: key.to_string(),
            at,
        })?;
        data.transactions.remove(&id).ok_or(StorageError::NotFound)
    }

    async fn update_accounts_metadata(
        &mut self,
        metadata: &AccountMetadata,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.write(Op::SetAccountsMetadata {
            metadata: metadata.clone(),
            at,
        })
        .map(|_| ())
    }

    async fn delete_account_metadata(
        &mut self,
        address: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.write(Op::DeleteAccountMetadata {
            address: address.to_string(),
            key: key.to_string(),
            at,
        })
        .map(|_| ())
    }
}
