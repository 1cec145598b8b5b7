use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_core::{AccountMetadata, Ledger, LedgerState, Log, Metadata, Transaction};

use crate::error::StorageResult;

/// Write-side storage of one ledger.
///
/// Every write goes through a [`LedgerTx`]: nothing it does is visible to
/// other transactions until [`LedgerTx::commit`], and [`LedgerTx::rollback`]
/// (or dropping it) discards everything except sequence allocations.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx;

    fn ledger(&self) -> &Ledger;

    async fn begin(&self) -> StorageResult<Self::Tx>;
}

#[async_trait]
pub trait LedgerTx: Send + Sized {
    /// Take the ledger's exclusive lock. Held until commit or rollback;
    /// a second caller waits.
    async fn lock_ledger(&mut self) -> StorageResult<()>;

    /// Persisted lifecycle state, as seen by this transaction.
    async fn ledger_state(&mut self) -> StorageResult<LedgerState>;

    async fn update_ledger_state(&mut self, state: LedgerState) -> StorageResult<()>;

    /// Move the transaction and log id sequences past the highest stored id.
    ///
    /// Imported records carry their own ids, so the sequences may lag
    /// behind them. Sequence updates are not undone by a rollback.
    async fn repair_sequences(&mut self) -> StorageResult<()>;

    /// For the rest of this transaction, allocate ids past the highest
    /// stored ones without moving the sequences.
    ///
    /// Lets a dry run see the ids a repaired ledger would hand out while
    /// leaving nothing behind once it rolls back.
    async fn floor_sequences(&mut self) -> StorageResult<()>;

    async fn commit(self) -> StorageResult<()>;

    async fn rollback(self) -> StorageResult<()>;

    async fn has_logs(&mut self) -> StorageResult<bool>;

    async fn find_log_by_idempotency_key(&mut self, key: &str) -> StorageResult<Option<Log>>;

    /// Append a log, allocating its id when it has none.
    ///
    /// On ledgers that hash their logs this takes the ledger lock and sets
    /// [`Log::hash`] chained after the last stored log, replacing any hash
    /// the caller put there.
    async fn insert_log(&mut self, log: &mut Log) -> StorageResult<()>;

    /// Store a transaction and apply its postings to account volumes.
    ///
    /// Allocates the id when it has none and fills `inserted_at` and
    /// `updated_at`. A reference already used in the ledger is a conflict.
    async fn insert_transaction(&mut self, transaction: &mut Transaction) -> StorageResult<()>;

    async fn get_transaction(&mut self, id: u64) -> StorageResult<Transaction>;

    /// Mark a transaction reverted at `at`. Returns the transaction and
    /// whether this call did the marking (`false`: it was already reverted).
    async fn revert_transaction(
        &mut self,
        id: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<(Transaction, bool)>;

    async fn update_transaction_metadata(
        &mut self,
        id: u64,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> StorageResult<Transaction>;

    async fn delete_transaction_metadata(
        &mut self,
        id: u64,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Transaction>;

    /// Merge metadata into accounts, creating the missing ones.
    async fn update_accounts_metadata(
        &mut self,
        metadata: &AccountMetadata,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn delete_account_metadata(
        &mut self,
        address: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;
}
