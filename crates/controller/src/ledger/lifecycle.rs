//! Ledger lifecycle: `Initializing` until the first committed write, `InUse`
//! afterwards.
//!
//! The first write must repair the id sequences (logs may have been imported
//! with explicit ids) and flip the persisted state, exactly once across every
//! process sharing the database. [`LedgerStateTracker`] does this with a
//! double-checked lock: a cheap in-process check of the known state, then the
//! ledger advisory lock and a re-read of the persisted state inside the same
//! transaction as the write.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ledgerflow_core::{Ledger, LedgerState, Log};
use ledgerflow_storage::{LedgerStore, LedgerTx};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::controller::{Controller, DefaultController, ImportLogs, LedgerOperation, release};
use super::params::{
    CreateTransaction, CreatedTransaction, DeleteAccountMetadata, DeleteMetadataLog,
    DeleteTransactionMetadata, Parameters, RevertTransaction, RevertedTransaction,
    SaveAccountMetadata, SaveTransactionMetadata, SetMetadataLog,
};
use crate::error::{ControllerError, ControllerResult};

/// Process-wide view of one ledger's state, shared by every controller of
/// that ledger.
#[derive(Debug, Default)]
pub struct LedgerStateCell {
    state: RwLock<LedgerState>,
}

impl LedgerStateCell {
    pub fn new(state: LedgerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn get(&self) -> LedgerState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, state: LedgerState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// Controller wrapper enforcing the ledger lifecycle.
#[derive(Debug, Clone)]
pub struct LedgerStateTracker<S> {
    inner: DefaultController<S>,
    cell: Arc<LedgerStateCell>,
}

impl<S: LedgerStore> LedgerStateTracker<S> {
    pub fn new(inner: DefaultController<S>, cell: Arc<LedgerStateCell>) -> Self {
        Self { inner, cell }
    }

    /// Tracker with its own cell seeded from the store's ledger.
    pub fn standalone(store: S) -> Self {
        let cell = Arc::new(LedgerStateCell::new(store.ledger().state));
        Self::new(DefaultController::new(store), cell)
    }

    pub fn state(&self) -> LedgerState {
        self.cell.get()
    }

    pub fn inner(&self) -> &DefaultController<S> {
        &self.inner
    }

    #[instrument(skip_all, fields(ledger = %self.inner.store().ledger().name, dry_run = dry_run), err)]
    async fn handle_state<Op: LedgerOperation<S>>(
        &self,
        dry_run: bool,
        op: Op,
    ) -> ControllerResult<Op::Output> {
        if self.cell.get() == LedgerState::InUse {
            return self.inner.run(dry_run, op).await;
        }

        let mut tx = self.inner.store().begin().await?;
        let result = self.first_write(&mut tx, dry_run, op).await;
        match result {
            Ok((output, first)) if !dry_run => {
                tx.commit().await?;
                if first {
                    info!("ledger is now in use");
                }
                self.cell.set(LedgerState::InUse);
                Ok(output)
            }
            result => {
                release(tx).await;
                result.map(|(output, _)| output)
            }
        }
    }

    /// Run `op` under the ledger lock, repairing sequences and flipping the
    /// persisted state if nobody did it before. Returns whether this call
    /// performed the transition.
    ///
    /// A dry run never repairs: it floors its own id allocations instead, so
    /// it reports the ids a real write would get and leaves the ledger as is.
    async fn first_write<Op: LedgerOperation<S>>(
        &self,
        tx: &mut S::Tx,
        dry_run: bool,
        op: Op,
    ) -> ControllerResult<(Op::Output, bool)> {
        tx.lock_ledger().await?;
        let persisted = tx.ledger_state().await?;
        let first = self.cell.get() == LedgerState::Initializing
            && persisted == LedgerState::Initializing;

        if first {
            if dry_run {
                tx.floor_sequences().await?;
            } else {
                debug!("repairing id sequences before first write");
                tx.repair_sequences().await?;
            }
        }

        let output = op.execute(&self.inner, tx).await?;

        if first && !dry_run {
            tx.update_ledger_state(LedgerState::InUse).await?;
        }
        Ok((output, first))
    }

    async fn import_logs(&self, logs: mpsc::Receiver<Log>) -> ControllerResult<()> {
        if self.cell.get() != LedgerState::Initializing {
            return Err(not_initializing());
        }

        let mut tx = self.inner.store().begin().await?;
        match self.locked_import(&mut tx, logs).await {
            Ok(()) => Ok(tx.commit().await?),
            Err(err) => {
                release(tx).await;
                Err(err)
            }
        }
    }

    /// The import itself. It leaves the state untouched: the first regular
    /// write afterwards still repairs the sequences past the imported ids.
    async fn locked_import(
        &self,
        tx: &mut S::Tx,
        logs: mpsc::Receiver<Log>,
    ) -> ControllerResult<()> {
        tx.lock_ledger().await?;
        if tx.ledger_state().await? != LedgerState::Initializing {
            self.cell.set(LedgerState::InUse);
            return Err(not_initializing());
        }
        ImportLogs(logs).execute(&self.inner, tx).await
    }
}

fn not_initializing() -> ControllerError {
    ControllerError::import("ledger is not in initializing state")
}

#[async_trait]
impl<S: LedgerStore> Controller for LedgerStateTracker<S> {
    fn ledger(&self) -> &Ledger {
        self.inner.store().ledger()
    }

    async fn create_transaction(
        &self,
        params: Parameters<CreateTransaction>,
    ) -> ControllerResult<CreatedTransaction> {
        self.handle_state(params.dry_run, params).await
    }

    async fn revert_transaction(
        &self,
        params: Parameters<RevertTransaction>,
    ) -> ControllerResult<RevertedTransaction> {
        self.handle_state(params.dry_run, params).await
    }

    async fn save_transaction_metadata(
        &self,
        params: Parameters<SaveTransactionMetadata>,
    ) -> ControllerResult<SetMetadataLog> {
        self.handle_state(params.dry_run, params).await
    }

    async fn save_account_metadata(
        &self,
        params: Parameters<SaveAccountMetadata>,
    ) -> ControllerResult<SetMetadataLog> {
        self.handle_state(params.dry_run, params).await
    }

    async fn delete_transaction_metadata(
        &self,
        params: Parameters<DeleteTransactionMetadata>,
    ) -> ControllerResult<DeleteMetadataLog> {
        self.handle_state(params.dry_run, params).await
    }

    async fn delete_account_metadata(
        &self,
        params: Parameters<DeleteAccountMetadata>,
    ) -> ControllerResult<DeleteMetadataLog> {
        self.handle_state(params.dry_run, params).await
    }

    async fn import(&self, logs: mpsc::Receiver<Log>) -> ControllerResult<()> {
        self.import_logs(logs).await
    }
}
