//! Ledger write operations.
//!
//! [`DefaultController`] implements every write as a `*_in` method running
//! inside a caller-provided ledger transaction. Each write produces exactly
//! one audit log. Wrappers decide how that transaction is opened and ended:
//! the default controller alone uses a plain transaction, while
//! [`LedgerStateTracker`](super::LedgerStateTracker) adds the lifecycle
//! protocol around it.

use async_trait::async_trait;
use chrono::Utc;
use ledgerflow_core::transaction::is_valid_address;
use ledgerflow_core::{
    AccountMetadata, DeleteMetadataPayload, Ledger, Log, LogPayload, MetadataTarget,
    NewTransactionPayload, RevertedTransactionPayload, SetMetadataPayload, Transaction,
    idempotency_hash,
};
use serde::Serialize;
use ledgerflow_storage::{ErrorKind, LedgerStore, LedgerTx};
use tokio::sync::mpsc;
use tracing::{Span, debug, instrument, warn};

use super::params::{
    CreateTransaction, CreatedTransaction, DeleteAccountMetadata, DeleteMetadataLog,
    DeleteTransactionMetadata, FromLog, Parameters, RevertTransaction, RevertedTransaction,
    SaveAccountMetadata, SaveTransactionMetadata, SetMetadataLog,
};
use crate::error::{ControllerError, ControllerResult};

/// Write API of one ledger.
#[async_trait]
pub trait Controller: Send + Sync {
    fn ledger(&self) -> &Ledger;

    async fn create_transaction(
        &self,
        params: Parameters<CreateTransaction>,
    ) -> ControllerResult<CreatedTransaction>;

    async fn revert_transaction(
        &self,
        params: Parameters<RevertTransaction>,
    ) -> ControllerResult<RevertedTransaction>;

    async fn save_transaction_metadata(
        &self,
        params: Parameters<SaveTransactionMetadata>,
    ) -> ControllerResult<SetMetadataLog>;

    async fn save_account_metadata(
        &self,
        params: Parameters<SaveAccountMetadata>,
    ) -> ControllerResult<SetMetadataLog>;

    async fn delete_transaction_metadata(
        &self,
        params: Parameters<DeleteTransactionMetadata>,
    ) -> ControllerResult<DeleteMetadataLog>;

    async fn delete_account_metadata(
        &self,
        params: Parameters<DeleteAccountMetadata>,
    ) -> ControllerResult<DeleteMetadataLog>;

    /// Replay a stream of logs, ids included, into an empty ledger.
    async fn import(&self, logs: mpsc::Receiver<Log>) -> ControllerResult<()>;
}

/// One write, runnable inside an open ledger transaction.
#[async_trait]
pub trait LedgerOperation<S: LedgerStore>: Send {
    type Output: Send;

    async fn execute(
        self,
        controller: &DefaultController<S>,
        tx: &mut S::Tx,
    ) -> ControllerResult<Self::Output>;
}

macro_rules! ledger_operation {
    ($input:ty => $output:ty, $method:ident) => {
        #[async_trait]
        impl<S: LedgerStore> LedgerOperation<S> for Parameters<$input> {
            type Output = $output;

            async fn execute(
                self,
                controller: &DefaultController<S>,
                tx: &mut S::Tx,
            ) -> ControllerResult<$output> {
                controller.$method(tx, self).await
            }
        }
    };
}

ledger_operation!(CreateTransaction => CreatedTransaction, create_transaction_in);
ledger_operation!(RevertTransaction => RevertedTransaction, revert_transaction_in);
ledger_operation!(SaveTransactionMetadata => SetMetadataLog, save_transaction_metadata_in);
ledger_operation!(SaveAccountMetadata => SetMetadataLog, save_account_metadata_in);
ledger_operation!(DeleteTransactionMetadata => DeleteMetadataLog, delete_transaction_metadata_in);
ledger_operation!(DeleteAccountMetadata => DeleteMetadataLog, delete_account_metadata_in);

/// Log replay as an operation.
pub struct ImportLogs(pub mpsc::Receiver<Log>);

#[async_trait]
impl<S: LedgerStore> LedgerOperation<S> for ImportLogs {
    type Output = ();

    async fn execute(self, controller: &DefaultController<S>, tx: &mut S::Tx) -> ControllerResult<()> {
        controller.import_in(tx, self.0).await
    }
}

/// Roll back a transaction that is being abandoned. Rolling back also
/// releases the ledger lock; a failure there is only logged.
pub(crate) async fn release<T: LedgerTx>(tx: T) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "failed to roll back ledger transaction");
    }
}

/// Hash of the request input, computed only for requests with an
/// idempotency key.
fn hash_input<T: Serialize>(params: &Parameters<T>) -> ControllerResult<Option<String>> {
    if params.idempotency_key.is_none() {
        return Ok(None);
    }
    Ok(Some(idempotency_hash(&params.input)?))
}

/// The result previously logged under the request's idempotency key.
///
/// The logged input hash must match `computed`; logs stored without one
/// (imported from an older export) are trusted.
async fn replay<O: FromLog, T>(
    tx: &mut impl LedgerTx,
    params: &Parameters<T>,
    computed: Option<&str>,
) -> ControllerResult<Option<O>> {
    let Some(key) = params.idempotency_key.as_deref() else {
        return Ok(None);
    };
    let Some(log) = tx.find_log_by_idempotency_key(key).await? else {
        return Ok(None);
    };
    if let (Some(expected), Some(computed)) = (log.idempotency_hash.as_deref(), computed) {
        if expected != computed {
            return Err(ControllerError::InvalidIdempotencyInput {
                key: key.to_string(),
                expected: expected.to_string(),
                computed: computed.to_string(),
            });
        }
    }
    debug!(idempotency_key = key, log_type = %O::LOG_TYPE, "replaying logged result");
    O::from_log(log).map(Some)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct DefaultController<S> {
    store: S,
}

impl<S: LedgerStore> DefaultController<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `op` in a plain transaction: commit on success, roll back on
    /// error or dry run.
    pub async fn run<Op: LedgerOperation<S>>(
        &self,
        dry_run: bool,
        op: Op,
    ) -> ControllerResult<Op::Output> {
        let mut tx = self.store.begin().await?;
        match op.execute(self, &mut tx).await {
            Ok(output) if !dry_run => {
                tx.commit().await?;
                Ok(output)
            }
            result => {
                release(tx).await;
                result
            }
        }
    }

    async fn write_log(
        &self,
        tx: &mut S::Tx,
        payload: LogPayload,
        idempotency_key: Option<String>,
        idempotency_hash: Option<String>,
    ) -> ControllerResult<Log> {
        let mut log = Log::new(payload)
            .with_idempotency_key(idempotency_key)
            .with_idempotency_hash(idempotency_hash);
        tx.insert_log(&mut log).await?;
        Ok(log)
    }

    #[instrument(skip_all, fields(ledger = %self.store.ledger().name, transaction_id = tracing::field::Empty), err)]
    pub async fn create_transaction_in(
        &self,
        tx: &mut S::Tx,
        params: Parameters<CreateTransaction>,
    ) -> ControllerResult<CreatedTransaction> {
        let input = &params.input;
        let mut transaction = Transaction::new(input.postings.clone())
            .with_metadata(input.metadata.clone());
        if let Some(timestamp) = input.timestamp {
            transaction = transaction.with_timestamp(timestamp);
        }
        if let Some(reference) = &input.reference {
            transaction = transaction.with_reference(reference.clone());
        }
        transaction.validate()?;
        validate_addresses(input.account_metadata.keys())?;

        let input_hash = hash_input(&params)?;
        if let Some(replayed) = replay(tx, &params, input_hash.as_deref()).await? {
            return Ok(replayed);
        }

        tx.insert_transaction(&mut transaction).await.map_err(|err| {
            match (&input.reference, err.kind()) {
                (Some(reference), ErrorKind::Conflict) => {
                    ControllerError::ReferenceConflict(reference.clone())
                }
                _ => ControllerError::Storage(err),
            }
        })?;
        if let Some(id) = transaction.id {
            Span::current().record("transaction_id", id);
        }

        if !input.account_metadata.is_empty() {
            tx.update_accounts_metadata(&input.account_metadata, Utc::now())
                .await?;
        }

        let account_metadata = input.account_metadata.clone();
        let log = self
            .write_log(
                tx,
                LogPayload::NewTransaction(NewTransactionPayload {
                    transaction: transaction.clone(),
                    account_metadata: account_metadata.clone(),
                }),
                params.idempotency_key,
                input_hash,
            )
            .await?;

        Ok(CreatedTransaction {
            log,
            transaction,
            account_metadata,
        })
    }

    #[instrument(skip_all, fields(ledger = %self.store.ledger().name, transaction_id = params.input.transaction_id), err)]
    pub async fn revert_transaction_in(
        &self,
        tx: &mut S::Tx,
        params: Parameters<RevertTransaction>,
    ) -> ControllerResult<RevertedTransaction> {
        let input_hash = hash_input(&params)?;
        if let Some(replayed) = replay(tx, &params, input_hash.as_deref()).await? {
            return Ok(replayed);
        }

        let id = params.input.transaction_id;
        let original = tx
            .get_transaction(id)
            .await
            .map_err(ControllerError::not_found(format!("transaction {id}")))?;
        if original.is_reverted() {
            return Err(ControllerError::AlreadyReverted(id));
        }

        let now = Utc::now();
        let mut revert = original
            .reverse()
            .with_metadata(params.input.metadata.clone());
        if params.input.at_effective_date {
            revert = revert.with_timestamp(original.timestamp);
        }
        tx.insert_transaction(&mut revert).await?;

        let (reverted, marked) = tx.revert_transaction(id, now).await?;
        if !marked {
            return Err(ControllerError::AlreadyReverted(id));
        }

        let log = self
            .write_log(
                tx,
                LogPayload::RevertedTransaction(RevertedTransactionPayload {
                    reverted_transaction: reverted.clone(),
                    revert_transaction: revert.clone(),
                }),
                params.idempotency_key,
                input_hash,
            )
            .await?;

        Ok(RevertedTransaction {
            log,
            reverted,
            revert,
        })
    }

    pub async fn save_transaction_metadata_in(
        &self,
        tx: &mut S::Tx,
        params: Parameters<SaveTransactionMetadata>,
    ) -> ControllerResult<SetMetadataLog> {
        let input_hash = hash_input(&params)?;
        if let Some(replayed) = replay(tx, &params, input_hash.as_deref()).await? {
            return Ok(replayed);
        }

        let SaveTransactionMetadata {
            transaction_id,
            metadata,
        } = params.input;
        tx.update_transaction_metadata(transaction_id, &metadata, Utc::now())
            .await
            .map_err(ControllerError::not_found(format!("transaction {transaction_id}")))?;

        let payload = LogPayload::SetMetadata(SetMetadataPayload {
            target: MetadataTarget::Transaction(transaction_id),
            metadata,
        });
        let log = self
            .write_log(tx, payload, params.idempotency_key, input_hash)
            .await?;
        Ok(SetMetadataLog(log))
    }

    pub async fn save_account_metadata_in(
        &self,
        tx: &mut S::Tx,
        params: Parameters<SaveAccountMetadata>,
    ) -> ControllerResult<SetMetadataLog> {
        validate_addresses([&params.input.address])?;
        let input_hash = hash_input(&params)?;
        if let Some(replayed) = replay(tx, &params, input_hash.as_deref()).await? {
            return Ok(replayed);
        }

        let SaveAccountMetadata { address, metadata } = params.input;
        let update = AccountMetadata::from([(address.clone(), metadata.clone())]);
        tx.update_accounts_metadata(&update, Utc::now()).await?;

        let payload = LogPayload::SetMetadata(SetMetadataPayload {
            target: MetadataTarget::Account(address),
            metadata,
        });
        let log = self
            .write_log(tx, payload, params.idempotency_key, input_hash)
            .await?;
        Ok(SetMetadataLog(log))
    }

    pub async fn delete_transaction_metadata_in(
        &self,
        tx: &mut S::Tx,
        params: Parameters<DeleteTransactionMetadata>,
    ) -> ControllerResult<DeleteMetadataLog> {
        let input_hash = hash_input(&params)?;
        if let Some(replayed) = replay(tx, &params, input_hash.as_deref()).await? {
            return Ok(replayed);
        }

        let DeleteTransactionMetadata {
            transaction_id,
            key,
        } = params.input;
        tx.delete_transaction_metadata(transaction_id, &key, Utc::now())
            .await
            .map_err(ControllerError::not_found(format!("transaction {transaction_id}")))?;

        let payload = LogPayload::DeleteMetadata(DeleteMetadataPayload {
            target: MetadataTarget::Transaction(transaction_id),
            key,
        });
        let log = self
            .write_log(tx, payload, params.idempotency_key, input_hash)
            .await?;
        Ok(DeleteMetadataLog(log))
    }

    pub async fn delete_account_metadata_in(
        &self,
        tx: &mut S::Tx,
        params: Parameters<DeleteAccountMetadata>,
    ) -> ControllerResult<DeleteMetadataLog> {
        let input_hash = hash_input(&params)?;
        if let Some(replayed) = replay(tx, &params, input_hash.as_deref()).await? {
            return Ok(replayed);
        }

        let DeleteAccountMetadata { address, key } = params.input;
        tx.delete_account_metadata(&address, &key, Utc::now())
            .await
            .map_err(ControllerError::not_found(format!("account {address}")))?;

        let payload = LogPayload::DeleteMetadata(DeleteMetadataPayload {
            target: MetadataTarget::Account(address),
            key,
        });
        let log = self
            .write_log(tx, payload, params.idempotency_key, input_hash)
            .await?;
        Ok(DeleteMetadataLog(log))
    }

    /// Replay `logs` into the ledger, keeping their ids.
    ///
    /// The ledger must not have any log yet and ids must be strictly
    /// increasing. A log that cannot be applied is reported with its id and
    /// the underlying error. On ledgers that hash their logs, each imported
    /// hash must equal the one chained on insertion.
    #[instrument(skip_all, fields(ledger = %self.store.ledger().name, imported = tracing::field::Empty), err)]
    pub async fn import_in(
        &self,
        tx: &mut S::Tx,
        mut logs: mpsc::Receiver<Log>,
    ) -> ControllerResult<()> {
        if tx.has_logs().await? {
            return Err(ControllerError::import("ledger must be empty"));
        }

        let hashed = self.store.ledger().hashes_logs();
        let mut last_id: Option<u64> = None;
        let mut imported = 0u64;
        while let Some(mut log) = logs.recv().await {
            let id = log
                .id
                .ok_or_else(|| ControllerError::import("log without id"))?;
            if last_id.is_some_and(|last| id <= last) {
                return Err(ControllerError::import(format!(
                    "log {id} is out of order"
                )));
            }

            self.apply_log(tx, &log)
                .await
                .map_err(ControllerError::import_replay(id))?;
            let provided = log.hash.take();
            tx.insert_log(&mut log)
                .await
                .map_err(|err| ControllerError::import_replay(id)(err.into()))?;
            if hashed && log.hash != provided {
                return Err(ControllerError::InvalidLogHash {
                    log_id: id,
                    expected: provided.as_deref().map(hex).unwrap_or_default(),
                    computed: log.hash.as_deref().map(hex).unwrap_or_default(),
                });
            }

            last_id = Some(id);
            imported += 1;
        }

        Span::current().record("imported", imported);
        Ok(())
    }

    async fn apply_log(&self, tx: &mut S::Tx, log: &Log) -> ControllerResult<()> {
        match &log.payload {
            LogPayload::NewTransaction(payload) => {
                let mut transaction = payload.transaction.clone();
                if transaction.id.is_none() {
                    return Err(ControllerError::import("transaction without id"));
                }
                tx.insert_transaction(&mut transaction).await?;
                if !payload.account_metadata.is_empty() {
                    tx.update_accounts_metadata(&payload.account_metadata, log.date)
                        .await?;
                }
            }
            LogPayload::SetMetadata(payload) => match &payload.target {
                MetadataTarget::Transaction(id) => {
                    tx.update_transaction_metadata(*id, &payload.metadata, log.date)
                        .await?;
                }
                MetadataTarget::Account(address) => {
                    let update = AccountMetadata::from([(address.clone(), payload.metadata.clone())]);
                    tx.update_accounts_metadata(&update, log.date).await?;
                }
            },
            LogPayload::DeleteMetadata(payload) => match &payload.target {
                MetadataTarget::Transaction(id) => {
                    tx.delete_transaction_metadata(*id, &payload.key, log.date)
                        .await?;
                }
                MetadataTarget::Account(address) => {
                    tx.delete_account_metadata(address, &payload.key, log.date)
                        .await?;
                }
            },
            LogPayload::RevertedTransaction(payload) => {
                let mut revert = payload.revert_transaction.clone();
                if revert.id.is_none() {
                    return Err(ControllerError::import("revert transaction without id"));
                }
                tx.insert_transaction(&mut revert).await?;

                let reverted = &payload.reverted_transaction;
                let id = reverted
                    .id
                    .ok_or_else(|| ControllerError::import("reverted transaction without id"))?;
                let at = reverted.reverted_at.unwrap_or(log.date);
                tx.revert_transaction(id, at).await?;
            }
        }
        Ok(())
    }
}

fn validate_addresses<'a>(addresses: impl IntoIterator<Item = &'a String>) -> ControllerResult<()> {
    match addresses.into_iter().find(|address| !is_valid_address(address)) {
        Some(address) => Err(ControllerError::Validation(format!(
            "invalid account address '{address}'"
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl<S: LedgerStore> Controller for DefaultController<S> {
    fn ledger(&self) -> &Ledger {
        self.store.ledger()
    }

    async fn create_transaction(
        &self,
        params: Parameters<CreateTransaction>,
    ) -> ControllerResult<CreatedTransaction> {
        self.run(params.dry_run, params).await
    }

    async fn revert_transaction(
        &self,
        params: Parameters<RevertTransaction>,
    ) -> ControllerResult<RevertedTransaction> {
        self.run(params.dry_run, params).await
    }

    async fn save_transaction_metadata(
        &self,
        params: Parameters<SaveTransactionMetadata>,
    ) -> ControllerResult<SetMetadataLog> {
        self.run(params.dry_run, params).await
    }

    async fn save_account_metadata(
        &self,
        params: Parameters<SaveAccountMetadata>,
    ) -> ControllerResult<SetMetadataLog> {
        self.run(params.dry_run, params).await
    }

    async fn delete_transaction_metadata(
        &self,
        params: Parameters<DeleteTransactionMetadata>,
    ) -> ControllerResult<DeleteMetadataLog> {
        self.run(params.dry_run, params).await
    }

    async fn delete_account_metadata(
        &self,
        params: Parameters<DeleteAccountMetadata>,
    ) -> ControllerResult<DeleteMetadataLog> {
        self.run(params.dry_run, params).await
    }

    async fn import(&self, logs: mpsc::Receiver<Log>) -> ControllerResult<()> {
        self.run(false, ImportLogs(logs)).await
    }
}
