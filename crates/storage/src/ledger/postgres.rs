//! Postgres-backed ledger store.
//!
//! Ledgers live in buckets: one Postgres schema per bucket, shared by every
//! ledger created in it and keyed by the `ledger` column. Tables used here:
//!
//! | Table | Key | Contents |
//! |-------|-----|----------|
//! | `transactions` | `(ledger, id)`, unique `(ledger, reference)` | postings (jsonb), `sources`/`destinations` address arrays, metadata, revert and write dates |
//! | `accounts` | `(ledger, address)` | metadata, first usage, insertion and update dates |
//! | `accounts_volumes` | `(ledger, accounts_address, asset)` | running `input`/`output` totals (numeric) |
//! | `logs` | `(ledger, id)` | log type, jsonb payload, date, idempotency key and input hash, chain `hash` (bytea) |
//!
//! Ids come from per-ledger sequences `transaction_id_<ledger id>` and
//! `log_id_<ledger id>` in the bucket schema. Ledger rows, including the
//! lifecycle `state`, are in `_system.ledgers`.
//!
//! ## Locking
//!
//! [`LedgerTx::lock_ledger`] takes `pg_advisory_xact_lock(LOCK_CLASS, <ledger id>)`,
//! released by Postgres when the transaction commits or rolls back. Ledgers
//! with `HASH_LOGS=SYNC` take it in [`LedgerTx::insert_log`] too, so the last
//! log read for chaining cannot change before the new one is written.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_core::{AccountMetadata, Ledger, LedgerState, Log, Metadata, Transaction};
use sqlx::{PgPool, Postgres};
use tracing::instrument;

use super::resources::{
    AccountsHandler, LogRow, LogsHandler, TransactionRow, TransactionsHandler, VolumesHandler,
    table, to_json,
};
use super::store::{LedgerStore, LedgerTx};
use crate::error::{StorageError, StorageResult, map_sqlx_error};
use crate::query::ResourceRepository;
use crate::sql::quote_ident;

/// Advisory lock class shared by all ledger locks.
pub const LOCK_CLASS: i32 = 1;

const LOG_COLUMNS: &str = "id, type, data, date, idempotency_key, idempotency_hash, hash";

const TRANSACTION_COLUMNS: &str =
    "id, timestamp, reference, postings, metadata, reverted_at, inserted_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    ledger: Ledger,
}

impl PostgresLedgerStore {
    pub fn new(pool: Arc<PgPool>, ledger: Ledger) -> Self {
        Self { pool, ledger }
    }

    pub fn accounts(&self) -> ResourceRepository<AccountsHandler> {
        ResourceRepository::new(self.pool.clone(), AccountsHandler::new(self.ledger.clone()))
    }

    pub fn transactions(&self) -> ResourceRepository<TransactionsHandler> {
        ResourceRepository::new(self.pool.clone(), TransactionsHandler::new(self.ledger.clone()))
    }

    pub fn logs(&self) -> ResourceRepository<LogsHandler> {
        ResourceRepository::new(self.pool.clone(), LogsHandler::new(self.ledger.clone()))
    }

    pub fn volumes(&self) -> ResourceRepository<VolumesHandler> {
        ResourceRepository::new(self.pool.clone(), VolumesHandler::new(self.ledger.clone()))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = PostgresLedgerTx;

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn begin(&self) -> StorageResult<PostgresLedgerTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PostgresLedgerTx {
            tx,
            ledger: self.ledger.clone(),
            floor_ids: false,
        })
    }
}

/// Name of a per-ledger sequence, schema-qualified and quoted.
pub(crate) fn sequence_name(ledger: &Ledger, prefix: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(ledger.bucket()),
        quote_ident(&format!("{prefix}_{}", ledger.id))
    )
}

fn to_db_id(id: u64) -> StorageResult<i64> {
    i64::try_from(id).map_err(|_| StorageError::Overflow(format!("id {id} exceeds bigint")))
}

fn from_db_id(id: i64) -> StorageResult<u64> {
    u64::try_from(id).map_err(|_| StorageError::MalformedRow(format!("negative id {id}")))
}

/// An open Postgres transaction on one ledger.
pub struct PostgresLedgerTx {
    tx: sqlx::Transaction<'static, Postgres>,
    ledger: Ledger,
    floor_ids: bool,
}

impl PostgresLedgerTx {
    fn table(&self, name: &str) -> String {
        table(self.ledger.bucket(), name)
    }

    async fn next_id(&mut self, prefix: &str, table_name: &str) -> StorageResult<u64> {
        let sequence = sequence_name(&self.ledger, prefix);
        let id: i64 = if self.floor_ids {
            let sql = format!(
                r#"
                SELECT GREATEST(
                    nextval($1::regclass),
                    COALESCE((SELECT MAX(id) + 1 FROM {} WHERE ledger = $2), 1)
                )
                "#,
                self.table(table_name)
            );
            sqlx::query_scalar(&sql)
                .bind(sequence)
                .bind(&self.ledger.name)
                .fetch_one(&mut *self.tx)
                .await
        } else {
            sqlx::query_scalar("SELECT nextval($1::regclass)")
                .bind(sequence)
                .fetch_one(&mut *self.tx)
                .await
        }
        .map_err(|e| map_sqlx_error("next_id", e))?;
        from_db_id(id)
    }

    async fn last_log(&mut self) -> StorageResult<Option<Log>> {
        let sql = format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM {}
            WHERE ledger = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
            self.table("logs")
        );
        let row: Option<LogRow> = sqlx::query_as(&sql)
            .bind(&self.ledger.name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("last_log", e))?;
        row.map(Log::try_from).transpose()
    }

    async fn fetch_transaction(&mut self, sql: &str, id: u64) -> StorageResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(sql)
            .bind(&self.ledger.name)
            .bind(to_db_id(id)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_transaction", e))?;
        row.map(Transaction::try_from).transpose()
    }

    async fn upsert_account(&mut self, address: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} AS a (ledger, address, metadata, first_usage, insertion_date, updated_at)
            VALUES ($1, $2, '{{}}'::jsonb, $3, $3, $3)
            ON CONFLICT (ledger, address)
            DO UPDATE SET first_usage = LEAST(a.first_usage, excluded.first_usage)
            "#,
            self.table("accounts")
        );
        sqlx::query(&sql)
            .bind(&self.ledger.name)
            .bind(address)
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_account", e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn lock_ledger(&mut self) -> StorageResult<()> {
        let key = i32::try_from(self.ledger.id)
            .map_err(|_| StorageError::Overflow(format!("ledger id {}", self.ledger.id)))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_ledger", e))?;
        Ok(())
    }

    async fn ledger_state(&mut self) -> StorageResult<LedgerState> {
        let state: String = sqlx::query_scalar("SELECT state FROM _system.ledgers WHERE name = $1")
            .bind(&self.ledger.name)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("ledger_state", e))?;
        Ok(state.parse()?)
    }

    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn update_ledger_state(&mut self, state: LedgerState) -> StorageResult<()> {
        sqlx::query("UPDATE _system.ledgers SET state = $1 WHERE name = $2")
            .bind(state.as_str())
            .bind(&self.ledger.name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_ledger_state", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn repair_sequences(&mut self) -> StorageResult<()> {
        for (prefix, table_name) in [("transaction_id", "transactions"), ("log_id", "logs")] {
            let sql = format!(
                r#"
                SELECT setval(
                    $1::regclass,
                    COALESCE((SELECT MAX(id) + 1 FROM {} WHERE ledger = $2), 1)::bigint,
                    false
                )
                "#,
                self.table(table_name)
            );
            sqlx::query(&sql)
                .bind(sequence_name(&self.ledger, prefix))
                .bind(&self.ledger.name)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("repair_sequences", e))?;
        }
        Ok(())
    }

    async fn floor_sequences(&mut self) -> StorageResult<()> {
        self.floor_ids = true;
        Ok(())
    }

    async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> StorageResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }

    async fn has_logs(&mut self) -> StorageResult<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE ledger = $1)",
            self.table("logs")
        );
        sqlx::query_scalar(&sql)
            .bind(&self.ledger.name)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("has_logs", e))
    }

    async fn find_log_by_idempotency_key(&mut self, key: &str) -> StorageResult<Option<Log>> {
        let sql = format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM {}
            WHERE ledger = $1 AND idempotency_key = $2
            "#,
            self.table("logs")
        );
        let row: Option<LogRow> = sqlx::query_as(&sql)
            .bind(&self.ledger.name)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_log_by_idempotency_key", e))?;
        row.map(Log::try_from).transpose()
    }

    #[instrument(skip(self, log), fields(ledger = %self.ledger.name, log_type = %log.log_type()), err)]
    async fn insert_log(&mut self, log: &mut Log) -> StorageResult<()> {
        let hash = if self.ledger.hashes_logs() {
            self.lock_ledger().await?;
            let previous = self.last_log().await?;
            Some(log.compute_hash(previous.as_ref())?)
        } else {
            None
        };
        let id = match log.id {
            Some(id) => id,
            None => self.next_id("log_id", "logs").await?,
        };
        let data = log.payload.to_data()?;

        let sql = format!(
            r#"
            INSERT INTO {} (ledger, id, type, data, date, idempotency_key, idempotency_hash, hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.table("logs")
        );
        sqlx::query(&sql)
            .bind(&self.ledger.name)
            .bind(to_db_id(id)?)
            .bind(log.log_type().as_str())
            .bind(data)
            .bind(log.date)
            .bind(log.idempotency_key.as_deref())
            .bind(log.idempotency_hash.as_deref())
            .bind(hash.as_deref())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_log", e))?;

        log.id = Some(id);
        log.hash = hash;
        Ok(())
    }

    #[instrument(skip(self, transaction), fields(ledger = %self.ledger.name, postings = transaction.postings.len()), err)]
    async fn insert_transaction(&mut self, transaction: &mut Transaction) -> StorageResult<()> {
        let id = match transaction.id {
            Some(id) => id,
            None => self.next_id("transaction_id", "transactions").await?,
        };
        let now = Utc::now();
        let sources: Vec<&str> = transaction.postings.iter().map(|p| p.source.as_str()).collect();
        let destinations: Vec<&str> = transaction
            .postings
            .iter()
            .map(|p| p.destination.as_str())
            .collect();

        let sql = format!(
            r#"
            INSERT INTO {} (
                ledger, id, timestamp, reference, postings, metadata,
                sources, destinations, reverted_at, inserted_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
            self.table("transactions")
        );
        sqlx::query(&sql)
            .bind(&self.ledger.name)
            .bind(to_db_id(id)?)
            .bind(transaction.timestamp)
            .bind(transaction.reference.as_deref())
            .bind(to_json(&transaction.postings)?)
            .bind(to_json(&transaction.metadata)?)
            .bind(to_json(&sources)?)
            .bind(to_json(&destinations)?)
            .bind(transaction.reverted_at)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| match map_sqlx_error("insert_transaction", e) {
                StorageError::Conflict(_) => StorageError::Conflict(format!(
                    "transaction {id} or reference {:?} already exists",
                    transaction.reference
                )),
                other => other,
            })?;

        for address in transaction.accounts() {
            self.upsert_account(address, transaction.timestamp).await?;
        }

        let volumes_sql = format!(
            r#"
            INSERT INTO {} AS v (ledger, accounts_address, asset, input, output)
            VALUES ($1, $2, $3, $4::numeric, $5::numeric)
            ON CONFLICT (ledger, accounts_address, asset)
            DO UPDATE SET input = v.input + excluded.input, output = v.output + excluded.output
            "#,
            self.table("accounts_volumes")
        );
        for ((address, asset), volumes) in transaction.volume_updates() {
            sqlx::query(&volumes_sql)
                .bind(&self.ledger.name)
                .bind(address)
                .bind(asset)
                .bind(volumes.input.to_string())
                .bind(volumes.output.to_string())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("update_volumes", e))?;
        }

        transaction.id = Some(id);
        transaction.inserted_at = Some(now);
        transaction.updated_at = Some(now);
        Ok(())
    }

    async fn get_transaction(&mut self, id: u64) -> StorageResult<Transaction> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM {} WHERE ledger = $1 AND id = $2",
            self.table("transactions")
        );
        self.fetch_transaction(&sql, id)
            .await?
            .ok_or(StorageError::NotFound)
    }

    #[instrument(skip(self), fields(ledger = %self.ledger.name), err)]
    async fn revert_transaction(
        &mut self,
        id: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<(Transaction, bool)> {
        let sql = format!(
            r#"
            UPDATE {} SET reverted_at = $3, updated_at = $3
            WHERE ledger = $1 AND id = $2 AND reverted_at IS NULL
            RETURNING {TRANSACTION_COLUMNS}
            "#,
            self.table("transactions")
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(&self.ledger.name)
            .bind(to_db_id(id)?)
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("revert_transaction", e))?;

        match row {
            Some(row) => Ok((Transaction::try_from(row)?, true)),
            None => Ok((self.get_transaction(id).await?, false)),
        }
    }

    async fn update_transaction_metadata(
        &mut self,
        id: u64,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> StorageResult<Transaction> {
        let sql = format!(
            r#"
            UPDATE {} SET metadata = metadata || $3, updated_at = $4
            WHERE ledger = $1 AND id = $2
            RETURNING {TRANSACTION_COLUMNS}
            "#,
            self.table("transactions")
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(&self.ledger.name)
            .bind(to_db_id(id)?)
            .bind(to_json(metadata)?)
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_transaction_metadata", e))?;
        row.map(Transaction::try_from)
            .transpose()?
            .ok_or(StorageError::NotFound)
    }

    async fn delete_transaction_metadata(
        &mut self,
        id: u64,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Transaction> {
        let sql = format!(
            r#"
            UPDATE {} SET metadata = metadata - $3::text, updated_at = $4
            WHERE ledger = $1 AND id = $2
            RETURNING {TRANSACTION_COLUMNS}
            "#,
            self.table("transactions")
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(&self.ledger.name)
            .bind(to_db_id(id)?)
            .bind(key)
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_transaction_metadata", e))?;
        row.map(Transaction::try_from)
            .transpose()?
            .ok_or(StorageError::NotFound)
    }

    async fn update_accounts_metadata(
        &mut self,
        metadata: &AccountMetadata,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} AS a (ledger, address, metadata, first_usage, insertion_date, updated_at)
            VALUES ($1, $2, $3, $4, $4, $4)
            ON CONFLICT (ledger, address)
            DO UPDATE SET metadata = a.metadata || excluded.metadata, updated_at = excluded.updated_at
            "#,
            self.table("accounts")
        );
        for (address, values) in metadata {
            sqlx::query(&sql)
                .bind(&self.ledger.name)
                .bind(address)
                .bind(to_json(values)?)
                .bind(at)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("update_accounts_metadata", e))?;
        }
        Ok(())
    }

    async fn delete_account_metadata(
        &mut self,
        address: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let sql = format!(
            r#"
            UPDATE {} SET metadata = metadata - $3::text, updated_at = $4
            WHERE ledger = $1 AND address = $2
            "#,
            self.table("accounts")
        );
        let result = sqlx::query(&sql)
            .bind(&self.ledger.name)
            .bind(address)
            .bind(key)
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_account_metadata", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_core::Configuration;

    #[test]
    fn sequences_are_per_ledger_in_the_bucket() {
        let mut ledger = Ledger::new("main", Configuration::default().with_bucket("b1")).unwrap();
        ledger.id = 12;
        assert_eq!(sequence_name(&ledger, "transaction_id"), "\"b1\".\"transaction_id_12\"");
        assert_eq!(sequence_name(&ledger, "log_id"), "\"b1\".\"log_id_12\"");
    }

    #[test]
    fn ids_must_fit_bigint() {
        assert_eq!(to_db_id(7).unwrap(), 7);
        assert_eq!(to_db_id(u64::MAX).unwrap_err().kind(), crate::error::ErrorKind::Overflow);
        assert!(from_db_id(-1).is_err());
    }
}
