//! Postgres-backed registry of ledgers (`_system.ledgers`).

use std::sync::Arc;

use ledgerflow_core::{Ledger, Metadata};
use sqlx::PgPool;
use tracing::{Span, instrument};

use super::ledgers::{LedgerRow, LedgersHandler};
use crate::error::{StorageError, StorageResult, map_sqlx_error};
use crate::ledger::postgres::sequence_name;
use crate::ledger::resources::{table, to_json};
use crate::query::ResourceRepository;

const LEDGER_COLUMNS: &str = "id, name, bucket, metadata, features, state, added_at";

#[derive(Debug, Clone)]
pub struct PostgresSystemStore {
    pool: Arc<PgPool>,
}

impl PostgresSystemStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn ledgers(&self) -> ResourceRepository<LedgersHandler> {
        ResourceRepository::new(self.pool.clone(), LedgersHandler)
    }

    /// Register a ledger and create its id sequences.
    ///
    /// Fills the assigned id and registration date into `ledger`. A name
    /// already taken is a conflict.
    #[instrument(skip(self, ledger), fields(ledger = %ledger.name, bucket = %ledger.bucket(), ledger_id = tracing::field::Empty), err)]
    pub async fn create_ledger(&self, ledger: &mut Ledger) -> StorageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_ledger", e))?;

        let sql = format!(
            r#"
            INSERT INTO _system.ledgers (name, bucket, metadata, features, state, added_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {LEDGER_COLUMNS}
            "#
        );
        let row: LedgerRow = sqlx::query_as(&sql)
            .bind(&ledger.name)
            .bind(ledger.bucket())
            .bind(to_json(&ledger.configuration.metadata)?)
            .bind(to_json(&ledger.configuration.features)?)
            .bind(ledger.state.as_str())
            .bind(ledger.added_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_ledger", e))?;
        let created = Ledger::try_from(row)?;
        Span::current().record("ledger_id", created.id);

        for (prefix, table_name) in [("transaction_id", "transactions"), ("log_id", "logs")] {
            let sequence = sequence_name(&created, prefix);
            sqlx::query(&format!("CREATE SEQUENCE IF NOT EXISTS {sequence}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_ledger", e))?;

            let sql = format!(
                r#"
                SELECT setval(
                    $1::regclass,
                    COALESCE((SELECT MAX(id) + 1 FROM {} WHERE ledger = $2), 1)::bigint,
                    false
                )
                "#,
                table(created.bucket(), table_name)
            );
            sqlx::query(&sql)
                .bind(&sequence)
                .bind(&created.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_ledger", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_ledger", e))?;
        *ledger = created;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_ledger(&self, name: &str) -> StorageResult<Ledger> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM _system.ledgers WHERE name = $1");
        let row: LedgerRow = sqlx::query_as(&sql)
            .bind(name)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_ledger", e))?;
        Ledger::try_from(row)
    }

    #[instrument(skip(self, metadata), err)]
    pub async fn update_ledger_metadata(&self, name: &str, metadata: &Metadata) -> StorageResult<()> {
        let result = sqlx::query("UPDATE _system.ledgers SET metadata = metadata || $2 WHERE name = $1")
            .bind(name)
            .bind(to_json(metadata)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_ledger_metadata", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn delete_ledger_metadata(&self, name: &str, key: &str) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE _system.ledgers SET metadata = metadata - $2::text WHERE name = $1")
                .bind(name)
                .bind(key)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_ledger_metadata", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
