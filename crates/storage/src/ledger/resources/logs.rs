use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use ledgerflow_core::{Ledger, Log, LogPayload, LogType};
use num_bigint::BigInt;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use super::{compare, table};
use crate::error::{StorageError, StorageResult};
use crate::query::paginate::micros;
use crate::query::{
    DatasetContext, EntitySchema, Field, FieldType, Operator, Order, Paginable,
    PaginationAccessor, RepositoryHandler, ResourceQuery,
};
use crate::sql::{Fragment, SelectQuery, quote_ident};

static SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| {
    EntitySchema::new(vec![
        Field::new("id", FieldType::Numeric).paginated(),
        Field::new("date", FieldType::Date).paginated(),
        Field::new("type", FieldType::String),
        Field::new("idempotency_key", FieldType::String),
    ])
});

#[derive(Debug, Clone)]
pub struct LogsHandler {
    ledger: Ledger,
}

impl LogsHandler {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

impl RepositoryHandler for LogsHandler {
    type Options = ();
    type Row = LogRow;
    type Resource = Log;

    fn schema(&self) -> &EntitySchema {
        &SCHEMA
    }

    fn default_pagination(&self) -> (&'static str, Order) {
        ("id", Order::Desc)
    }

    fn build_dataset(&self, ctx: DatasetContext<'_, ()>) -> StorageResult<SelectQuery> {
        let mut dataset = SelectQuery::from_table(table(self.ledger.bucket(), "logs"))
            .columns([
                "id",
                "type",
                "data",
                "date",
                "idempotency_key",
                "idempotency_hash",
                "hash",
            ])
            .and_where(Fragment::new("ledger = ?").bind(self.ledger.name.as_str()));

        if let Some(pit) = ctx.query.pit {
            dataset = dataset.and_where(Fragment::new("date <= ?").bind(pit));
        }
        if let Some(oot) = ctx.query.oot {
            dataset = dataset.and_where(Fragment::new("date >= ?").bind(oot));
        }
        Ok(dataset)
    }

    fn resolve_filter(
        &self,
        _query: &ResourceQuery<()>,
        operator: Operator,
        property: &str,
        value: &Value,
    ) -> StorageResult<Fragment> {
        let field = SCHEMA
            .get(property)
            .ok_or_else(|| StorageError::invalid_query(format!("unknown key '{property}'")))?;
        compare(&quote_ident(&field.name), &field.field_type, operator, value)
    }
}

#[derive(Debug, Clone)]
pub struct LogRow {
    pub id: i64,
    pub log_type: String,
    pub data: Value,
    pub date: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub idempotency_hash: Option<String>,
    pub hash: Option<Vec<u8>>,
}

impl<'r> FromRow<'r, PgRow> for LogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            log_type: row.try_get("type")?,
            data: row.try_get("data")?,
            date: row.try_get("date")?,
            idempotency_key: row.try_get("idempotency_key")?,
            idempotency_hash: row.try_get("idempotency_hash")?,
            hash: row.try_get("hash")?,
        })
    }
}

fn by_id(row: &LogRow) -> BigInt {
    BigInt::from(row.id)
}

fn by_date(row: &LogRow) -> BigInt {
    micros(&row.date)
}

impl Paginable for LogRow {
    const PAGINATION_COLUMNS: &'static [(&'static str, PaginationAccessor<Self>)] =
        &[("id", by_id), ("date", by_date)];
}

impl TryFrom<LogRow> for Log {
    type Error = StorageError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let id = u64::try_from(row.id)
            .map_err(|_| StorageError::MalformedRow(format!("negative log id {}", row.id)))?;
        let log_type: LogType = row.log_type.parse()?;
        let payload = LogPayload::from_parts(log_type, row.data)?;

        Ok(Log {
            id: Some(id),
            payload,
            date: row.date,
            idempotency_key: row.idempotency_key,
            idempotency_hash: row.idempotency_hash,
            hash: row.hash,
        })
    }
}
