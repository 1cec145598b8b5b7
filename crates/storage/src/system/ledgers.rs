use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use ledgerflow_core::{Configuration, Ledger};
use num_bigint::BigInt;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use crate::error::{StorageError, StorageResult};
use crate::ledger::resources::{compare, metadata_filter, metadata_from, sub_key};
use crate::query::paginate::micros;
use crate::query::{
    DatasetContext, EntitySchema, Field, FieldType, Operator, Order, Paginable,
    PaginationAccessor, RepositoryHandler, ResourceQuery,
};
use crate::sql::{Fragment, SelectQuery, quote_ident};

static SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| {
    EntitySchema::new(vec![
        Field::new("id", FieldType::Numeric).paginated(),
        Field::new("name", FieldType::String).paginated(),
        Field::new("bucket", FieldType::String).paginated(),
        Field::new("state", FieldType::String),
        Field::new("added_at", FieldType::Date)
            .with_aliases(&["addedAt"])
            .paginated(),
        Field::new("metadata", FieldType::map_of(FieldType::String)),
        Field::new("features", FieldType::map_of(FieldType::String)),
    ])
});

/// Ledgers registered in `_system.ledgers`.
#[derive(Debug, Clone, Default)]
pub struct LedgersHandler;

impl RepositoryHandler for LedgersHandler {
    type Options = ();
    type Row = LedgerRow;
    type Resource = Ledger;

    fn schema(&self) -> &EntitySchema {
        &SCHEMA
    }

    fn default_pagination(&self) -> (&'static str, Order) {
        ("id", Order::Asc)
    }

    fn build_dataset(&self, ctx: DatasetContext<'_, ()>) -> StorageResult<SelectQuery> {
        let mut dataset = SelectQuery::from_table("_system.ledgers").columns([
            "id", "name", "bucket", "metadata", "features", "state", "added_at",
        ]);
        if let Some(pit) = ctx.query.pit {
            dataset = dataset.and_where(Fragment::new("added_at <= ?").bind(pit));
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
            .resolve_key(property)
            .map(|(field, _)| field)
            .ok_or_else(|| StorageError::invalid_query(format!("unknown key '{property}'")))?;
        match field.name.as_str() {
            column @ ("metadata" | "features") => {
                metadata_filter(column, operator, sub_key(property).unwrap_or_default(), value)
            }
            name => compare(&quote_ident(name), &field.field_type, operator, value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: i32,
    pub name: String,
    pub bucket: String,
    pub metadata: Value,
    pub features: Value,
    pub state: String,
    pub added_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LedgerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            bucket: row.try_get("bucket")?,
            metadata: row.try_get("metadata")?,
            features: row.try_get("features")?,
            state: row.try_get("state")?,
            added_at: row.try_get("added_at")?,
        })
    }
}

fn by_id(row: &LedgerRow) -> BigInt {
    BigInt::from(row.id)
}

fn by_added_at(row: &LedgerRow) -> BigInt {
    micros(&row.added_at)
}

impl Paginable for LedgerRow {
    const PAGINATION_COLUMNS: &'static [(&'static str, PaginationAccessor<Self>)] =
        &[("id", by_id), ("added_at", by_added_at)];
}

impl TryFrom<LedgerRow> for Ledger {
    type Error = StorageError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let id = u32::try_from(row.id)
            .map_err(|_| StorageError::MalformedRow(format!("negative ledger id {}", row.id)))?;
        Ok(Ledger {
            id,
            state: row.state.parse()?,
            configuration: Configuration {
                bucket: row.bucket,
                metadata: metadata_from(row.metadata)?,
                features: metadata_from(row.features)?,
            },
            name: row.name,
            added_at: row.added_at,
        })
    }
}
