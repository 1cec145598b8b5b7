use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use ledgerflow_core::{Ledger, Posting, Transaction};
use num_bigint::BigInt;
use serde_json::{Value, json};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use super::{compare, metadata_filter, metadata_from, sub_key, table};
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
        Field::new("timestamp", FieldType::Date).paginated(),
        Field::new("inserted_at", FieldType::Date)
            .with_aliases(&["insertion_date"])
            .paginated(),
        Field::new("updated_at", FieldType::Date).paginated(),
        Field::new("reference", FieldType::String),
        Field::new("reverted", FieldType::Boolean),
        Field::new("account", FieldType::String),
        Field::new("source", FieldType::String),
        Field::new("destination", FieldType::String),
        Field::new("metadata", FieldType::map_of(FieldType::String)),
    ])
});

/// Transactions of one ledger.
///
/// With a point in time, transactions after it are excluded and a revert
/// that happened later is not visible.
#[derive(Debug, Clone)]
pub struct TransactionsHandler {
    ledger: Ledger,
}

impl TransactionsHandler {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

impl RepositoryHandler for TransactionsHandler {
    type Options = ();
    type Row = TransactionRow;
    type Resource = Transaction;

    fn schema(&self) -> &EntitySchema {
        &SCHEMA
    }

    fn default_pagination(&self) -> (&'static str, Order) {
        ("id", Order::Desc)
    }

    fn build_dataset(&self, ctx: DatasetContext<'_, ()>) -> StorageResult<SelectQuery> {
        let reverted_at = match ctx.query.pit {
            Some(pit) => Fragment::new("case when reverted_at <= ? then reverted_at end as reverted_at")
                .bind(pit),
            None => Fragment::new("reverted_at"),
        };

        let mut dataset = SelectQuery::from_table(table(self.ledger.bucket(), "transactions"))
            .columns([
                "id",
                "timestamp",
                "reference",
                "postings",
                "metadata",
                "sources",
                "destinations",
                "inserted_at",
                "updated_at",
            ])
            .column(reverted_at)
            .and_where(Fragment::new("ledger = ?").bind(self.ledger.name.as_str()));

        if let Some(pit) = ctx.query.pit {
            dataset = dataset.and_where(Fragment::new("timestamp <= ?").bind(pit));
        }
        if let Some(oot) = ctx.query.oot {
            dataset = dataset.and_where(Fragment::new("timestamp >= ?").bind(oot));
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
            "reverted" => Ok(Fragment::new(if value == &Value::Bool(true) {
                "reverted_at is not null"
            } else {
                "reverted_at is null"
            })),
            "account" => addresses_filter(&["sources", "destinations"], operator, value),
            "source" => addresses_filter(&["sources"], operator, value),
            "destination" => addresses_filter(&["destinations"], operator, value),
            "metadata" => {
                let key = sub_key(property).unwrap_or_default();
                metadata_filter("metadata", operator, key, value)
            }
            name => compare(&quote_ident(name), &field.field_type, operator, value),
        }
    }
}

/// Match an address against jsonb address arrays.
fn addresses_filter(columns: &[&str], operator: Operator, value: &Value) -> StorageResult<Fragment> {
    let parts = columns
        .iter()
        .map(|column| match operator {
            Operator::Match => Ok(Fragment::new(format!("{column} @> ?::jsonb")).bind(json!([value]))),
            Operator::Like => Ok(Fragment::new(format!(
                "exists (select 1 from jsonb_array_elements_text({column}) address where address like ?)"
            ))
            .bind(value.as_str().unwrap_or_default())),
            other => Err(StorageError::invalid_query(format!(
                "operator '{}' is not supported on addresses",
                other.as_str()
            ))),
        })
        .collect::<StorageResult<Vec<_>>>()?;
    Ok(Fragment::or(parts))
}

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub reference: Option<String>,
    pub postings: Value,
    pub metadata: Value,
    pub reverted_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransactionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            timestamp: row.try_get("timestamp")?,
            reference: row.try_get("reference")?,
            postings: row.try_get("postings")?,
            metadata: row.try_get("metadata")?,
            reverted_at: row.try_get("reverted_at")?,
            inserted_at: row.try_get("inserted_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Paginable for TransactionRow {
    const PAGINATION_COLUMNS: &'static [(&'static str, PaginationAccessor<Self>)] = &[
        ("id", by_id),
        ("timestamp", by_timestamp),
        ("inserted_at", by_inserted_at),
        ("updated_at", by_updated_at),
    ];
}

fn by_id(row: &TransactionRow) -> BigInt {
    BigInt::from(row.id)
}

fn by_timestamp(row: &TransactionRow) -> BigInt {
    micros(&row.timestamp)
}

fn by_inserted_at(row: &TransactionRow) -> BigInt {
    micros(&row.inserted_at)
}

fn by_updated_at(row: &TransactionRow) -> BigInt {
    micros(&row.updated_at)
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StorageError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let id = u64::try_from(row.id)
            .map_err(|_| StorageError::MalformedRow(format!("negative transaction id {}", row.id)))?;
        let postings: Vec<Posting> = serde_json::from_value(row.postings)
            .map_err(|e| StorageError::MalformedRow(format!("transaction {id} postings: {e}")))?;

        Ok(Transaction {
            id: Some(id),
            postings,
            metadata: metadata_from(row.metadata)?,
            timestamp: row.timestamp,
            reference: row.reference,
            reverted_at: row.reverted_at,
            inserted_at: Some(row.inserted_at),
            updated_at: Some(row.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::QueryExpr;
    use crate::query::resource::build_filtered_dataset;
    use crate::sql::SqlValue;
    use ledgerflow_core::Configuration;

    fn handler() -> TransactionsHandler {
        TransactionsHandler::new(Ledger::new("main", Configuration::default()).unwrap())
    }

    #[test]
    fn dataset_is_scoped_to_the_ledger() {
        let (sql, args) = build_filtered_dataset(&handler(), &ResourceQuery::default())
            .unwrap()
            .to_sql();
        assert!(sql.contains("from \"_default\".\"transactions\" where ledger = $1"));
        assert_eq!(args, vec![SqlValue::Text("main".into())]);
    }

    #[test]
    fn point_in_time_hides_later_reverts() {
        let pit = Utc::now();
        let (sql, args) = build_filtered_dataset(&handler(), &ResourceQuery::default().with_pit(pit))
            .unwrap()
            .to_sql();
        assert!(sql.contains("case when reverted_at <= $1 then reverted_at end as reverted_at"));
        assert!(sql.contains("timestamp <= $3"));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn account_filter_checks_both_sides() {
        let query = ResourceQuery::default().with_filter(QueryExpr::matches("account", "users:001"));
        let (sql, args) = build_filtered_dataset(&handler(), &query).unwrap().to_sql();
        assert!(sql.ends_with("dataset where (sources @> $2::jsonb) or (destinations @> $3::jsonb)"));
        assert_eq!(args[1], SqlValue::Json(json!(["users:001"])));
    }

    #[test]
    fn typed_filters() {
        let query = ResourceQuery::default().with_filter(QueryExpr::and(vec![
            QueryExpr::leaf(Operator::Gte, "id", 10),
            QueryExpr::matches("reverted", false),
            QueryExpr::matches("metadata[order]", "42"),
        ]));
        let (sql, _) = build_filtered_dataset(&handler(), &query).unwrap().to_sql();
        assert!(sql.ends_with(
            "dataset where (\"id\" >= $2::numeric) and (reverted_at is null) and (metadata @> $3::jsonb)"
        ));
    }

    #[test]
    fn unsupported_operator_is_rejected() {
        let query = ResourceQuery::default().with_filter(QueryExpr::leaf(Operator::Gt, "reference", "a"));
        let err = build_filtered_dataset(&handler(), &query).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
    }

    #[test]
    fn rows_map_to_transactions() {
        let now = Utc::now();
        let row = TransactionRow {
            id: 7,
            timestamp: now,
            reference: Some("ref".into()),
            postings: json!([{"source": "world", "destination": "bank", "amount": "100", "asset": "USD"}]),
            metadata: json!({"k": "v"}),
            reverted_at: None,
            inserted_at: now,
            updated_at: now,
        };
        assert_eq!(row.pagination_id("id"), Some(BigInt::from(7)));

        let tx = Transaction::try_from(row).unwrap();
        assert_eq!(tx.id, Some(7));
        assert_eq!(tx.postings[0].amount, BigInt::from(100));
        assert_eq!(tx.metadata["k"], "v");
    }
}
