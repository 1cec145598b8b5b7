use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use ledgerflow_core::{Account, Ledger, VolumesByAsset};
use num_bigint::BigInt;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use super::{compare, metadata_filter, metadata_from, sub_key, table, typed_value};
use crate::error::{StorageError, StorageResult};
use crate::query::paginate::micros;
use crate::query::{
    DatasetContext, EntitySchema, Field, FieldType, JoinCondition, Operator, Order, Paginable,
    PaginationAccessor, RepositoryHandler, ResourceQuery,
};
use crate::sql::{Fragment, SelectQuery, quote_ident};

static SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| {
    EntitySchema::new(vec![
        Field::new("address", FieldType::String).paginated(),
        Field::new("first_usage", FieldType::Date).paginated(),
        Field::new("insertion_date", FieldType::Date)
            .with_aliases(&["inserted_at"])
            .paginated(),
        Field::new("updated_at", FieldType::Date).paginated(),
        Field::new("metadata", FieldType::map_of(FieldType::String)),
        Field::new("balance", FieldType::map_of(FieldType::Numeric)),
    ])
});

/// Accounts of one ledger. Supports the `volumes` expansion.
#[derive(Debug, Clone)]
pub struct AccountsHandler {
    ledger: Ledger,
}

impl AccountsHandler {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    fn volumes_table(&self) -> String {
        table(self.ledger.bucket(), "accounts_volumes")
    }
}

impl RepositoryHandler for AccountsHandler {
    type Options = ();
    type Row = AccountRow;
    type Resource = Account;

    fn schema(&self) -> &EntitySchema {
        &SCHEMA
    }

    fn default_pagination(&self) -> (&'static str, Order) {
        ("address", Order::Asc)
    }

    fn build_dataset(&self, ctx: DatasetContext<'_, ()>) -> StorageResult<SelectQuery> {
        let mut dataset = SelectQuery::from_table(table(self.ledger.bucket(), "accounts"))
            .columns(["address", "metadata", "first_usage", "insertion_date", "updated_at"])
            .and_where(Fragment::new("ledger = ?").bind(self.ledger.name.as_str()));

        if let Some(pit) = ctx.query.pit {
            dataset = dataset.and_where(Fragment::new("first_usage <= ?").bind(pit));
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
        let key = sub_key(property).unwrap_or_default();

        match field.name.as_str() {
            "metadata" => metadata_filter("metadata", operator, key, value),
            "balance" => {
                let op = operator.sql().ok_or_else(|| {
                    StorageError::invalid_query("balance filters need a comparison operator")
                })?;
                Ok(Fragment::new(format!(
                    "(select v.input - v.output from {} v \
                     where v.ledger = ? and v.accounts_address = dataset.address and v.asset = ?) \
                     {op} ?::numeric",
                    self.volumes_table()
                ))
                .bind(self.ledger.name.as_str())
                .bind(key)
                .bind(typed_value(&FieldType::Numeric, value)?))
            }
            name => compare(&quote_ident(name), &field.field_type, operator, value),
        }
    }

    fn expand(
        &self,
        _query: &ResourceQuery<()>,
        property: &str,
    ) -> StorageResult<Option<(SelectQuery, JoinCondition)>> {
        if property != "volumes" {
            return Ok(None);
        }
        let select = SelectQuery::from_table(self.volumes_table())
            .columns([
                "accounts_address",
                "jsonb_object_agg(asset, jsonb_build_object('input', input::text, 'output', output::text)) as volumes",
            ])
            .and_where(Fragment::new("ledger = ?").bind(self.ledger.name.as_str()))
            .group_by("accounts_address");
        Ok(Some((select, JoinCondition::new("address", "accounts_address"))))
    }
}

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub address: String,
    pub metadata: Value,
    pub first_usage: DateTime<Utc>,
    pub insertion_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub volumes: Option<Value>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let volumes = match row.try_get("volumes") {
            Ok(volumes) => volumes,
            Err(sqlx::Error::ColumnNotFound(_)) => None,
            Err(err) => return Err(err),
        };
        Ok(Self {
            address: row.try_get("address")?,
            metadata: row.try_get("metadata")?,
            first_usage: row.try_get("first_usage")?,
            insertion_date: row.try_get("insertion_date")?,
            updated_at: row.try_get("updated_at")?,
            volumes,
        })
    }
}

fn by_first_usage(row: &AccountRow) -> BigInt {
    micros(&row.first_usage)
}

fn by_insertion_date(row: &AccountRow) -> BigInt {
    micros(&row.insertion_date)
}

fn by_updated_at(row: &AccountRow) -> BigInt {
    micros(&row.updated_at)
}

impl Paginable for AccountRow {
    const PAGINATION_COLUMNS: &'static [(&'static str, PaginationAccessor<Self>)] = &[
        ("first_usage", by_first_usage),
        ("insertion_date", by_insertion_date),
        ("updated_at", by_updated_at),
    ];
}

impl TryFrom<AccountRow> for Account {
    type Error = StorageError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let volumes = row
            .volumes
            .filter(|v| !v.is_null())
            .map(serde_json::from_value::<VolumesByAsset>)
            .transpose()
            .map_err(|e| StorageError::MalformedRow(format!("account {} volumes: {e}", row.address)))?;

        Ok(Account {
            metadata: metadata_from(row.metadata)?,
            address: row.address,
            first_usage: row.first_usage,
            insertion_date: row.insertion_date,
            updated_at: row.updated_at,
            volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::resource::{build_filtered_dataset, expand};
    use crate::query::{Order, QueryExpr};
    use crate::sql::SqlValue;
    use ledgerflow_core::Configuration;
    use serde_json::json;

    fn handler() -> AccountsHandler {
        let configuration = Configuration::default().with_bucket("payments");
        AccountsHandler::new(Ledger::new("eu", configuration).unwrap())
    }

    #[test]
    fn default_listing_is_by_address() {
        assert_eq!(handler().default_pagination(), ("address", Order::Asc));
        let (field, strategy) = SCHEMA.pagination_strategy("inserted_at").unwrap();
        assert_eq!(field.name, "insertion_date");
        assert_eq!(strategy, crate::query::PaginationStrategy::Column);
    }

    #[test]
    fn balance_filter_reads_volumes() {
        let query = ResourceQuery::default()
            .with_filter(QueryExpr::leaf(Operator::Lt, "balance[USD/2]", 0));
        let (sql, args) = build_filtered_dataset(&handler(), &query).unwrap().to_sql();
        assert!(sql.contains("from \"payments\".\"accounts_volumes\" v"));
        assert!(sql.ends_with("and v.asset = $3) < $4::numeric"));
        assert_eq!(args[2], SqlValue::Text("USD/2".into()));
        assert_eq!(args[3], SqlValue::Numeric(BigInt::from(0)));
    }

    #[test]
    fn volumes_expansion_joins_on_address() {
        let query = ResourceQuery::default().with_expand("volumes");
        let dataset = build_filtered_dataset(&handler(), &query).unwrap();
        let (sql, _) = expand(&handler(), dataset, &query).unwrap().to_sql();
        assert!(sql.contains("group by accounts_address"));
        assert!(sql.ends_with("left join expand0 on expand0.\"accounts_address\" = dataset.\"address\""));
    }

    #[test]
    fn rows_with_volumes() {
        let now = Utc::now();
        let row = AccountRow {
            address: "bank".into(),
            metadata: Value::Null,
            first_usage: now,
            insertion_date: now,
            updated_at: now,
            volumes: Some(json!({"USD": {"input": "100", "output": "30"}})),
        };
        let account = Account::try_from(row).unwrap();
        let volumes = account.volumes.unwrap();
        assert_eq!(volumes["USD"].balance(), BigInt::from(70));
        assert!(account.metadata.is_empty());
    }
}
