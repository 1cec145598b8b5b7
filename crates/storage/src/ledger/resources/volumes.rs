//! Aggregated volumes per (account, asset).
//!
//! Without time bounds the running totals in `accounts_volumes` are read as
//! is. With a point in time (or out of time bound) the totals are rebuilt
//! from transaction postings, dated by transaction timestamp or, with
//! `use_insertion_date`, by insertion date.
//!
//! `group_level` folds addresses onto their first N `:`-separated segments,
//! so `users:001` and `users:002` report together as `users` at level 1.

use std::sync::LazyLock;

use ledgerflow_core::{AccountVolumes, Ledger, Volumes};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use super::{compare, metadata_filter, sub_key, table};
use crate::error::{StorageError, StorageResult};
use crate::query::{
    DatasetContext, EntitySchema, Field, FieldType, Operator, Order, Paginable,
    PaginationAccessor, RepositoryHandler, ResourceQuery,
};
use crate::sql::{Fragment, SelectQuery, quote_ident};

static SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| {
    EntitySchema::new(vec![
        Field::new("account", FieldType::String)
            .with_aliases(&["address"])
            .paginated(),
        Field::new("asset", FieldType::String),
        Field::new("input", FieldType::Numeric),
        Field::new("output", FieldType::Numeric),
        Field::new("balance", FieldType::Numeric),
        Field::new("metadata", FieldType::map_of(FieldType::String)),
    ])
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumesOptions {
    #[serde(default)]
    pub use_insertion_date: bool,
    #[serde(default, rename = "groupLvl")]
    pub group_level: usize,
}

#[derive(Debug, Clone)]
pub struct VolumesHandler {
    ledger: Ledger,
}

impl VolumesHandler {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    fn running_totals(&self) -> SelectQuery {
        SelectQuery::from_table(table(self.ledger.bucket(), "accounts_volumes"))
            .columns(["accounts_address as account", "asset", "input", "output"])
            .and_where(Fragment::new("ledger = ?").bind(self.ledger.name.as_str()))
    }

    fn postings_side(&self, query: &ResourceQuery<VolumesOptions>, side: &str, incoming: bool) -> SelectQuery {
        let date = if query.opts.use_insertion_date {
            "t.inserted_at"
        } else {
            "t.timestamp"
        };
        let (input, output) = if incoming {
            ("(p ->> 'amount')::numeric", "0::numeric")
        } else {
            ("0::numeric", "(p ->> 'amount')::numeric")
        };

        let mut select = SelectQuery::from_table(format!(
            "{} t, jsonb_array_elements(t.postings) p",
            table(self.ledger.bucket(), "transactions")
        ))
        .columns([
            format!("p ->> '{side}' as account"),
            "p ->> 'asset' as asset".to_string(),
            format!("{input} as input"),
            format!("{output} as output"),
        ])
        .and_where(Fragment::new("t.ledger = ?").bind(self.ledger.name.as_str()));

        if let Some(pit) = query.pit {
            select = select.and_where(Fragment::new(format!("{date} <= ?")).bind(pit));
        }
        if let Some(oot) = query.oot {
            select = select.and_where(Fragment::new(format!("{date} >= ?")).bind(oot));
        }
        select
    }
}

fn grouped_account(group_level: usize) -> String {
    match group_level {
        0 => "account".to_string(),
        n => format!("array_to_string((string_to_array(account, ':'))[1:{n}], ':')"),
    }
}

impl RepositoryHandler for VolumesHandler {
    type Options = VolumesOptions;
    type Row = VolumesRow;
    type Resource = AccountVolumes;

    fn schema(&self) -> &EntitySchema {
        &SCHEMA
    }

    fn default_pagination(&self) -> (&'static str, Order) {
        ("account", Order::Asc)
    }

    fn build_dataset(&self, ctx: DatasetContext<'_, VolumesOptions>) -> StorageResult<SelectQuery> {
        let query = ctx.query;
        let moves = if query.pit.is_none() && query.oot.is_none() {
            self.running_totals()
        } else {
            // Two selects unioned: rendered through a CTE pair so the
            // placeholders keep their order.
            SelectQuery::from_table("incoming union all select * from outgoing")
                .with("incoming", self.postings_side(query, "destination", true))
                .with("outgoing", self.postings_side(query, "source", false))
        };

        Ok(SelectQuery::from_subquery(moves, "moves")
            .columns([
                format!("{} as account", grouped_account(query.opts.group_level)),
                "asset".to_string(),
                "sum(input) as input".to_string(),
                "sum(output) as output".to_string(),
                "sum(input) - sum(output) as balance".to_string(),
            ])
            .group_by("1")
            .group_by("asset"))
    }

    fn resolve_filter(
        &self,
        _query: &ResourceQuery<VolumesOptions>,
        operator: Operator,
        property: &str,
        value: &Value,
    ) -> StorageResult<Fragment> {
        let field = SCHEMA
            .resolve_key(property)
            .map(|(field, _)| field)
            .ok_or_else(|| StorageError::invalid_query(format!("unknown key '{property}'")))?;

        if field.name != "metadata" {
            return compare(&quote_ident(&field.name), &field.field_type, operator, value);
        }

        let key = sub_key(property).unwrap_or_default();
        let inner = metadata_filter("a.metadata", operator, key, value)?;
        let fragment = Fragment::new(format!(
            "exists (select 1 from {} a where a.ledger = ? and a.address = dataset.account and {})",
            table(self.ledger.bucket(), "accounts"),
            inner.sql()
        ))
        .bind(self.ledger.name.as_str());
        Ok(inner.args().iter().cloned().fold(fragment, Fragment::bind))
    }

    fn project(
        &self,
        _query: &ResourceQuery<VolumesOptions>,
        dataset: SelectQuery,
    ) -> StorageResult<SelectQuery> {
        Ok(dataset.columns([
            "account",
            "asset",
            "input::text as input",
            "output::text as output",
        ]))
    }
}

#[derive(Debug, Clone)]
pub struct VolumesRow {
    pub account: String,
    pub asset: String,
    pub input: String,
    pub output: String,
}

impl<'r> FromRow<'r, PgRow> for VolumesRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            account: row.try_get("account")?,
            asset: row.try_get("asset")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
        })
    }
}

impl Paginable for VolumesRow {
    const PAGINATION_COLUMNS: &'static [(&'static str, PaginationAccessor<Self>)] = &[];
}

impl TryFrom<VolumesRow> for AccountVolumes {
    type Error = StorageError;

    fn try_from(row: VolumesRow) -> Result<Self, Self::Error> {
        let parse = |raw: &str| {
            raw.parse::<BigInt>().map_err(|e| {
                StorageError::MalformedRow(format!("volumes of {}/{}: {e}", row.account, row.asset))
            })
        };
        let volumes = Volumes::new(parse(&row.input)?, parse(&row.output)?);
        Ok(AccountVolumes::new(row.account, row.asset, volumes))
    }
}
