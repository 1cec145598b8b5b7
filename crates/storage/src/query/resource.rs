//! Generic resource repository.
//!
//! A [`RepositoryHandler`] describes one resource kind: its schema, the base
//! dataset, how filter leaves become SQL, its projection and the expansions
//! it can join in. [`ResourceRepository`] runs the shared pipeline on top:
//!
//! 1. validate the filter against the schema,
//! 2. build the dataset and wrap it as `(<dataset>) dataset`,
//! 3. apply the filter as a WHERE clause and project,
//! 4. paginate (when listing),
//! 5. join the requested expansions as `expand<i>` CTEs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};
use tracing::{Span, instrument};

use super::expr::{Operator, QueryExpr};
use super::filter::{ValidatedFilters, validate_filters};
use super::paginate::{
    ColumnPaginatedQuery, Cursor, InitialPaginatedQuery, OffsetPaginatedQuery, Order, Paginable,
    PaginatedQuery, column, offset,
};
use super::schema::{EntitySchema, PaginationStrategy};
use crate::error::{ResultExt, StorageError, StorageResult};
use crate::sql::{Fragment, SelectQuery, fetch_all, fetch_count, quote_ident};

/// Filtering, time bounds and expansions for one resource request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize",
    deserialize = "O: DeserializeOwned + Default"
))]
pub struct ResourceQuery<O> {
    /// Point in time: only consider state as of this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pit: Option<DateTime<Utc>>,
    /// Out of time: only consider state after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oot: Option<DateTime<Utc>>,
    #[serde(rename = "qb", default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<QueryExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<String>,
    #[serde(default)]
    pub opts: O,
}

impl<O: Default> Default for ResourceQuery<O> {
    fn default() -> Self {
        Self::new(O::default())
    }
}

impl<O> ResourceQuery<O> {
    pub fn new(opts: O) -> Self {
        Self {
            pit: None,
            oot: None,
            builder: None,
            expand: Vec::new(),
            opts,
        }
    }

    pub fn with_filter(mut self, expr: QueryExpr) -> Self {
        self.builder = Some(expr);
        self
    }

    pub fn with_pit(mut self, pit: DateTime<Utc>) -> Self {
        self.pit = Some(pit);
        self
    }

    pub fn with_expand(mut self, name: impl Into<String>) -> Self {
        self.expand.push(name.into());
        self
    }

    pub fn expands(&self, name: &str) -> bool {
        self.expand.iter().any(|e| e == name)
    }
}

/// Columns an expansion is joined on: `expand<i>.<right> = dataset.<left>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCondition {
    pub left: String,
    pub right: String,
}

impl JoinCondition {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }
}

/// Inputs handed to [`RepositoryHandler::build_dataset`].
pub struct DatasetContext<'a, O> {
    pub query: &'a ResourceQuery<O>,
    pub filters: &'a ValidatedFilters,
}

/// Resource-specific parts of the query pipeline.
pub trait RepositoryHandler: Send + Sync {
    type Options: Clone + Default + Send + Sync + Serialize + DeserializeOwned;
    type Row: for<'r> FromRow<'r, PgRow> + Paginable + Send + Unpin;
    type Resource: TryFrom<Self::Row, Error = StorageError> + Send;

    fn schema(&self) -> &EntitySchema;

    /// Column and order used when a listing does not name one.
    fn default_pagination(&self) -> (&'static str, Order);

    fn build_dataset(&self, ctx: DatasetContext<'_, Self::Options>) -> StorageResult<SelectQuery>;

    /// Turn one validated filter leaf into a predicate over the dataset.
    fn resolve_filter(
        &self,
        query: &ResourceQuery<Self::Options>,
        operator: Operator,
        property: &str,
        value: &Value,
    ) -> StorageResult<Fragment>;

    fn project(
        &self,
        _query: &ResourceQuery<Self::Options>,
        dataset: SelectQuery,
    ) -> StorageResult<SelectQuery> {
        Ok(dataset)
    }

    /// A select to join for expansion `property`, or `None` when the
    /// handler has nothing to add for it.
    fn expand(
        &self,
        _query: &ResourceQuery<Self::Options>,
        _property: &str,
    ) -> StorageResult<Option<(SelectQuery, JoinCondition)>> {
        Ok(None)
    }
}

/// Read operations shared by every resource kind.
#[async_trait]
pub trait PaginatedResource<R, O>: Send + Sync {
    async fn get_one(&self, query: ResourceQuery<O>) -> StorageResult<R>;

    async fn count(&self, query: ResourceQuery<O>) -> StorageResult<u64>;

    async fn paginate(&self, query: PaginatedQuery<O>) -> StorageResult<Cursor<R>>;

    /// Pick the strategy from the ordering column, then paginate.
    async fn paginate_initial(&self, query: InitialPaginatedQuery<O>) -> StorageResult<Cursor<R>>;
}

/// Filtered and projected dataset, before pagination and expansion.
pub fn build_filtered_dataset<H: RepositoryHandler>(
    handler: &H,
    query: &ResourceQuery<H::Options>,
) -> StorageResult<SelectQuery> {
    let filters = validate_filters(handler.schema(), query.builder.as_ref())?;
    let dataset = handler.build_dataset(DatasetContext {
        query,
        filters: &filters,
    })?;

    let mut dataset = SelectQuery::from_subquery(dataset, "dataset");
    if let Some(expr) = &query.builder {
        let predicate = expr.build(&mut |operator, property, value| {
            handler.resolve_filter(query, operator, property, value)
        })?;
        dataset = dataset.and_where(predicate);
    }

    handler.project(query, dataset)
}

/// Wrap `dataset` as a CTE and left-join every requested expansion.
pub fn expand<H: RepositoryHandler>(
    handler: &H,
    dataset: SelectQuery,
    query: &ResourceQuery<H::Options>,
) -> StorageResult<SelectQuery> {
    let mut out = SelectQuery::from_table("dataset").with("dataset", dataset);

    let mut names = query.expand.clone();
    names.sort();

    for (i, name) in names.iter().enumerate() {
        let Some((select, join)) = handler.expand(query, name)? else {
            continue;
        };
        let cte = format!("expand{i}");
        out = out.with(cte.clone(), select).join(format!(
            "left join {cte} on {cte}.{} = dataset.{}",
            quote_ident(&join.right),
            quote_ident(&join.left)
        ));
    }

    Ok(out)
}

/// Fill resource defaults into a listing request and check its column.
pub fn normalize<H: RepositoryHandler>(
    handler: &H,
    mut query: PaginatedQuery<H::Options>,
) -> StorageResult<(PaginatedQuery<H::Options>, PaginationStrategy)> {
    let (default_column, default_order) = handler.default_pagination();
    let initial = query.initial_mut();
    if initial.column.is_empty() {
        initial.column = default_column.to_string();
    }
    if initial.order.is_none() {
        initial.order = Some(default_order);
    }

    let (field, strategy) = handler.schema().pagination_strategy(&initial.column)?;
    initial.column = field.name.clone();

    let matches = matches!(
        (&query, strategy),
        (PaginatedQuery::Offset(_), PaginationStrategy::Offset)
            | (PaginatedQuery::Column(_), PaginationStrategy::Column)
    );
    if !matches {
        return Err(StorageError::invalid_cursor(format!(
            "cursor strategy does not match column '{}'",
            query.initial().column
        )));
    }
    Ok((query, strategy))
}

/// Bind an initial request to the strategy its column calls for.
pub fn resolve_initial<H: RepositoryHandler>(
    handler: &H,
    query: InitialPaginatedQuery<H::Options>,
) -> StorageResult<PaginatedQuery<H::Options>> {
    let column = if query.column.is_empty() {
        handler.default_pagination().0
    } else {
        query.column.as_str()
    };
    let (_, strategy) = handler.schema().pagination_strategy(column)?;
    Ok(match strategy {
        PaginationStrategy::Offset => PaginatedQuery::Offset(OffsetPaginatedQuery::new(query)),
        PaginationStrategy::Column => PaginatedQuery::Column(ColumnPaginatedQuery::new(query)),
    })
}

/// The full page select: filtered dataset, pagination window, expansions,
/// ordered by `row_number`. `query` must be normalized.
pub fn build_page_query<H: RepositoryHandler>(
    handler: &H,
    query: &PaginatedQuery<H::Options>,
) -> StorageResult<SelectQuery> {
    let options = &query.initial().options;
    let dataset =
        build_filtered_dataset(handler, options).context("building filtered dataset")?;

    let dataset = match query {
        PaginatedQuery::Offset(q) => offset::paginate(dataset, q),
        PaginatedQuery::Column(q) => {
            let (field, _) = handler.schema().pagination_strategy(&q.initial.column)?;
            column::paginate(dataset, q, &field.field_type)
        }
    }
    .context("paginating request")?;

    let dataset = expand(handler, dataset, options).context("expanding results")?;
    Ok(dataset.order_by("row_number"))
}

/// Postgres-backed [`PaginatedResource`] for one handler.
#[derive(Debug, Clone)]
pub struct ResourceRepository<H> {
    pool: Arc<PgPool>,
    handler: H,
}

impl<H: RepositoryHandler> ResourceRepository<H> {
    pub fn new(pool: Arc<PgPool>, handler: H) -> Self {
        Self { pool, handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H> PaginatedResource<H::Resource, H::Options> for ResourceRepository<H>
where
    H: RepositoryHandler,
{
    #[instrument(skip(self, query), err)]
    async fn get_one(&self, query: ResourceQuery<H::Options>) -> StorageResult<H::Resource> {
        let dataset = build_filtered_dataset(&self.handler, &query)?;
        let select = expand(&self.handler, dataset, &query)?.limit(1);

        let mut rows: Vec<H::Row> = fetch_all(&*self.pool, &select, "get_one").await?;
        match rows.pop() {
            Some(row) => <H::Resource as TryFrom<H::Row>>::try_from(row),
            None => Err(StorageError::NotFound),
        }
    }

    #[instrument(skip(self, query), err)]
    async fn count(&self, query: ResourceQuery<H::Options>) -> StorageResult<u64> {
        let dataset = build_filtered_dataset(&self.handler, &query)?;
        fetch_count(&*self.pool, dataset, "count").await
    }

    #[instrument(skip(self, query), fields(row_count = tracing::field::Empty), err)]
    async fn paginate(
        &self,
        query: PaginatedQuery<H::Options>,
    ) -> StorageResult<Cursor<H::Resource>> {
        let (query, _) = normalize(&self.handler, query)?;
        let select = build_page_query(&self.handler, &query)?;

        let rows: Vec<H::Row> = fetch_all(&*self.pool, &select, "paginate")
            .await
            .context("scanning results")?;
        Span::current().record("row_count", rows.len());

        let cursor = match &query {
            PaginatedQuery::Offset(q) => offset::build_cursor(rows, q)?,
            PaginatedQuery::Column(q) => column::build_cursor(rows, q)?,
        };
        cursor.try_map(<H::Resource as TryFrom<H::Row>>::try_from)
    }

    async fn paginate_initial(
        &self,
        query: InitialPaginatedQuery<H::Options>,
    ) -> StorageResult<Cursor<H::Resource>> {
        let query = resolve_initial(&self.handler, query)?;
        self.paginate(query).await
    }
}
