//! Column (seek) pagination.
//!
//! Pages are selected by comparing the ordering column against a bookmark,
//! the pagination id carried in the cursor. Going backwards flips both the
//! comparison and the sort, then restores the listing order in memory.
//!
//! | order | forward | reverse |
//! |-------|---------|---------|
//! | asc   | `>=`    | `<`     |
//! | desc  | `<=`    | `>`     |
//!
//! A forward bookmark is the first row of the page it opens (inclusive
//! comparison); a reverse bookmark is the first row of the page it comes
//! from (strict comparison).

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::Serialize;

use super::{ColumnPaginatedQuery, Cursor, Order, Paginable, encode_link};
use crate::error::{StorageError, StorageResult};
use crate::query::schema::FieldType;
use crate::sql::{Fragment, SelectQuery, SqlValue, quote_ident};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Gt,
    Lte,
    Gte,
}

impl Comparison {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Gte => ">=",
        }
    }

    /// Whether `value <op> bound` holds.
    pub fn holds(self, value: &BigInt, bound: &BigInt) -> bool {
        match self {
            Self::Lt => value < bound,
            Self::Gt => value > bound,
            Self::Lte => value <= bound,
            Self::Gte => value >= bound,
        }
    }
}

/// Comparison applied between the ordering column and the bookmark.
pub fn seek_operator(order: Order, reverse: bool) -> Comparison {
    match (order, reverse) {
        (Order::Asc, false) => Comparison::Gte,
        (Order::Asc, true) => Comparison::Lt,
        (Order::Desc, false) => Comparison::Lte,
        (Order::Desc, true) => Comparison::Gt,
    }
}

/// What a column query fetches, independent of SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekWindow {
    /// Sort applied when fetching (inverted for reverse queries).
    pub order: Order,
    pub bound: Option<(Comparison, BigInt)>,
    /// Page size plus one look-ahead row.
    pub limit: u64,
}

pub fn window<O>(query: &ColumnPaginatedQuery<O>) -> SeekWindow {
    let order = query.initial.order();
    SeekWindow {
        order: if query.reverse { order.reverse() } else { order },
        bound: query
            .pagination_id
            .clone()
            .map(|id| (seek_operator(order, query.reverse), id)),
        limit: query.initial.effective_page_size() + 1,
    }
}

pub(crate) fn paginate<O>(
    dataset: SelectQuery,
    query: &ColumnPaginatedQuery<O>,
    field_type: &FieldType,
) -> StorageResult<SelectQuery> {
    let window = window(query);
    let column = quote_ident(&query.initial.column);
    let order = format!("{column} {}", window.order.sql());

    let mut dataset = dataset
        .also_column(format!("row_number() over (order by {order}) as row_number"))
        .order_by(order)
        .limit(window.limit);

    if let Some((comparison, id)) = window.bound {
        let predicate = match field_type {
            FieldType::Date => Fragment::new(format!("{column} {} ?", comparison.sql()))
                .bind(timestamp_bound(&id)?),
            FieldType::Numeric => Fragment::new(format!("{column} {} ?::numeric", comparison.sql()))
                .bind(SqlValue::Numeric(id)),
            _ => return Err(StorageError::NotPaginatedField(query.initial.column.clone())),
        };
        dataset = dataset.and_where(predicate);
    }

    Ok(dataset)
}

fn timestamp_bound(micros: &BigInt) -> StorageResult<SqlValue> {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(SqlValue::Timestamp)
        .ok_or_else(|| StorageError::invalid_cursor(format!("pagination id {micros} is not a timestamp")))
}

/// Trim the look-ahead row, restore listing order and link the neighbouring pages.
pub fn build_cursor<R, O>(mut rows: Vec<R>, query: &ColumnPaginatedQuery<O>) -> StorageResult<Cursor<R>>
where
    R: Paginable,
    O: Clone + Serialize,
{
    let page_size = query.initial.effective_page_size();
    let column = &query.initial.column;
    let ids = rows
        .iter()
        .map(|row| {
            row.pagination_id(column)
                .ok_or_else(|| StorageError::NotPaginatedField(column.clone()))
        })
        .collect::<StorageResult<Vec<_>>>()?;

    let links = Links::compute(query, &ids, page_size);

    if links.has_more {
        rows.truncate(page_size as usize);
    }
    if query.reverse {
        rows.reverse();
    }

    Ok(Cursor {
        page_size,
        has_more: links.has_more,
        previous: encode_link(links.previous)?,
        next: encode_link(links.next)?,
        data: rows,
    })
}

struct Links<O> {
    has_more: bool,
    previous: Option<ColumnPaginatedQuery<O>>,
    next: Option<ColumnPaginatedQuery<O>>,
}

impl<O: Clone> Links<O> {
    /// `ids` are the pagination ids of the fetched rows, in fetch order.
    fn compute(query: &ColumnPaginatedQuery<O>, ids: &[BigInt], page_size: u64) -> Self {
        let page_size = page_size as usize;
        let has_more = ids.len() > page_size;
        let bottom = query.bottom.clone().or_else(|| ids.first().cloned());
        let link = |pagination_id: Option<BigInt>, reverse: bool| ColumnPaginatedQuery {
            initial: query.initial.clone(),
            pagination_id,
            bottom: bottom.clone(),
            reverse,
        };

        if query.reverse {
            // Fetched backwards: the row before the look-ahead row opens this page.
            let previous = has_more.then(|| link(ids.get(page_size - 1).cloned(), true));
            let next = Some(link(query.pagination_id.clone(), false));
            return Self {
                has_more,
                previous,
                next,
            };
        }

        let next = has_more.then(|| link(ids.get(page_size).cloned(), false));
        let previous = match (&query.pagination_id, &bottom) {
            (Some(current), Some(bottom)) if is_past(query.initial.order(), current, bottom) => {
                let first = ids.first().unwrap_or(current).clone();
                Some(link(Some(first), true))
            }
            _ => None,
        };

        Self {
            has_more,
            previous,
            next,
        }
    }
}

/// Whether `current` lies strictly after `bottom` in listing order.
fn is_past(order: Order, current: &BigInt, bottom: &BigInt) -> bool {
    match order {
        Order::Asc => current > bottom,
        Order::Desc => current < bottom,
    }
}
