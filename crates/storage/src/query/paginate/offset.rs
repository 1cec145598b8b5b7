//! Offset pagination, used for columns without a seekable order.

use serde::Serialize;

use super::{Cursor, OffsetPaginatedQuery, encode_link};
use crate::error::{StorageError, StorageResult};
use crate::sql::{SelectQuery, quote_ident};

/// Largest offset Postgres accepts (`bigint`).
const MAX_OFFSET: u64 = i64::MAX as u64;

/// `(offset, limit)` to fetch; the limit includes one look-ahead row.
pub fn window<O>(query: &OffsetPaginatedQuery<O>) -> StorageResult<(u64, u64)> {
    if query.offset > MAX_OFFSET {
        return Err(StorageError::Overflow(format!(
            "offset {} exceeds {MAX_OFFSET}",
            query.offset
        )));
    }
    Ok((query.offset, query.initial.effective_page_size() + 1))
}

pub(crate) fn paginate<O>(
    dataset: SelectQuery,
    query: &OffsetPaginatedQuery<O>,
) -> StorageResult<SelectQuery> {
    let (offset, limit) = window(query)?;
    let order = format!(
        "{} {}",
        quote_ident(&query.initial.column),
        query.initial.order().sql()
    );
    Ok(dataset
        .also_column(format!("row_number() over (order by {order}) as row_number"))
        .order_by(order)
        .offset(offset)
        .limit(limit))
}

/// Trim the look-ahead row and link the neighbouring pages.
pub fn build_cursor<R, O>(mut rows: Vec<R>, query: &OffsetPaginatedQuery<O>) -> StorageResult<Cursor<R>>
where
    O: Clone + Serialize,
{
    let page_size = query.initial.effective_page_size();
    let has_more = rows.len() as u64 > page_size;
    if has_more {
        rows.truncate(page_size as usize);
    }

    let previous = (query.offset > 0).then(|| OffsetPaginatedQuery {
        initial: query.initial.clone(),
        offset: query.offset.saturating_sub(page_size),
    });

    let next = if has_more {
        let offset = query
            .offset
            .checked_add(page_size)
            .filter(|offset| *offset <= MAX_OFFSET)
            .ok_or_else(|| {
                StorageError::Overflow(format!("next offset after {} overflows", query.offset))
            })?;
        Some(OffsetPaginatedQuery {
            initial: query.initial.clone(),
            offset,
        })
    } else {
        None
    };

    Ok(Cursor {
        page_size,
        has_more,
        previous: encode_link(previous)?,
        next: encode_link(next)?,
        data: rows,
    })
}
