//! Paginated queries and cursors.
//!
//! A listing starts as an [`InitialPaginatedQuery`]. The ordering column's
//! schema type picks the strategy: seekable columns (dates, numbers) page
//! with [`ColumnPaginatedQuery`], everything else with
//! [`OffsetPaginatedQuery`]. Continuation state travels in the opaque
//! `previous`/`next` tokens of a [`Cursor`], produced by [`codec`].

pub mod codec;
pub mod column;
pub mod offset;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};

use super::resource::ResourceQuery;
use crate::error::StorageResult;

pub use codec::{decode_cursor, encode_cursor, with_page_size_bounds};
pub use column::{Comparison, SeekWindow, seek_operator};

pub const DEFAULT_PAGE_SIZE: u64 = 15;
pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn reverse(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// The logical listing request, before a strategy is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize",
    deserialize = "O: DeserializeOwned + Default"
))]
pub struct InitialPaginatedQuery<O> {
    /// Ordering column; empty means the resource default.
    #[serde(default)]
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    /// Zero means [`DEFAULT_PAGE_SIZE`].
    #[serde(rename = "pageSize", default)]
    pub page_size: u64,
    #[serde(rename = "filters", default)]
    pub options: ResourceQuery<O>,
}

impl<O: Default> Default for InitialPaginatedQuery<O> {
    fn default() -> Self {
        Self {
            column: String::new(),
            order: None,
            page_size: 0,
            options: ResourceQuery::default(),
        }
    }
}

impl<O> InitialPaginatedQuery<O> {
    pub fn new(options: ResourceQuery<O>) -> Self {
        Self {
            column: String::new(),
            order: None,
            page_size: 0,
            options,
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn order(&self) -> Order {
        self.order.unwrap_or_default()
    }

    /// The page size actually used: zero falls back to the default and the
    /// result never exceeds [`MAX_PAGE_SIZE`].
    pub fn effective_page_size(&self) -> u64 {
        match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize",
    deserialize = "O: DeserializeOwned + Default"
))]
pub struct OffsetPaginatedQuery<O> {
    #[serde(flatten)]
    pub initial: InitialPaginatedQuery<O>,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize",
    deserialize = "O: DeserializeOwned + Default"
))]
pub struct ColumnPaginatedQuery<O> {
    #[serde(flatten)]
    pub initial: InitialPaginatedQuery<O>,
    /// Seek bookmark: the pagination id rows are compared against.
    #[serde(
        rename = "paginationID",
        default,
        skip_serializing_if = "Option::is_none",
        with = "ledgerflow_core::bigint::option_as_string"
    )]
    pub pagination_id: Option<BigInt>,
    /// Pagination id of the very first row of the listing.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "ledgerflow_core::bigint::option_as_string"
    )]
    pub bottom: Option<BigInt>,
    #[serde(default)]
    pub reverse: bool,
}

impl<O> ColumnPaginatedQuery<O> {
    pub fn new(initial: InitialPaginatedQuery<O>) -> Self {
        Self {
            initial,
            pagination_id: None,
            bottom: None,
            reverse: false,
        }
    }
}

impl<O> OffsetPaginatedQuery<O> {
    pub fn new(initial: InitialPaginatedQuery<O>) -> Self {
        Self { initial, offset: 0 }
    }
}

/// A listing request bound to a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum PaginatedQuery<O> {
    Offset(OffsetPaginatedQuery<O>),
    Column(ColumnPaginatedQuery<O>),
}

impl<O> PaginatedQuery<O> {
    pub fn initial(&self) -> &InitialPaginatedQuery<O> {
        match self {
            Self::Offset(q) => &q.initial,
            Self::Column(q) => &q.initial,
        }
    }

    pub fn initial_mut(&mut self) -> &mut InitialPaginatedQuery<O> {
        match self {
            Self::Offset(q) => &mut q.initial,
            Self::Column(q) => &mut q.initial,
        }
    }
}

impl<O: Serialize> Serialize for PaginatedQuery<O> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Offset(q) => q.serialize(serializer),
            Self::Column(q) => q.serialize(serializer),
        }
    }
}

/// One page of results with its continuation tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor<T> {
    pub page_size: u64,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub data: Vec<T>,
}

impl<T> Cursor<T> {
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Cursor<U>, E> {
        Ok(Cursor {
            page_size: self.page_size,
            has_more: self.has_more,
            previous: self.previous,
            next: self.next,
            data: self.data.into_iter().map(f).collect::<Result<_, _>>()?,
        })
    }
}

/// Column accessor used to pull pagination ids out of scanned rows.
pub type PaginationAccessor<R> = fn(&R) -> BigInt;

/// Rows that can be column-paginated.
///
/// Each row type lists, once, the seekable columns it carries and how to turn
/// their value into a pagination id.
pub trait Paginable: Sized + 'static {
    const PAGINATION_COLUMNS: &'static [(&'static str, PaginationAccessor<Self>)];

    fn pagination_id(&self, column: &str) -> Option<BigInt> {
        Self::PAGINATION_COLUMNS
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, accessor)| accessor(self))
    }
}

/// Pagination id of a timestamp column: microseconds since the Unix epoch.
pub fn micros(at: &DateTime<Utc>) -> BigInt {
    BigInt::from(at.timestamp_micros())
}

pub(crate) fn encode_link<T: Serialize>(query: Option<T>) -> StorageResult<Option<String>> {
    query.map(|q| encode_cursor(&q)).transpose()
}
