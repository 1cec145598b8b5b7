//! Generic resource querying: schemas, filters, pagination and cursors.

pub mod expr;
pub mod filter;
pub mod paginate;
pub mod resource;
pub mod schema;

pub use expr::{Operator, QueryExpr};
pub use filter::{ValidatedFilters, validate_filters};
pub use paginate::{
    ColumnPaginatedQuery, Cursor, DEFAULT_PAGE_SIZE, InitialPaginatedQuery, MAX_PAGE_SIZE,
    OffsetPaginatedQuery, Order, Paginable, PaginatedQuery, PaginationAccessor, decode_cursor,
    encode_cursor, with_page_size_bounds,
};
pub use resource::{
    DatasetContext, JoinCondition, PaginatedResource, RepositoryHandler, ResourceQuery,
    ResourceRepository,
};
pub use schema::{EntitySchema, Field, FieldType, PaginationStrategy};
