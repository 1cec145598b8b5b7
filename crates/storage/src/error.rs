//! Storage error model.
//!
//! ## Kinds
//!
//! Callers match on [`StorageError::kind`] rather than on variants: storage
//! operations wrap the errors they propagate with [`StorageError::Context`]
//! ("building filtered dataset: ...") and `kind()` looks through any number
//! of those layers.
//!
//! ## SQLx mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any other | `Database` |
//! | RowNotFound | N/A | `NotFound` |
//! | Other | N/A | `Database` |

use ledgerflow_core::DomainError;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Unknown filter key, disallowed operator or badly typed value.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("field '{0}' is not paginated")]
    NotPaginatedField(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A pagination offset does not fit the SQL offset range.
    #[error("offset overflow: {0}")]
    Overflow(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A stored row could not be mapped back to its domain type.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StorageError>,
    },
}

/// Coarse classification of a [`StorageError`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidQuery,
    NotPaginatedField,
    InvalidCursor,
    NotFound,
    Conflict,
    Overflow,
    Config,
    MalformedRow,
    Database,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Self::NotPaginatedField(_) => ErrorKind::NotPaginatedField,
            Self::InvalidCursor(_) => ErrorKind::InvalidCursor,
            Self::NotFound => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Config(_) => ErrorKind::Config,
            Self::MalformedRow(_) => ErrorKind::MalformedRow,
            Self::Database { .. } => ErrorKind::Database,
            Self::Context { source, .. } => source.kind(),
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn invalid_cursor(msg: impl Into<String>) -> Self {
        Self::InvalidCursor(msg.into())
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Attach operation context to a storage result.
pub trait ResultExt<T> {
    fn context(self, context: &str) -> StorageResult<T>;
}

impl<T> ResultExt<T> for StorageResult<T> {
    fn context(self, context: &str) -> StorageResult<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl From<DomainError> for StorageError {
    fn from(err: DomainError) -> Self {
        // Domain failures on the storage side only come from decoding rows.
        Self::MalformedRow(err.to_string())
    }
}

/// Map SQLx errors to StorageError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => {
                    StorageError::Conflict(format!("unique violation in {operation}: {message}"))
                }
                _ => StorageError::Database {
                    operation: operation.to_string(),
                    message,
                },
            }
        }
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::PoolClosed => StorageError::Database {
            operation: operation.to_string(),
            message: "connection pool closed".to_string(),
        },
        sqlx::Error::ColumnDecode { index, source } => {
            StorageError::MalformedRow(format!("column {index} in {operation}: {source}"))
        }
        other => StorageError::Database {
            operation: operation.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_looks_through_context_layers() {
        let err = StorageError::invalid_query("unknown key 'foo' when building query")
            .with_context("building filtered dataset")
            .with_context("paginating request");

        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        assert_eq!(
            err.to_string(),
            "paginating request: building filtered dataset: invalid query: unknown key 'foo' when building query"
        );
    }

    #[test]
    fn result_ext_wraps_errors_only() {
        let ok: StorageResult<u8> = Ok(1);
        assert_eq!(ok.context("ignored").unwrap(), 1);

        let err: StorageResult<u8> = Err(StorageError::NotFound);
        let err = err.context("scanning results").unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(map_sqlx_error("get_one", sqlx::Error::RowNotFound).is(ErrorKind::NotFound));
    }

    #[test]
    fn undecodable_domain_values_are_malformed_rows() {
        let err: StorageError = DomainError::MalformedPayload("unknown log type 'X'".into()).into();
        assert!(err.is(ErrorKind::MalformedRow));
    }
}
