use ledgerflow_core::DomainError;
use ledgerflow_storage::{ErrorKind, StorageError};
use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Input rejected before touching storage.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transaction {0} already reverted")]
    AlreadyReverted(u64),

    #[error("reference '{0}' already used")]
    ReferenceConflict(String),

    /// An idempotency key reused with a different input.
    #[error(
        "invalid idempotency hash when using idempotency key '{key}', has computed '{computed}' but '{expected}' is stored"
    )]
    InvalidIdempotencyInput {
        key: String,
        expected: String,
        computed: String,
    },

    /// Import attempted on a ledger that is in use or not empty, or a log
    /// stream that is not a valid export.
    #[error("import error: {0}")]
    Import(String),

    /// An imported log the ledger could not apply or store.
    #[error("import error: replaying log {log_id}: {source}")]
    ImportReplay {
        log_id: u64,
        #[source]
        source: Box<ControllerError>,
    },

    /// An imported log whose hash differs from the one the ledger chained.
    /// Hashes are hex encoded; an empty `expected` means the log had none.
    #[error("invalid hash for log {log_id}: expected '{expected}', computed '{computed}'")]
    InvalidLogHash {
        log_id: u64,
        expected: String,
        computed: String,
    },

    #[error("invalid ledger configuration: {0}")]
    InvalidLedgerConfiguration(String),

    #[error("ledger '{0}' already exists")]
    LedgerAlreadyExists(String),

    #[error("ledger '{0}' not found")]
    LedgerNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ControllerError {
    pub(crate) fn import(msg: impl Into<String>) -> Self {
        Self::Import(msg.into())
    }

    /// Wrap a failure of imported log `log_id`.
    pub(crate) fn import_replay(log_id: u64) -> impl FnOnce(ControllerError) -> Self {
        move |source| Self::ImportReplay {
            log_id,
            source: Box::new(source),
        }
    }

    /// Turn a storage not-found into [`ControllerError::NotFound`] for `what`.
    pub(crate) fn not_found(what: impl Into<String>) -> impl FnOnce(StorageError) -> Self {
        let what = what.into();
        move |err| {
            if err.is(ErrorKind::NotFound) {
                Self::NotFound(what)
            } else {
                Self::Storage(err)
            }
        }
    }
}

impl From<DomainError> for ControllerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            other @ DomainError::MalformedPayload(_) => Self::Validation(other.to_string()),
        }
    }
}
