//! `ledgerflow-storage`: persistence and querying for ledgers.
//!
//! - [`query`]: the generic resource query engine (schemas, filters,
//!   offset and column pagination, opaque cursors);
//! - [`ledger`]: the transactional ledger store (Postgres and in-memory)
//!   and the ledger-scoped resource handlers;
//! - [`system`]: the ledger registry;
//! - [`driver`]: how controllers reach all of the above.

pub mod config;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod query;
pub mod sql;
pub mod system;

pub use config::DatabaseConfig;
pub use driver::{Driver, InMemoryDriver, PostgresDriver};
pub use error::{ErrorKind, ResultExt, StorageError, StorageResult};
pub use ledger::{InMemoryLedgerStore, LedgerStore, LedgerTx, PostgresLedgerStore};
