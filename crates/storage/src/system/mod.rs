//! System-level storage: the ledger registry.

pub mod ledgers;
pub mod postgres;

pub use ledgers::{LedgerRow, LedgersHandler};
pub use postgres::PostgresSystemStore;
