//! Ledger-scoped storage: the transactional store behind the controllers and
//! the read-side resource handlers.

pub mod in_memory;
pub mod postgres;
pub mod resources;
pub mod store;

pub use in_memory::{InMemoryLedgerStore, InMemoryLedgerTx};
pub use postgres::{LOCK_CLASS, PostgresLedgerStore, PostgresLedgerTx};
pub use store::{LedgerStore, LedgerTx};
