//! Per-ledger write controllers.

pub mod controller;
pub mod lifecycle;
pub mod params;

pub use controller::{Controller, DefaultController, ImportLogs, LedgerOperation};
pub use lifecycle::{LedgerStateCell, LedgerStateTracker};
pub use params::{
    CreateTransaction, CreatedTransaction, DeleteAccountMetadata, DeleteMetadataLog,
    DeleteTransactionMetadata, FromLog, Parameters, RevertTransaction, RevertedTransaction,
    SaveAccountMetadata, SaveTransactionMetadata, SetMetadataLog,
};
