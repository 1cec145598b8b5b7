//! `ledgerflow-core`: ledger domain primitives.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! ledgers and their lifecycle state, postings, transactions, accounts,
//! volumes and the audit log.

pub mod account;
pub mod bigint;
pub mod error;
pub mod ledger;
pub mod log;
pub mod metadata;
pub mod transaction;

pub use account::{Account, AccountVolumes, Volumes, VolumesByAsset};
pub use error::{DomainError, DomainResult};
pub use ledger::{
    Configuration, DEFAULT_BUCKET, FEATURE_DISABLED, FEATURE_ENABLED_SYNC, FEATURE_HASH_LOGS,
    Ledger, LedgerState,
};
pub use log::{
    DeleteMetadataPayload, Log, LogPayload, LogType, MetadataTarget, NewTransactionPayload,
    RevertedTransactionPayload, SetMetadataPayload, idempotency_hash,
};
pub use metadata::{AccountMetadata, Metadata};
pub use transaction::{Posting, Transaction, WORLD};
