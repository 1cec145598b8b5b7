//! Inputs and results of ledger write operations.

use chrono::{DateTime, Utc};
use ledgerflow_core::{
    AccountMetadata, Log, LogPayload, LogType, Metadata, Posting, Transaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};

/// Common envelope of every write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters<T> {
    /// Run the operation and report its result without persisting anything.
    #[serde(default)]
    pub dry_run: bool,
    /// A repeated key returns the result logged the first time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub input: T,
}

impl<T> Parameters<T> {
    pub fn new(input: T) -> Self {
        Self {
            dry_run: false,
            idempotency_key: None,
            input,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransaction {
    pub postings: Vec<Posting>,
    /// Defaults to the time of the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub account_metadata: AccountMetadata,
}

impl CreateTransaction {
    pub fn new(postings: Vec<Posting>) -> Self {
        Self {
            postings,
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertTransaction {
    pub transaction_id: u64,
    /// Date the revert at the original transaction's timestamp instead of now.
    #[serde(default)]
    pub at_effective_date: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RevertTransaction {
    pub fn new(transaction_id: u64) -> Self {
        Self {
            transaction_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveTransactionMetadata {
    pub transaction_id: u64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveAccountMetadata {
    pub address: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTransactionMetadata {
    pub transaction_id: u64,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAccountMetadata {
    pub address: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedTransaction {
    pub log: Log,
    pub transaction: Transaction,
    pub account_metadata: AccountMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevertedTransaction {
    pub log: Log,
    /// The original transaction, now marked reverted.
    pub reverted: Transaction,
    /// The transaction carrying the reversed postings.
    pub revert: Transaction,
}

/// Rebuild an operation result from the log it wrote.
pub trait FromLog: Sized {
    const LOG_TYPE: LogType;

    fn from_log(log: Log) -> ControllerResult<Self>;
}

fn unexpected(log: &Log) -> ControllerError {
    ControllerError::Validation(format!(
        "idempotency key already used by a {} log",
        log.log_type()
    ))
}

impl FromLog for CreatedTransaction {
    const LOG_TYPE: LogType = LogType::NewTransaction;

    fn from_log(log: Log) -> ControllerResult<Self> {
        match &log.payload {
            LogPayload::NewTransaction(payload) => Ok(Self {
                transaction: payload.transaction.clone(),
                account_metadata: payload.account_metadata.clone(),
                log,
            }),
            _ => Err(unexpected(&log)),
        }
    }
}

impl FromLog for RevertedTransaction {
    const LOG_TYPE: LogType = LogType::RevertedTransaction;

    fn from_log(log: Log) -> ControllerResult<Self> {
        match &log.payload {
            LogPayload::RevertedTransaction(payload) => Ok(Self {
                reverted: payload.reverted_transaction.clone(),
                revert: payload.revert_transaction.clone(),
                log,
            }),
            _ => Err(unexpected(&log)),
        }
    }
}

/// Result of a metadata write: the log it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SetMetadataLog(pub Log);

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMetadataLog(pub Log);

impl FromLog for SetMetadataLog {
    const LOG_TYPE: LogType = LogType::SetMetadata;

    fn from_log(log: Log) -> ControllerResult<Self> {
        match log.payload {
            LogPayload::SetMetadata(_) => Ok(Self(log)),
            _ => Err(unexpected(&log)),
        }
    }
}

impl FromLog for DeleteMetadataLog {
    const LOG_TYPE: LogType = LogType::DeleteMetadata;

    fn from_log(log: Log) -> ControllerResult<Self> {
        match log.payload {
            LogPayload::DeleteMetadata(_) => Ok(Self(log)),
            _ => Err(unexpected(&log)),
        }
    }
}
