//! The ledger audit log.
//!
//! Every mutating operation appends exactly one log. Logs are stored as a
//! `(type, data)` pair so the payload shape can evolve per type; [`Log`]
//! serializes through the same pair on the wire.
//!
//! Ledgers with the `HASH_LOGS` feature chain their logs: each log's hash is
//! the SHA-256 of the previous log's hash followed by the log itself, so an
//! exported log stream can be checked on import.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::error::{DomainError, DomainResult};
use crate::metadata::{AccountMetadata, Metadata};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    NewTransaction,
    SetMetadata,
    DeleteMetadata,
    RevertedTransaction,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewTransaction => "NEW_TRANSACTION",
            Self::SetMetadata => "SET_METADATA",
            Self::DeleteMetadata => "DELETE_METADATA",
            Self::RevertedTransaction => "REVERTED_TRANSACTION",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW_TRANSACTION" => Ok(Self::NewTransaction),
            "SET_METADATA" => Ok(Self::SetMetadata),
            "DELETE_METADATA" => Ok(Self::DeleteMetadata),
            "REVERTED_TRANSACTION" => Ok(Self::RevertedTransaction),
            other => Err(DomainError::MalformedPayload(format!("unknown log type '{other}'"))),
        }
    }
}

/// Which record a metadata log applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "targetType", content = "targetId", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataTarget {
    Transaction(u64),
    Account(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransactionPayload {
    pub transaction: Transaction,
    #[serde(default)]
    pub account_metadata: AccountMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMetadataPayload {
    #[serde(flatten)]
    pub target: MetadataTarget,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMetadataPayload {
    #[serde(flatten)]
    pub target: MetadataTarget,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertedTransactionPayload {
    pub reverted_transaction: Transaction,
    pub revert_transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    NewTransaction(NewTransactionPayload),
    SetMetadata(SetMetadataPayload),
    DeleteMetadata(DeleteMetadataPayload),
    RevertedTransaction(RevertedTransactionPayload),
}

impl LogPayload {
    pub fn log_type(&self) -> LogType {
        match self {
            Self::NewTransaction(_) => LogType::NewTransaction,
            Self::SetMetadata(_) => LogType::SetMetadata,
            Self::DeleteMetadata(_) => LogType::DeleteMetadata,
            Self::RevertedTransaction(_) => LogType::RevertedTransaction,
        }
    }

    pub fn to_data(&self) -> Result<Value, DomainError> {
        let data = match self {
            Self::NewTransaction(p) => serde_json::to_value(p)?,
            Self::SetMetadata(p) => serde_json::to_value(p)?,
            Self::DeleteMetadata(p) => serde_json::to_value(p)?,
            Self::RevertedTransaction(p) => serde_json::to_value(p)?,
        };
        Ok(data)
    }

    pub fn from_parts(log_type: LogType, data: Value) -> Result<Self, DomainError> {
        let payload = match log_type {
            LogType::NewTransaction => Self::NewTransaction(serde_json::from_value(data)?),
            LogType::SetMetadata => Self::SetMetadata(serde_json::from_value(data)?),
            LogType::DeleteMetadata => Self::DeleteMetadata(serde_json::from_value(data)?),
            LogType::RevertedTransaction => {
                Self::RevertedTransaction(serde_json::from_value(data)?)
            }
        };
        Ok(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "LogRecord", try_from = "LogRecord")]
pub struct Log {
    /// Assigned by the ledger store; imported logs carry their own.
    pub id: Option<u64>,
    pub payload: LogPayload,
    pub date: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    /// [`idempotency_hash`] of the input that produced the log.
    pub idempotency_hash: Option<String>,
    /// Chain hash, set by the store when the ledger hashes its logs.
    pub hash: Option<Vec<u8>>,
}

impl Log {
    pub fn new(payload: LogPayload) -> Self {
        Self {
            id: None,
            payload,
            // Postgres keeps microseconds; the chain hash must survive a round trip.
            date: Utc::now().trunc_subsecs(6),
            idempotency_key: None,
            idempotency_hash: None,
            hash: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_idempotency_hash(mut self, hash: Option<String>) -> Self {
        self.idempotency_hash = hash;
        self
    }

    pub fn log_type(&self) -> LogType {
        self.payload.log_type()
    }

    /// Hash of this log chained after `previous`.
    ///
    /// Covers the previous hash (JSON encoded, `null` when the previous log
    /// has none) then the log's type, data, date and idempotency key, each
    /// encoding followed by a newline. Ids and the idempotency hash are not
    /// part of the chain.
    pub fn compute_hash(&self, previous: Option<&Log>) -> DomainResult<Vec<u8>> {
        let mut hasher = Sha256::new();
        if let Some(previous) = previous {
            let encoded = previous.hash.as_deref().map(|hash| STANDARD.encode(hash));
            hasher.update(serde_json::to_vec(&encoded)?);
            hasher.update(b"\n");
        }
        let data = self.payload.to_data()?;
        let hashed = HashedLog {
            log_type: self.log_type(),
            data: &data,
            date: &self.date,
            idempotency_key: self.idempotency_key.as_deref().unwrap_or_default(),
        };
        hasher.update(serde_json::to_vec(&hashed)?);
        hasher.update(b"\n");
        Ok(hasher.finalize().to_vec())
    }

    /// Set [`Log::hash`] from `previous`.
    pub fn chain(&mut self, previous: Option<&Log>) -> DomainResult<()> {
        self.hash = Some(self.compute_hash(previous)?);
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedLog<'a> {
    #[serde(rename = "type")]
    log_type: LogType,
    data: &'a Value,
    date: &'a DateTime<Utc>,
    idempotency_key: &'a str,
}

/// Fingerprint of an operation input, stored next to its idempotency key.
///
/// Lowercase hex SHA-256 of the input's JSON encoding. Maps are ordered, so
/// equal inputs always hash the same.
pub fn idempotency_hash<T: Serialize>(input: &T) -> DomainResult<String> {
    let encoded = serde_json::to_vec(input)?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Flat `(type, data)` representation shared by the wire format and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub data: Value,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_hash: Option<String>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub hash: Option<Vec<u8>>,
}

impl From<Log> for LogRecord {
    fn from(log: Log) -> Self {
        let log_type = log.log_type();
        // Payload structs hold only strings, maps and integers.
        let data = log.payload.to_data().unwrap_or(Value::Null);
        Self {
            id: log.id,
            log_type,
            data,
            date: log.date,
            idempotency_key: log.idempotency_key,
            idempotency_hash: log.idempotency_hash,
            hash: log.hash,
        }
    }
}

impl TryFrom<LogRecord> for Log {
    type Error = DomainError;

    fn try_from(record: LogRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: record.id,
            payload: LogPayload::from_parts(record.log_type, record.data)?,
            date: record.date,
            idempotency_key: record.idempotency_key,
            idempotency_hash: record.idempotency_hash,
            hash: record.hash,
        })
    }
}
