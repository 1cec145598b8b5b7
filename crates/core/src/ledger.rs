//! Ledger identity, configuration and lifecycle state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::metadata::Metadata;

/// Bucket used when a ledger is created without an explicit one.
pub const DEFAULT_BUCKET: &str = "_default";

const MAX_NAME_LEN: usize = 63;

/// Chain every log to the previous one with a SHA-256 hash.
///
/// `SYNC` hashes at insertion time under the ledger lock; any other value
/// (`DISABLED`) stores logs without a hash.
pub const FEATURE_HASH_LOGS: &str = "HASH_LOGS";
pub const FEATURE_ENABLED_SYNC: &str = "SYNC";
pub const FEATURE_DISABLED: &str = "DISABLED";

/// Features a ledger gets unless its configuration says otherwise.
pub fn default_features() -> BTreeMap<String, String> {
    BTreeMap::from([(FEATURE_HASH_LOGS.to_string(), FEATURE_ENABLED_SYNC.to_string())])
}

/// Lifecycle state of a ledger.
///
/// A ledger starts `Initializing` and moves to `InUse` exactly once, on the
/// first committed write. The transition never goes backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerState {
    #[default]
    Initializing,
    InUse,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::InUse => "in-use",
        }
    }
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "in-use" => Ok(Self::InUse),
            other => Err(DomainError::validation(format!("unknown ledger state '{other}'"))),
        }
    }
}

/// Creation-time settings of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub bucket: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "default_features")]
    pub features: BTreeMap<String, String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            metadata: Metadata::new(),
            features: default_features(),
        }
    }
}

impl Configuration {
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if !is_valid_name(&self.bucket) {
            return Err(DomainError::validation(format!(
                "bucket name '{}' must match [0-9a-zA-Z_-]{{1,{MAX_NAME_LEN}}}",
                self.bucket
            )));
        }
        if let Some(value) = self.features.get(FEATURE_HASH_LOGS) {
            if value != FEATURE_ENABLED_SYNC && value != FEATURE_DISABLED {
                return Err(DomainError::validation(format!(
                    "feature {FEATURE_HASH_LOGS} accepts {FEATURE_ENABLED_SYNC} or {FEATURE_DISABLED}, got '{value}'"
                )));
            }
        }
        Ok(())
    }
}

/// A named ledger living in a storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Numeric id assigned by the system store on creation (0 until then).
    pub id: u32,
    pub name: String,
    pub state: LedgerState,
    #[serde(flatten)]
    pub configuration: Configuration,
    #[serde(rename = "addedAt")]
    pub added_at: DateTime<Utc>,
}

impl Ledger {
    pub fn new(name: impl Into<String>, configuration: Configuration) -> DomainResult<Self> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(DomainError::validation(format!(
                "ledger name '{name}' must match [0-9a-zA-Z_-]{{1,{MAX_NAME_LEN}}}"
            )));
        }
        configuration.validate()?;

        Ok(Self {
            id: 0,
            name,
            state: LedgerState::Initializing,
            configuration,
            added_at: Utc::now(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.configuration.bucket
    }

    pub fn is_initializing(&self) -> bool {
        self.state == LedgerState::Initializing
    }

    pub fn has_feature(&self, name: &str, value: &str) -> bool {
        self.configuration.features.get(name).is_some_and(|v| v == value)
    }

    pub fn hashes_logs(&self) -> bool {
        self.has_feature(FEATURE_HASH_LOGS, FEATURE_ENABLED_SYNC)
    }
}

/// Ledger and bucket names share the same character rules; both end up in
/// SQL identifiers.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ledger_starts_initializing_in_default_bucket() {
        let ledger = Ledger::new("main", Configuration::default()).unwrap();
        assert_eq!(ledger.state, LedgerState::Initializing);
        assert_eq!(ledger.bucket(), DEFAULT_BUCKET);
        assert!(ledger.is_initializing());
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in ["", "with space", "semi;colon", "x".repeat(64).as_str()] {
            let err = Ledger::new(name, Configuration::default()).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{name:?}");
        }

        let err = Ledger::new("ok", Configuration::default().with_bucket("bad\"bucket")).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn log_hashing_is_on_by_default() {
        let ledger = Ledger::new("main", Configuration::default()).unwrap();
        assert!(ledger.hashes_logs());

        let config: Configuration = serde_json::from_str(r#"{"bucket": "b"}"#).unwrap();
        assert_eq!(config.features, default_features());

        let ledger = Ledger::new(
            "quiet",
            Configuration::default().with_feature(FEATURE_HASH_LOGS, FEATURE_DISABLED),
        )
        .unwrap();
        assert!(!ledger.hashes_logs());

        let err = Ledger::new("x", Configuration::default().with_feature(FEATURE_HASH_LOGS, "ASYNC"))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn state_uses_kebab_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&LedgerState::InUse).unwrap(), "\"in-use\"");
        assert_eq!("initializing".parse::<LedgerState>().unwrap(), LedgerState::Initializing);
        assert!("used".parse::<LedgerState>().is_err());
    }
}
