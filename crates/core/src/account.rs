//! Accounts and their per-asset volumes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// Cumulated input and output of one account for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volumes {
    #[serde(with = "crate::bigint::as_string")]
    pub input: BigInt,
    #[serde(with = "crate::bigint::as_string")]
    pub output: BigInt,
}

impl Volumes {
    pub fn new(input: impl Into<BigInt>, output: impl Into<BigInt>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    pub fn balance(&self) -> BigInt {
        &self.input - &self.output
    }

    pub fn merge(&mut self, other: &Volumes) {
        self.input += &other.input;
        self.output += &other.output;
    }
}

/// Volumes keyed by asset.
pub type VolumesByAsset = BTreeMap<String, Volumes>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub first_usage: DateTime<Utc>,
    pub insertion_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present only when the `volumes` expansion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<VolumesByAsset>,
}

impl Account {
    pub fn new(address: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            metadata: Metadata::new(),
            first_usage: at,
            insertion_date: at,
            updated_at: at,
            volumes: None,
        }
    }
}

/// One row of the volumes resource: an (account, asset) pair with its balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountVolumes {
    pub account: String,
    pub asset: String,
    #[serde(flatten)]
    pub volumes: Volumes,
    #[serde(with = "crate::bigint::as_string")]
    pub balance: BigInt,
}

impl AccountVolumes {
    pub fn new(account: impl Into<String>, asset: impl Into<String>, volumes: Volumes) -> Self {
        let balance = volumes.balance();
        Self {
            account: account.into(),
            asset: asset.into(),
            volumes,
            balance,
        }
    }
}
