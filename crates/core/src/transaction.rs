//! Postings and transactions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};

use crate::account::Volumes;
use crate::error::{DomainError, DomainResult};
use crate::metadata::Metadata;

/// Address of the unbounded source account.
pub const WORLD: &str = "world";

/// A single movement of `amount` units of `asset` from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub source: String,
    pub destination: String,
    #[serde(with = "crate::bigint::as_string")]
    pub amount: BigInt,
    pub asset: String,
}

impl Posting {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        asset: impl Into<String>,
        amount: impl Into<BigInt>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            amount: amount.into(),
            asset: asset.into(),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.amount.sign() == Sign::Minus {
            return Err(DomainError::validation(format!(
                "negative amount {} on posting {} -> {}",
                self.amount, self.source, self.destination
            )));
        }
        for address in [&self.source, &self.destination] {
            if !is_valid_address(address) {
                return Err(DomainError::validation(format!("invalid account address '{address}'")));
            }
        }
        if !is_valid_asset(&self.asset) {
            return Err(DomainError::validation(format!("invalid asset '{}'", self.asset)));
        }
        Ok(())
    }
}

/// Account addresses are `:`-separated segments of `[a-zA-Z0-9_-]`.
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && address.split(':').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// Assets are uppercase codes with an optional `/precision` suffix (`USD/2`).
pub fn is_valid_asset(asset: &str) -> bool {
    let (code, precision) = match asset.split_once('/') {
        Some((code, precision)) => (code, Some(precision)),
        None => (asset, None),
    };

    let code_ok = code.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && code.len() <= 32
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    let precision_ok = precision.is_none_or(|p| {
        !p.is_empty() && p.len() <= 6 && p.chars().all(|c| c.is_ascii_digit())
    });

    code_ok && precision_ok
}

/// A committed (or to-be-committed) set of postings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Assigned by the ledger store; imported transactions carry their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub postings: Vec<Posting>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(postings: Vec<Posting>) -> Self {
        Self {
            id: None,
            postings,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
            reference: None,
            reverted_at: None,
            inserted_at: None,
            updated_at: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_reverted(&self) -> bool {
        self.reverted_at.is_some()
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.postings.is_empty() {
            return Err(DomainError::validation("transaction has no postings"));
        }
        self.postings.iter().try_for_each(Posting::validate)
    }

    /// Build the transaction that cancels this one: postings in reverse order
    /// with source and destination swapped.
    pub fn reverse(&self) -> Transaction {
        let postings = self
            .postings
            .iter()
            .rev()
            .map(|p| Posting {
                source: p.destination.clone(),
                destination: p.source.clone(),
                amount: p.amount.clone(),
                asset: p.asset.clone(),
            })
            .collect();
        Transaction::new(postings)
    }

    /// Every account touched by the postings, sources first.
    pub fn accounts(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for p in &self.postings {
            for address in [p.source.as_str(), p.destination.as_str()] {
                if !out.contains(&address) {
                    out.push(address);
                }
            }
        }
        out
    }

    /// Net input/output per (account, asset) implied by the postings.
    pub fn volume_updates(&self) -> BTreeMap<(String, String), Volumes> {
        let mut out: BTreeMap<(String, String), Volumes> = BTreeMap::new();
        for p in &self.postings {
            out.entry((p.source.clone(), p.asset.clone()))
                .or_default()
                .output += &p.amount;
            out.entry((p.destination.clone(), p.asset.clone()))
                .or_default()
                .input += &p.amount;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Transaction {
        Transaction::new(vec![
            Posting::new(WORLD, "users:001", "USD/2", 100),
            Posting::new("users:001", "merchants:acme", "USD/2", 40),
        ])
    }

    #[test]
    fn reverse_swaps_and_reorders_postings() {
        let reversed = payment().reverse();
        assert_eq!(
            reversed.postings,
            vec![
                Posting::new("merchants:acme", "users:001", "USD/2", 40),
                Posting::new("users:001", WORLD, "USD/2", 100),
            ]
        );
        assert!(reversed.id.is_none());
    }

    #[test]
    fn volume_updates_net_out_per_account() {
        let updates = payment().volume_updates();
        let user = &updates[&("users:001".to_string(), "USD/2".to_string())];
        assert_eq!(user.input, BigInt::from(100));
        assert_eq!(user.output, BigInt::from(40));
        assert_eq!(user.balance(), BigInt::from(60));
        assert_eq!(updates[&(WORLD.to_string(), "USD/2".to_string())].balance(), BigInt::from(-100));
    }

    #[test]
    fn validation_rules() {
        assert!(payment().validate().is_ok());
        assert!(Transaction::new(vec![]).validate().is_err());
        assert!(
            Transaction::new(vec![Posting::new(WORLD, "a", "USD", -1)])
                .validate()
                .is_err()
        );
        assert!(
            Transaction::new(vec![Posting::new(WORLD, "a::b", "USD", 1)])
                .validate()
                .is_err()
        );
        assert!(
            Transaction::new(vec![Posting::new(WORLD, "a", "usd", 1)])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn asset_and_address_rules() {
        assert!(is_valid_asset("EUR"));
        assert!(is_valid_asset("USD/2"));
        assert!(!is_valid_asset("USD/"));
        assert!(!is_valid_asset("9USD"));
        assert!(is_valid_address("bank:eu-west_1:001"));
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("trailing:"));
    }

    #[test]
    fn accounts_are_listed_once() {
        assert_eq!(payment().accounts(), vec![WORLD, "users:001", "merchants:acme"]);
    }
    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn address() -> impl Strategy<Value = String> {
            proptest::collection::vec("[a-z0-9_-]{1,8}", 1..4).prop_map(|segments| segments.join(":"))
        }

        fn posting() -> impl Strategy<Value = Posting> {
            (address(), address(), "[A-Z]{3}(/[0-9])?", 0i64..1_000_000)
                .prop_map(|(source, destination, asset, amount)| {
                    Posting::new(source, destination, asset, amount)
                })
        }

        proptest! {
            #[test]
            fn generated_postings_validate(p in posting()) {
                prop_assert!(p.validate().is_ok());
            }

            #[test]
            fn reversing_twice_restores_postings(postings in proptest::collection::vec(posting(), 1..6)) {
                let tx = Transaction::new(postings.clone());
                prop_assert_eq!(tx.reverse().reverse().postings, postings);
            }

            #[test]
            fn reverse_cancels_volumes(postings in proptest::collection::vec(posting(), 1..6)) {
                let tx = Transaction::new(postings);
                let forward = tx.volume_updates();
                let backward = tx.reverse().volume_updates();
                for (key, volumes) in forward {
                    let undone = &backward[&key];
                    prop_assert_eq!(&volumes.input, &undone.output);
                    prop_assert_eq!(&volumes.output, &undone.input);
                }
            }
        }
    }
}
