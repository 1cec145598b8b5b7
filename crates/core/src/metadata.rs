use std::collections::BTreeMap;

/// Free-form string metadata attached to ledgers, accounts and transactions.
pub type Metadata = BTreeMap<String, String>;

/// Metadata keyed by account address.
pub type AccountMetadata = BTreeMap<String, Metadata>;
