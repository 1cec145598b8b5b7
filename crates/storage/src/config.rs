//! Database configuration loading.
//!
//! Values come from the environment:
//!
//! - `DATABASE_URL` (required)
//! - `DATABASE_MAX_CONNECTIONS` (default 10)
//! - `DATABASE_ACQUIRE_TIMEOUT_SECS` (default 30)
//! - `LEDGER_DEFAULT_BUCKET` (default `_default`)

use std::time::Duration;

use ledgerflow_core::DEFAULT_BUCKET;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{StorageError, StorageResult, map_sqlx_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_bucket")]
    pub default_bucket: String,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            default_bucket: default_bucket(),
        }
    }

    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StorageResult<Self> {
        let url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| StorageError::Config("DATABASE_URL is not set".to_string()))?;

        let mut config = Self::new(url);
        if let Some(raw) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = parse_var("DATABASE_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = lookup("DATABASE_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout_secs = parse_var("DATABASE_ACQUIRE_TIMEOUT_SECS", &raw)?;
        }
        if let Some(bucket) = lookup("LEDGER_DEFAULT_BUCKET") {
            config.default_bucket = bucket;
        }
        Ok(config)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Open a connection pool (connections are established lazily).
    pub fn connect_lazy(&self) -> StorageResult<PgPool> {
        self.pool_options()
            .connect_lazy(&self.url)
            .map_err(|e| map_sqlx_error("connect", e))
    }

    pub async fn connect(&self) -> StorageResult<PgPool> {
        self.pool_options()
            .connect(&self.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> StorageResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| StorageError::Config(format!("{key} has an invalid value '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn url_is_required() {
        let err = DatabaseConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let config = DatabaseConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config, DatabaseConfig::new("postgres://x"));
        assert_eq!(config.default_bucket, "_default");
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("LEDGER_DEFAULT_BUCKET", "eu"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.default_bucket, "eu");

        let err = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("DATABASE_ACQUIRE_TIMEOUT_SECS"));
    }
}
