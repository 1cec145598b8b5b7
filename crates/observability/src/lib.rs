//! Process-wide logging setup shared by ledgerflow binaries and tests.

pub mod tracing;

pub use self::tracing::{LogFormat, LoggingConfig, init, init_for_tests, init_with};
