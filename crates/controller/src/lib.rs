//! `ledgerflow-controller`: the write side of the ledger.
//!
//! - [`ledger`]: per-ledger operations, each producing one audit log, and
//!   the lifecycle wrapper handling a ledger's first write;
//! - [`system`]: ledger creation, lookup and controller construction.

pub mod error;
pub mod ledger;
pub mod system;

pub use error::{ControllerError, ControllerResult};
pub use ledger::{
    Controller, CreateTransaction, DefaultController, LedgerStateTracker, Parameters,
    RevertTransaction,
};
pub use system::SystemController;
