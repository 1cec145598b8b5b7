//! Ledger registry operations and controller construction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ledgerflow_core::{Configuration, Ledger, LedgerState, Metadata};
use ledgerflow_storage::{Driver, ErrorKind, StorageError};
use tracing::{info, instrument};

use crate::error::{ControllerError, ControllerResult};
use crate::ledger::{DefaultController, LedgerStateCell, LedgerStateTracker};

/// Entry point for everything above a single ledger.
///
/// Controllers returned for the same ledger name share one
/// [`LedgerStateCell`], so once any of them commits the first write the others
/// skip the locked path.
#[derive(Debug)]
pub struct SystemController<D> {
    driver: D,
    cells: RwLock<HashMap<String, Arc<LedgerStateCell>>>,
}

impl<D: Driver> SystemController<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[instrument(skip(self, configuration), err)]
    pub async fn create_ledger(
        &self,
        name: &str,
        configuration: Configuration,
    ) -> ControllerResult<Ledger> {
        let mut ledger = Ledger::new(name, configuration)
            .map_err(|err| ControllerError::InvalidLedgerConfiguration(err.to_string()))?;

        self.driver
            .create_ledger(&mut ledger)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::Conflict => ControllerError::LedgerAlreadyExists(name.to_string()),
                _ => ControllerError::Storage(err),
            })?;

        info!(ledger = %ledger.name, id = ledger.id, bucket = %ledger.configuration.bucket, "ledger created");
        Ok(ledger)
    }

    pub async fn get_ledger(&self, name: &str) -> ControllerResult<Ledger> {
        self.driver
            .get_ledger(name)
            .await
            .map_err(ledger_not_found(name))
    }

    /// Controller for the named ledger, wrapped in lifecycle tracking.
    pub async fn get_ledger_controller(
        &self,
        name: &str,
    ) -> ControllerResult<LedgerStateTracker<D::Store>> {
        let (store, ledger) = self
            .driver
            .open_ledger(name)
            .await
            .map_err(ledger_not_found(name))?;

        let cell = self.cell(&ledger)?;
        Ok(LedgerStateTracker::new(DefaultController::new(store), cell))
    }

    pub async fn update_ledger_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> ControllerResult<()> {
        self.driver
            .update_ledger_metadata(name, metadata)
            .await
            .map_err(ledger_not_found(name))
    }

    pub async fn delete_ledger_metadata(&self, name: &str, key: &str) -> ControllerResult<()> {
        self.driver
            .delete_ledger_metadata(name, key)
            .await
            .map_err(ledger_not_found(name))
    }

    fn cell(&self, ledger: &Ledger) -> ControllerResult<Arc<LedgerStateCell>> {
        let mut cells = self.cells.write().map_err(|_| {
            StorageError::Database {
                operation: "ledger_controller".to_string(),
                message: "ledger state registry lock poisoned".to_string(),
            }
        })?;
        let cell = cells
            .entry(ledger.name.clone())
            .or_insert_with(|| Arc::new(LedgerStateCell::new(ledger.state)))
            .clone();
        // Another process may have flipped the ledger since the cell was made.
        if ledger.state == LedgerState::InUse {
            cell.set(LedgerState::InUse);
        }
        Ok(cell)
    }
}

fn ledger_not_found(name: &str) -> impl FnOnce(StorageError) -> ControllerError {
    let name = name.to_string();
    move |err| {
        if err.is(ErrorKind::NotFound) {
            ControllerError::LedgerNotFound(name)
        } else {
            ControllerError::Storage(err)
        }
    }
}
