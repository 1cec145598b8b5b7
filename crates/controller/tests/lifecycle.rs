use std::sync::Arc;

use ledgerflow_controller::ledger::{LedgerStateTracker, SaveAccountMetadata};
use ledgerflow_controller::{
    Controller, ControllerError, CreateTransaction, Parameters, SystemController,
};
use ledgerflow_core::{
    Configuration, FEATURE_DISABLED, FEATURE_HASH_LOGS, LedgerState, Log, LogPayload, Metadata,
    MetadataTarget, NewTransactionPayload, Posting, SetMetadataPayload, Transaction,
};
use ledgerflow_storage::{ErrorKind, InMemoryDriver, InMemoryLedgerStore};
use num_bigint::BigInt;
use tokio::sync::mpsc;

async fn system_with_ledger(name: &str) -> (SystemController<InMemoryDriver>, InMemoryLedgerStore) {
    ledgerflow_observability::init_for_tests();
    let system = SystemController::new(InMemoryDriver::new());
    system
        .create_ledger(name, Configuration::default())
        .await
        .expect("create ledger");
    let store = system.driver().store(name).expect("store");
    (system, store)
}

fn deposit(account: &str, amount: i64) -> Parameters<CreateTransaction> {
    Parameters::new(CreateTransaction::new(vec![Posting::new(
        "world", account, "USD", amount,
    )]))
}

fn imported_transaction(log_id: u64, transaction_id: u64) -> Log {
    let transaction = Transaction::new(vec![Posting::new("world", "bank", "USD", 10)])
        .with_id(transaction_id);
    let mut log = Log::new(LogPayload::NewTransaction(NewTransactionPayload {
        transaction,
        account_metadata: Default::default(),
    }));
    log.id = Some(log_id);
    log
}

/// Hash-chain `logs` the way a hashing ledger exported them.
fn chained(mut logs: Vec<Log>) -> Vec<Log> {
    for i in 0..logs.len() {
        let (before, rest) = logs.split_at_mut(i);
        rest[0].chain(before.last()).expect("hash");
    }
    logs
}

async fn stream(logs: Vec<Log>) -> mpsc::Receiver<Log> {
    let (sender, receiver) = mpsc::channel(logs.len().max(1));
    for log in logs {
        sender.send(log).await.expect("receiver alive");
    }
    receiver
}

async fn send_all(logs: Vec<Log>) -> mpsc::Receiver<Log> {
    stream(chained(logs)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_writes_from_independent_controllers_repair_once() {
    let (_system, store) = system_with_ledger("concurrent").await;

    let mut handles = Vec::new();
    for i in 0..16 {
        // One tracker per task, each with its own cell, like separate processes.
        let controller = LedgerStateTracker::standalone(store.clone());
        handles.push(tokio::spawn(async move {
            controller
                .create_transaction(deposit(&format!("users:{i}"), 1))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("task").expect("write");
    }

    assert_eq!(store.repair_count(), 1);
    assert_eq!(store.state().expect("state"), LedgerState::InUse);
    assert_eq!(store.transactions().expect("transactions").len(), 16);
    assert_eq!(store.logs().expect("logs").len(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn controllers_from_the_system_share_state() {
    let (system, store) = system_with_ledger("shared").await;
    let first = system.get_ledger_controller("shared").await.expect("controller");
    let second = system.get_ledger_controller("shared").await.expect("controller");
    assert_eq!(second.state(), LedgerState::Initializing);

    first
        .create_transaction(deposit("bank", 100))
        .await
        .expect("first write");

    assert_eq!(first.state(), LedgerState::InUse);
    assert_eq!(second.state(), LedgerState::InUse);

    second
        .create_transaction(deposit("bank", 50))
        .await
        .expect("second write");
    assert_eq!(store.repair_count(), 1);
    assert_eq!(
        store.volumes("bank", "USD").expect("volumes").input,
        BigInt::from(150)
    );

    let ledger = system.get_ledger("shared").await.expect("ledger");
    assert_eq!(ledger.state, LedgerState::InUse);
}

#[tokio::test]
async fn dry_run_first_write_changes_nothing() {
    let (system, store) = system_with_ledger("dry").await;
    let controller = system.get_ledger_controller("dry").await.expect("controller");

    let created = controller
        .create_transaction(deposit("bank", 100).dry_run())
        .await
        .expect("dry run");
    assert!(created.transaction.id.is_some());

    assert_eq!(controller.state(), LedgerState::Initializing);
    assert_eq!(store.state().expect("state"), LedgerState::Initializing);
    assert_eq!(store.repair_count(), 0);
    assert!(store.transactions().expect("transactions").is_empty());
    assert!(store.logs().expect("logs").is_empty());
}

#[tokio::test]
async fn dry_run_after_import_allocates_past_imported_ids() {
    let (system, store) = system_with_ledger("dry-import").await;
    let controller = system.get_ledger_controller("dry-import").await.expect("controller");
    controller
        .import(send_all(vec![imported_transaction(1, 1)]).await)
        .await
        .expect("import");

    let dry = controller
        .create_transaction(deposit("bank", 5).dry_run())
        .await
        .expect("dry run");
    assert_eq!(dry.transaction.id, Some(2));
    assert_eq!(dry.log.id, Some(2));
    assert_eq!(controller.state(), LedgerState::Initializing);
    assert_eq!(store.state().expect("state"), LedgerState::Initializing);
    assert_eq!(store.repair_count(), 0);
    assert_eq!(store.transactions().expect("transactions").len(), 1);

    let created = controller
        .create_transaction(deposit("bank", 5))
        .await
        .expect("real write");
    assert_eq!(created.transaction.id, Some(2));
    assert_eq!(store.repair_count(), 1);
    assert_eq!(controller.state(), LedgerState::InUse);
}

#[tokio::test]
async fn failed_first_write_leaves_ledger_initializing() {
    let (system, store) = system_with_ledger("failing").await;
    let controller = system.get_ledger_controller("failing").await.expect("controller");

    let err = controller
        .save_account_metadata(Parameters::new(SaveAccountMetadata {
            address: "not an address".to_string(),
            metadata: Metadata::from([("k".to_string(), "v".to_string())]),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Validation(_)));
    assert_eq!(store.state().expect("state"), LedgerState::Initializing);
    assert_eq!(controller.state(), LedgerState::Initializing);
}

#[tokio::test]
async fn import_keeps_ids_and_first_write_continues_after_them() {
    let (system, store) = system_with_ledger("imported").await;
    let controller = system.get_ledger_controller("imported").await.expect("controller");

    let logs = send_all(vec![imported_transaction(1, 5), imported_transaction(2, 10)]).await;
    controller.import(logs).await.expect("import");

    assert_eq!(controller.state(), LedgerState::Initializing);
    assert_eq!(store.state().expect("state"), LedgerState::Initializing);
    let mut ids: Vec<_> = store
        .transactions()
        .expect("transactions")
        .into_iter()
        .filter_map(|tx| tx.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![5, 10]);

    let created = controller
        .create_transaction(deposit("bank", 1))
        .await
        .expect("write after import");
    assert_eq!(created.transaction.id, Some(11));
    assert_eq!(created.log.id, Some(3));
    assert_eq!(store.repair_count(), 1);
    assert_eq!(controller.state(), LedgerState::InUse);
}

#[tokio::test]
async fn import_requires_an_initializing_ledger() {
    let (system, _store) = system_with_ledger("busy").await;
    let controller = system.get_ledger_controller("busy").await.expect("controller");
    controller
        .create_transaction(deposit("bank", 1))
        .await
        .expect("write");

    let err = controller
        .import(send_all(vec![imported_transaction(1, 1)]).await)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Import(ref msg) if msg.contains("initializing")));
}

#[tokio::test]
async fn import_rechecks_persisted_state_under_lock() {
    let (_system, store) = system_with_ledger("stale").await;
    let writer = LedgerStateTracker::standalone(store.clone());
    let stale = LedgerStateTracker::standalone(store.clone());

    writer
        .create_transaction(deposit("bank", 1))
        .await
        .expect("write");
    assert_eq!(stale.state(), LedgerState::Initializing);

    let err = stale
        .import(send_all(vec![imported_transaction(1, 1)]).await)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Import(_)));
    assert_eq!(stale.state(), LedgerState::InUse);
}

#[tokio::test]
async fn import_requires_an_empty_ledger() {
    let (system, store) = system_with_ledger("twice").await;
    let controller = system.get_ledger_controller("twice").await.expect("controller");
    controller
        .import(send_all(vec![imported_transaction(1, 1)]).await)
        .await
        .expect("first import");

    let err = controller
        .import(send_all(vec![imported_transaction(2, 2)]).await)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Import(ref msg) if msg.contains("empty")));
    assert_eq!(store.logs().expect("logs").len(), 1);
}

#[tokio::test]
async fn import_rejects_out_of_order_logs_atomically() {
    let (system, store) = system_with_ledger("disorder").await;
    let controller = system.get_ledger_controller("disorder").await.expect("controller");

    let err = controller
        .import(send_all(vec![imported_transaction(2, 2), imported_transaction(1, 1)]).await)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Import(_)));
    assert!(store.logs().expect("logs").is_empty());
    assert!(store.transactions().expect("transactions").is_empty());
}

#[tokio::test]
async fn import_checks_the_hash_chain() {
    let (system, store) = system_with_ledger("chain").await;
    let controller = system.get_ledger_controller("chain").await.expect("controller");

    let export = chained(vec![imported_transaction(1, 1), imported_transaction(2, 2)]);
    let mut tampered = export.clone();
    tampered[1].hash = Some(vec![0; 32]);

    let err = controller.import(stream(tampered).await).await.unwrap_err();
    match err {
        ControllerError::InvalidLogHash {
            log_id, expected: stored, ..
        } => {
            assert_eq!(log_id, 2);
            assert_eq!(stored, "00".repeat(32));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.logs().expect("logs").is_empty());
    assert!(store.transactions().expect("transactions").is_empty());

    controller.import(stream(export.clone()).await).await.expect("valid chain");
    assert_eq!(store.logs().expect("logs")[1].hash, export[1].hash);
}

#[tokio::test]
async fn import_into_hashing_ledger_requires_hashes() {
    let (system, store) = system_with_ledger("unhashed-export").await;
    let controller = system
        .get_ledger_controller("unhashed-export")
        .await
        .expect("controller");

    let err = controller
        .import(stream(vec![imported_transaction(1, 1)]).await)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidLogHash { log_id: 1, ref expected, .. } if expected.is_empty()));
    assert!(store.logs().expect("logs").is_empty());
}

#[tokio::test]
async fn ledgers_without_log_hashing_import_and_write_plain_logs() {
    ledgerflow_observability::init_for_tests();
    let system = SystemController::new(InMemoryDriver::new());
    system
        .create_ledger(
            "plain",
            Configuration::default().with_feature(FEATURE_HASH_LOGS, FEATURE_DISABLED),
        )
        .await
        .expect("create ledger");
    let store = system.driver().store("plain").expect("store");
    let controller = system.get_ledger_controller("plain").await.expect("controller");

    controller
        .import(stream(vec![imported_transaction(1, 1)]).await)
        .await
        .expect("import");
    let created = controller
        .create_transaction(deposit("bank", 1))
        .await
        .expect("write");
    assert!(created.log.hash.is_none());
    assert!(store.logs().expect("logs").iter().all(|log| log.hash.is_none()));
}

#[tokio::test]
async fn writes_extend_the_imported_hash_chain() {
    let (system, store) = system_with_ledger("extended").await;
    let controller = system.get_ledger_controller("extended").await.expect("controller");
    controller
        .import(send_all(vec![imported_transaction(1, 1)]).await)
        .await
        .expect("import");
    controller
        .create_transaction(deposit("bank", 1))
        .await
        .expect("write");

    let logs = store.logs().expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].hash, Some(logs[1].compute_hash(Some(&logs[0])).expect("hash")));
}

#[tokio::test]
async fn import_reports_the_failing_log_and_its_cause() {
    let (system, store) = system_with_ledger("broken").await;
    let controller = system.get_ledger_controller("broken").await.expect("controller");

    let mut orphan_metadata = Log::new(LogPayload::SetMetadata(SetMetadataPayload {
        target: MetadataTarget::Transaction(99),
        metadata: Metadata::from([("k".to_string(), "v".to_string())]),
    }));
    orphan_metadata.id = Some(2);

    let err = controller
        .import(send_all(vec![imported_transaction(1, 1), orphan_metadata]).await)
        .await
        .unwrap_err();
    match &err {
        ControllerError::ImportReplay { log_id, source } => {
            assert_eq!(*log_id, 2);
            assert!(matches!(**source, ControllerError::Storage(ref e) if e.is(ErrorKind::NotFound)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(std::error::Error::source(&err).is_some());
    assert!(store.logs().expect("logs").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn import_racing_first_writes_never_mixes_histories() {
    ledgerflow_observability::init_for_tests();
    let system = Arc::new(SystemController::new(InMemoryDriver::new()));

    for round in 0..20 {
        let name = format!("race-{round}");
        system
            .create_ledger(&name, Configuration::default())
            .await
            .expect("create ledger");
        let store = system.driver().store(&name).expect("store");

        let import = {
            let system = system.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let controller = system.get_ledger_controller(&name).await?;
                let logs = send_all(vec![imported_transaction(1, 1), imported_transaction(2, 2)]).await;
                controller.import(logs).await
            })
        };
        let mut writes = Vec::new();
        for i in 0..4 {
            let system = system.clone();
            let name = name.clone();
            writes.push(tokio::spawn(async move {
                let controller = system.get_ledger_controller(&name).await?;
                controller.create_transaction(deposit(&format!("users:{i}"), 1)).await
            }));
        }

        let imported = import.await.expect("import task");
        let mut created = Vec::new();
        for write in writes {
            let write = write.await.expect("write task").expect("write");
            created.push(write.transaction.id.expect("id"));
        }

        let transactions = store.transactions().expect("transactions");
        let logs = store.logs().expect("logs");
        match imported {
            Ok(()) => {
                assert!(created.iter().all(|id| *id > 2), "{round}: {created:?}");
                assert_eq!(transactions.len(), 6);
                assert_eq!(logs.len(), 6);
            }
            Err(err) => {
                assert!(matches!(err, ControllerError::Import(_)), "{round}: {err}");
                assert_eq!(transactions.len(), 4);
                assert_eq!(logs.len(), 4);
            }
        }
        created.sort_unstable();
        created.dedup();
        assert_eq!(created.len(), 4);
        for pair in logs.windows(2) {
            assert_eq!(pair[1].hash, Some(pair[1].compute_hash(Some(&pair[0])).expect("hash")));
        }
        assert_eq!(store.state().expect("state"), LedgerState::InUse);
    }
}

#[tokio::test]
async fn system_rejects_duplicate_and_invalid_ledgers() {
    let (system, _store) = system_with_ledger("main").await;

    let err = system
        .create_ledger("main", Configuration::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::LedgerAlreadyExists(ref name) if name == "main"));

    let err = system
        .create_ledger("not valid!", Configuration::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidLedgerConfiguration(_)));

    let err = system.get_ledger_controller("missing").await.unwrap_err();
    assert!(matches!(err, ControllerError::LedgerNotFound(ref name) if name == "missing"));
}

#[tokio::test]
async fn ledger_metadata_round_trips_through_the_system() {
    let (system, _store) = system_with_ledger("meta").await;
    let metadata = Metadata::from([("team".to_string(), "payments".to_string())]);

    system
        .update_ledger_metadata("meta", &metadata)
        .await
        .expect("update");
    let ledger = system.get_ledger("meta").await.expect("ledger");
    assert_eq!(ledger.configuration.metadata, metadata);

    system
        .delete_ledger_metadata("meta", "team")
        .await
        .expect("delete");
    let ledger = system.get_ledger("meta").await.expect("ledger");
    assert!(ledger.configuration.metadata.is_empty());

    let err = system
        .update_ledger_metadata("other", &metadata)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::LedgerNotFound(_)));
}

#[tokio::test]
async fn shared_system_hands_out_controllers_across_tasks() {
    let (system, store) = system_with_ledger("tasks").await;
    let system = Arc::new(system);

    let mut handles = Vec::new();
    for i in 0..8 {
        let system = system.clone();
        handles.push(tokio::spawn(async move {
            let controller = system.get_ledger_controller("tasks").await?;
            controller.create_transaction(deposit(&format!("users:{i}"), 1)).await
        }));
    }
    for handle in handles {
        handle.await.expect("task").expect("write");
    }
    assert_eq!(store.repair_count(), 1);
}
