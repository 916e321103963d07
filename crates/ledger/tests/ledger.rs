use folio_ledger::error::ErrorKind;
use folio_ledger::{
    BatchOptions, ChangeFilter, ChangeStatus, ChangeType, Channel, ChannelOutcome, Ledger, MockCall, MockCatalog,
    MockChangeBackend, PendingChange, RefreshOutcome, RefreshPolicy, Scope,
};
use folio_progress::{BroadcastBus, BusHandle, OperationStats, ProgressCoordinator, Settlement};
use rstest::rstest;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

fn change(id: &str, change_type: ChangeType) -> PendingChange {
    PendingChange::new(change_type).with_id(id).with_target(format!("book-{id}"))
}

fn call(command: &'static str, ids: &[&str]) -> MockCall {
    MockCall { command, ids: ids.iter().map(|id| id.to_string()).collect() }
}

async fn status_of(backend: &MockChangeBackend, id: &str) -> Option<ChangeStatus> {
    backend.get(id).await.map(|change| change.status)
}

#[tokio::test]
async fn test_mixed_batch_with_item_failure() {
    let changes = vec![
        change("t1", ChangeType::Rename),
        change("t2", ChangeType::DeviceAdd).with_device("kobo"),
        change("t3", ChangeType::TagAdd),
    ];
    let backend = Arc::new(MockChangeBackend::with_changes(changes.clone()));
    backend.fail_item("t2", "device storage full").await;
    let ledger = Ledger::new(backend.clone());

    let report = ledger.apply(&Scope::Selected(changes), BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 2 });
    assert_eq!(report.device, ChannelOutcome::Settled { affected: 1 });
    assert_eq!(
        backend.calls(),
        [call("apply-file-changes", &["t1", "t3"]), call("apply-device-changes", &["t2"])]
    );

    assert_eq!(status_of(&backend, "t1").await, Some(ChangeStatus::Applied));
    assert_eq!(status_of(&backend, "t2").await, Some(ChangeStatus::Error));
    assert_eq!(status_of(&backend, "t3").await, Some(ChangeStatus::Applied));
    let failed = backend.get("t2").await.unwrap();
    assert_eq!(failed.error.as_deref(), Some("device storage full"));
    assert!(ledger.list_by_status(Some(ChangeStatus::Pending)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wildcard_apply_reaches_unloaded_changes() {
    let backend = Arc::new(MockChangeBackend::with_changes(
        (0..500).map(|n| change(&format!("c{n:03}"), ChangeType::MetadataUpdate)),
    ));
    let ledger = Ledger::new(backend.clone());

    let report = ledger.apply(&Scope::all(), BatchOptions::default()).await.unwrap();
    assert_eq!(backend.calls(), [call("apply-file-changes", &[]), call("apply-device-changes", &[])]);
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 500 });
    assert_eq!(report.device, ChannelOutcome::Settled { affected: 0 });
    assert!(ledger.list_by_status(Some(ChangeStatus::Pending)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wildcard_with_device_filter_enumerates() {
    let backend = Arc::new(MockChangeBackend::with_changes([
        change("f1", ChangeType::Rename),
        change("d1", ChangeType::DeviceAdd).with_device("kobo"),
        change("d2", ChangeType::DeviceUpdate).with_device("kindle"),
        change("d3", ChangeType::DeviceRemove).with_device("kobo"),
    ]));
    let ledger = Ledger::new(backend.clone());

    let scope = Scope::Matching(ChangeFilter::default().device("kobo"));
    let report = ledger.apply(&scope, BatchOptions::default()).await.unwrap();
    assert_eq!(backend.calls(), [call("apply-device-changes", &["d1", "d3"])]);
    assert_eq!(report.file, ChannelOutcome::Skipped);
    assert_eq!(status_of(&backend, "d2").await, Some(ChangeStatus::Pending));
    assert_eq!(status_of(&backend, "f1").await, Some(ChangeStatus::Pending));
}

#[tokio::test]
async fn test_settled_changes_are_not_reapplied() {
    let mut applied = change("old", ChangeType::Rename);
    applied.status = ChangeStatus::Applied;
    let fresh = change("new", ChangeType::Rename);
    let backend = Arc::new(MockChangeBackend::with_changes([applied.clone(), fresh.clone()]));
    let ledger = Ledger::new(backend.clone());

    let report = ledger.apply(&Scope::Selected(vec![applied.clone()]), BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Skipped);
    assert!(backend.calls().is_empty());

    ledger.apply(&Scope::Selected(vec![applied, fresh]), BatchOptions::default()).await.unwrap();
    assert_eq!(backend.calls(), [call("apply-file-changes", &["new"])]);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let backend = Arc::new(MockChangeBackend::with_changes([
        change("a", ChangeType::Rename),
        change("b", ChangeType::TagRemove),
    ]));
    let ledger = Ledger::new(backend.clone());
    let a = backend.get("a").await.unwrap();
    let b = backend.get("b").await.unwrap();

    ledger.apply(&Scope::Selected(vec![a.clone()]), BatchOptions::default()).await.unwrap();

    // The caller's copy of `a` still says pending; the backend knows better.
    let report = ledger.remove(&Scope::Selected(vec![a]), BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 0 });

    let report = ledger.remove(&Scope::Selected(vec![b.clone()]), BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 1 });
    let again = ledger.remove(&Scope::Selected(vec![b]), BatchOptions::default()).await.unwrap();
    assert_eq!(again.file, ChannelOutcome::Settled { affected: 0 });
    let wildcard = ledger.remove(&Scope::all(), BatchOptions::default()).await.unwrap();
    assert_eq!(wildcard.file, ChannelOutcome::Settled { affected: 0 });

    assert_eq!(status_of(&backend, "a").await, Some(ChangeStatus::Applied));
    assert_eq!(status_of(&backend, "b").await, None);
    let everything = ledger.list_by_status(None).await.unwrap();
    assert_eq!(everything.len(), 1);
}

#[rstest]
#[case(RefreshPolicy::Never, ChangeType::DeviceAdd, 0)]
#[case(RefreshPolicy::Sync, ChangeType::Rename, 0)]
#[case(RefreshPolicy::Sync, ChangeType::DeviceAdd, 1)]
#[case(RefreshPolicy::Always, ChangeType::Rename, 1)]
#[tokio::test]
async fn test_refresh_policy(#[case] policy: RefreshPolicy, #[case] change_type: ChangeType, #[case] reloads: usize) {
    let pending = change("x", change_type);
    let backend = Arc::new(MockChangeBackend::with_changes([pending.clone()]));
    let catalog = Arc::new(MockCatalog::default());
    let ledger = Ledger::new(backend).with_catalog(catalog.clone()).with_refresh_policy(RefreshPolicy::Never);

    let report = ledger.apply(&Scope::Selected(vec![pending]), BatchOptions::default().refresh(policy)).await.unwrap();
    assert_eq!(catalog.reloads(), reloads);
    let expected = if reloads == 1 { RefreshOutcome::Refreshed } else { RefreshOutcome::NotRequested };
    assert_eq!(report.refresh, expected);
}

#[tokio::test]
async fn test_refresh_failure_is_reported() {
    let pending = change("x", ChangeType::DeviceImport);
    let catalog = Arc::new(MockCatalog::default());
    catalog.set_failing(true);
    let ledger = Ledger::new(Arc::new(MockChangeBackend::with_changes([pending.clone()]))).with_catalog(catalog);

    let report = ledger.apply(&Scope::Selected(vec![pending]), BatchOptions::default()).await.unwrap();
    assert!(matches!(report.refresh, RefreshOutcome::Failed { .. }));
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_channel_failure_does_not_block_other_channel() {
    let changes = vec![change("f", ChangeType::Rename), change("d", ChangeType::DeviceAdd)];
    let backend = Arc::new(MockChangeBackend::with_changes(changes.clone()));
    backend.fail_channel(Channel::Device, "device unplugged").await;
    let ledger = Ledger::new(backend.clone());

    let report = ledger.apply(&Scope::Selected(changes), BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 1 });
    assert!(matches!(
        &report.device,
        ChannelOutcome::Failed { message, failed: 1 } if message.contains("device unplugged")
    ));
    assert_eq!(report.failed_channels(), [Channel::Device]);
    assert_eq!(status_of(&backend, "f").await, Some(ChangeStatus::Applied));
    let d = backend.get("d").await.unwrap();
    assert_eq!(d.status, ChangeStatus::Error);
    assert!(d.error.unwrap().contains("device unplugged"));
    assert!(ledger.list_by_status(Some(ChangeStatus::Pending)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_wildcard_apply_marks_every_pending_change() {
    let mut settled = change("old", ChangeType::DeviceAdd).with_device("kobo");
    settled.status = ChangeStatus::Applied;
    let backend = Arc::new(MockChangeBackend::with_changes([
        settled,
        change("d1", ChangeType::DeviceAdd).with_device("kobo"),
        change("d2", ChangeType::DeviceRemove).with_device("kindle"),
        change("f1", ChangeType::Rename),
    ]));
    backend.fail_channel(Channel::Device, "sync service down").await;
    let ledger = Ledger::new(backend.clone());

    let report = ledger.apply(&Scope::all(), BatchOptions::default()).await.unwrap();
    assert!(matches!(report.device, ChannelOutcome::Failed { failed: 2, .. }));
    assert_eq!(status_of(&backend, "old").await, Some(ChangeStatus::Applied));
    assert_eq!(status_of(&backend, "d1").await, Some(ChangeStatus::Error));
    assert_eq!(status_of(&backend, "d2").await, Some(ChangeStatus::Error));
    assert_eq!(status_of(&backend, "f1").await, Some(ChangeStatus::Applied));
}

#[tokio::test]
async fn test_failed_remove_leaves_changes_pending() {
    let pending = change("d", ChangeType::DeviceAdd).with_device("kobo");
    let backend = Arc::new(MockChangeBackend::with_changes([pending.clone()]));
    backend.fail_channel(Channel::Device, "device unplugged").await;
    let ledger = Ledger::new(backend.clone());

    let report = ledger.remove(&Scope::Selected(vec![pending]), BatchOptions::default()).await.unwrap();
    assert!(matches!(report.device, ChannelOutcome::Failed { failed: 0, .. }));
    assert_eq!(status_of(&backend, "d").await, Some(ChangeStatus::Pending));
}

#[tokio::test]
async fn test_destructive_scope_needs_confirmation() {
    let delete = change("del", ChangeType::Delete);
    let rename = change("ren", ChangeType::Rename);
    let backend = Arc::new(MockChangeBackend::with_changes([delete.clone(), rename.clone()]));
    let ledger = Ledger::new(backend.clone());

    let err = ledger.apply(&Scope::all(), BatchOptions::default()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::ConfirmationRequired(1)));
    let both = Scope::Selected(vec![delete.clone(), rename]);
    let err = ledger.apply(&both, BatchOptions::default()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::ConfirmationRequired(1)));
    assert!(backend.calls().is_empty());
    assert_eq!(ledger.destructive_count(&both).await.unwrap(), 1);

    // A single explicit delete is its own confirmation.
    ledger.apply(&Scope::Selected(vec![delete]), BatchOptions::default()).await.unwrap();
    assert_eq!(status_of(&backend, "del").await, Some(ChangeStatus::Applied));

    ledger.apply(&Scope::all(), BatchOptions::default().confirmed()).await.unwrap();
    assert_eq!(status_of(&backend, "ren").await, Some(ChangeStatus::Applied));
}

#[tokio::test]
async fn test_overlapping_apply_is_busy() {
    let gate = Arc::new(Semaphore::new(0));
    let changes = vec![change("a", ChangeType::Rename), change("b", ChangeType::Rename)];
    let backend = Arc::new(MockChangeBackend::with_changes(changes.clone()).with_gate(gate.clone()));
    let ledger = Ledger::new(backend.clone());

    let whole = Scope::Selected(changes.clone());
    let overlapping = Scope::Selected(vec![changes[1].clone()]);
    let (first, second, ()) = tokio::join!(
        ledger.apply(&whole, BatchOptions::default().confirmed()),
        ledger.apply(&overlapping, BatchOptions::default()),
        async {
            tokio::task::yield_now().await;
            gate.add_permits(8);
        },
    );
    assert_eq!(first.unwrap().file, ChannelOutcome::Settled { affected: 2 });
    assert!(matches!(&*second.unwrap_err(), ErrorKind::Busy(Channel::File)));
    assert_eq!(backend.calls().len(), 1);

    // Claims are released once the batch settles.
    ledger.remove(&Scope::all(), BatchOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_coordinator_observes_apply() {
    let bus: BusHandle = Arc::new(BroadcastBus::new(64));
    let changes = vec![
        change("t1", ChangeType::Rename),
        change("t2", ChangeType::CoverUpdate),
        change("t3", ChangeType::TagAdd),
    ];
    let backend = Arc::new(MockChangeBackend::with_changes(changes.clone()).with_bus(bus.clone()));
    backend.fail_item("t2", "cover unreadable").await;

    let completed = Arc::new(Mutex::new(None));
    let sink = completed.clone();
    let coordinator = Arc::new(
        ProgressCoordinator::new(Channel::File.operation(), true, bus)
            .on_complete(move |stats| *sink.lock().unwrap() = Some(*stats)),
    );
    let ledger = Ledger::new(backend).with_coordinator(Channel::File, coordinator.clone());

    ledger.apply(&Scope::Selected(changes), BatchOptions::default()).await.unwrap();
    let mut settlement = coordinator.settlement();
    let settled = settlement.wait_for(Option::is_some).await.unwrap().clone();

    let expected = OperationStats { total: 3, processed: 2, skipped: 0, errors: 1 };
    assert_eq!(settled, Some(Settlement::Completed(expected)));
    assert_eq!(*completed.lock().unwrap(), Some(expected));
    assert!(coordinator.state().is_idle());
    assert!(!coordinator.is_listening());
}
