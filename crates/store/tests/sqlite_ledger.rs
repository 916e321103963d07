use folio_ledger::error::ErrorKind;
use folio_ledger::{
    BatchOptions, ChangeFilter, ChangeStatus, ChangeType, Channel, ChannelOutcome, Ledger, PendingChange, Scope,
};
use folio_progress::{BroadcastBus, BusHandle, OperationStats, ProgressCoordinator, Settlement};
use folio_store::{ChangeRepository, Database, LocalExecutor, SqliteChangeBackend};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    repo: ChangeRepository,
    ledger: Ledger,
    coordinator: Arc<ProgressCoordinator>,
}

async fn harness(changes: &[PendingChange]) -> Harness {
    let db = Database::connect_in_memory().await.unwrap();
    let repo = ChangeRepository::from(&db);
    for change in changes {
        repo.insert(change).await.unwrap();
    }
    let bus: BusHandle = Arc::new(BroadcastBus::new(64));
    let backend = SqliteChangeBackend::new(repo.clone(), Arc::new(LocalExecutor)).with_bus(bus.clone());
    let coordinator = Arc::new(ProgressCoordinator::new(Channel::File.operation(), true, bus));
    let ledger = Ledger::new(Arc::new(backend)).with_coordinator(Channel::File, coordinator.clone());
    Harness { repo, ledger, coordinator }
}

/// Changes are created a second apart so they list in the order given.
fn staged(changes: Vec<PendingChange>) -> Vec<PendingChange> {
    let count = changes.len() as u64;
    changes
        .into_iter()
        .enumerate()
        .map(|(index, mut change)| {
            change.created_at -= Duration::from_secs(count - index as u64);
            change
        })
        .collect()
}

fn write(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_mixed_batch_against_the_filesystem() {
    let dir = TempDir::new().unwrap();
    let library = dir.path().join("library");
    let device = dir.path().join("device");
    write(&library.join("inbox/dune.epub"), b"dune");
    write(&library.join("old.epub"), b"old");

    let changes = staged(vec![
        PendingChange::new(ChangeType::Rename)
            .with_id("t1")
            .with_paths(Some(library.join("inbox/dune.epub")), Some(library.join("Herbert/Dune.epub"))),
        // The source was never downloaded, so the copy fails.
        PendingChange::new(ChangeType::DeviceAdd)
            .with_id("t2")
            .with_device("kobo")
            .with_paths(Some(library.join("missing.epub")), Some(device.join("missing.epub"))),
        PendingChange::new(ChangeType::Delete).with_id("t3").with_paths(Some(library.join("old.epub")), None),
    ]);
    let Harness { repo, ledger, coordinator } = harness(&changes).await;

    let scope = Scope::Selected(changes);
    let err = ledger.apply(&scope, BatchOptions::default()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::ConfirmationRequired(1)));

    let report = ledger.apply(&scope, BatchOptions::default().confirmed()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 2 });
    assert_eq!(report.device, ChannelOutcome::Settled { affected: 1 });

    assert_eq!(repo.require("t1").await.unwrap().status, ChangeStatus::Applied);
    let t2 = repo.require("t2").await.unwrap();
    assert_eq!(t2.status, ChangeStatus::Error);
    assert!(t2.error.unwrap().starts_with("I/O error"));
    assert_eq!(repo.require("t3").await.unwrap().status, ChangeStatus::Applied);
    assert!(repo.list(Some(ChangeStatus::Pending)).await.unwrap().is_empty());

    assert_eq!(std::fs::read(library.join("Herbert/Dune.epub")).unwrap(), b"dune");
    assert!(!library.join("old.epub").exists());

    let settled = coordinator.settlement().wait_for(Option::is_some).await.unwrap().clone();
    let expected = OperationStats { total: 2, processed: 2, skipped: 0, errors: 0 };
    assert_eq!(settled, Some(Settlement::Completed(expected)));
}

#[tokio::test]
async fn test_wildcard_remove_keeps_history() {
    let changes = staged(vec![
        PendingChange::new(ChangeType::TagAdd).with_id("tag"),
        PendingChange::new(ChangeType::DeviceRemove).with_id("kobo-1").with_device("kobo"),
        PendingChange::new(ChangeType::DeviceRemove).with_id("kindle-1").with_device("kindle"),
    ]);
    let Harness { repo, ledger, .. } = harness(&changes).await;

    // Catalog-only changes cannot run locally; they settle as errors, not pending.
    let files = Scope::Matching(ChangeFilter::default().channel(Channel::File));
    let report = ledger.apply(&files, BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 1 });
    assert_eq!(report.device, ChannelOutcome::Skipped);
    assert_eq!(repo.require("tag").await.unwrap().error.as_deref(), Some("unsupported change type: tag_add"));

    let kobo_only = Scope::Matching(ChangeFilter::default().device("kobo"));
    let report = ledger.remove(&kobo_only, BatchOptions::default()).await.unwrap();
    assert_eq!(report.device, ChannelOutcome::Settled { affected: 1 });
    assert!(repo.get("kobo-1").await.unwrap().is_none());

    let report = ledger.remove(&Scope::all(), BatchOptions::default()).await.unwrap();
    assert_eq!(report.file, ChannelOutcome::Settled { affected: 0 });
    assert_eq!(report.device, ChannelOutcome::Settled { affected: 1 });
    let remaining: Vec<_> = repo.list(None).await.unwrap().into_iter().map(|c| c.id.as_str().to_string()).collect();
    assert_eq!(remaining, ["tag"]);
}
