//! Durability across session restarts and machines.

use std::sync::Arc;

use quire_collab::config::SyncConfig;
use quire_collab::session::{InitOptions, RemoteLoad, SyncController};
use quire_collab::storage::{LocalStore, LocalStoreConfig, MemoryRemoteStore, ReplayOutcome};
use quire_core::{ImportBatch, ImportPage, NewPage, TxnOrigin};
use tempfile::tempdir;

async fn start(config: SyncConfig, remote: Arc<MemoryRemoteStore>) -> SyncController {
    SyncController::initialize(config, remote, InitOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_edits_survive_restart() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let config = SyncConfig::for_testing("p1").with_storage(dir.path().join("db"));

    let first = start(config.clone(), remote.clone()).await;
    let root = first.store().root_pages()[0].id.clone();
    for i in 0..5 {
        first
            .store()
            .create_page(TxnOrigin::Local, NewPage::child_of(root.clone()).with_id(format!("c{i}")))
            .unwrap();
    }
    first.shutdown().await;
    drop(first);

    let second = start(config, remote).await;
    assert!(matches!(second.status().local_replay, ReplayOutcome::Restored { .. }));
    assert_eq!(second.store().page_count(), 6);
    let children: Vec<f64> = second.store().children(Some(root.as_str())).iter().map(|p| p.order).collect();
    assert_eq!(children, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    // Restored state is neither dirty nor undoable
    assert!(!second.saves().is_dirty());
    assert!(!second.can_undo());
}

#[tokio::test]
async fn test_compaction_keeps_document_whole() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let remote = Arc::new(MemoryRemoteStore::new());
    let config = SyncConfig::for_testing("p1").with_storage(path.clone());
    let threshold = config.compact_threshold;

    let first = start(config.clone(), remote.clone()).await;
    for i in 0..threshold + 10 {
        first
            .store()
            .create_page(TxnOrigin::Local, NewPage::root().with_id(format!("p{i}")))
            .unwrap();
    }
    first.shutdown().await;
    drop(first);

    {
        let store = LocalStore::open(LocalStoreConfig::new(&path)).unwrap();
        let meta = store.metadata("p1").unwrap();
        assert!(meta.compactions >= 1);
        assert!(meta.update_count < threshold);
    }

    let second = start(config, remote).await;
    assert_eq!(second.store().page_count() as u64, threshold + 11);
}

#[tokio::test]
async fn test_unusable_storage_degrades_to_memory_only() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"occupied").unwrap();

    let config = SyncConfig::for_testing("p1").with_storage(file.join("db"));
    let session = start(config, Arc::new(MemoryRemoteStore::new())).await;

    assert!(session.status().memory_only);
    assert!(!session.is_persistent());
    assert_eq!(session.status().local_replay, ReplayOutcome::MemoryOnly);
    assert_eq!(session.store().page_count(), 1);
}

#[tokio::test]
async fn test_saved_project_opens_on_fresh_machine() {
    let remote = Arc::new(MemoryRemoteStore::new());

    let author = start(SyncConfig::for_testing("p1"), remote.clone()).await;
    let batch = ImportBatch {
        pages: vec![
            ImportPage::new("intro", None),
            ImportPage::new("details", Some("intro")),
            ImportPage::new("appendix", Some("details")),
        ],
        ..ImportBatch::default()
    };
    let report = author.store().import(TxnOrigin::Local, batch).unwrap();
    assert_eq!(report.pages, 3);
    author.save().await.unwrap();

    let dir = tempdir().unwrap();
    let reader = start(SyncConfig::for_testing("p1").with_storage(dir.path()), remote).await;
    assert!(matches!(reader.status().remote_load, RemoteLoad::Loaded { .. }));
    assert_eq!(reader.status().bootstrapped, None);
    assert_eq!(reader.store().page_count(), 4);
    assert_eq!(
        reader.store().page("appendix").unwrap().parent_id.as_deref(),
        Some("details")
    );
}
