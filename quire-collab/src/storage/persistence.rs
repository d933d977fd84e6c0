//! Glue between a [`DocumentStore`] and the [`LocalStore`] log.
//!
//! ```text
//!  startup:  LocalStore::load ──► apply(Restore) ──► DocumentStore
//!
//!  running:  commit ──► update observer ──► mpsc ──► writer task
//!                (skips Restore)                      │ spawn_blocking
//!                                                     ├── append
//!                                                     └── compact past threshold
//! ```
//!
//! The observer runs inside the committing transaction, so it only hands the
//! update bytes to the writer task and never touches the store itself.
//!
//! A replay that outlives its timeout is not abandoned: the load keeps running
//! and its result is merged with the `Restore` origin once it arrives. The
//! handle for that late merge is available through
//! [`LocalPersistence::take_late_replay`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quire_core::{DocumentStore, TxnOrigin};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use yrs::Subscription;

use super::local::{LocalStore, LocalStoreConfig, StoreError, StoredProject};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// No durable store is available on this machine
    MemoryOnly,
    Empty,
    Restored {
        snapshot: bool,
        updates: usize,
        /// Stored updates that no longer decode
        skipped: usize,
    },
    /// Loading took longer than allowed; it is merged later
    TimedOut,
    Failed(String),
}

impl ReplayOutcome {
    pub fn restored_anything(&self) -> bool {
        matches!(self, Self::Restored { snapshot, updates, .. } if *snapshot || *updates > 0)
    }
}

#[derive(Debug, Default)]
pub struct PersistenceStats {
    pub appended: AtomicU64,
    pub compactions: AtomicU64,
    pub failures: AtomicU64,
}

pub struct LocalPersistence {
    project_id: String,
    store: Option<Arc<LocalStore>>,
    compact_threshold: u64,
    late_replay: Mutex<Option<JoinHandle<ReplayOutcome>>>,
}

impl LocalPersistence {
    /// Open the local log under `path`; falls back to memory only when no
    /// path is given or the store cannot be opened even after a reset.
    pub fn open(project_id: impl Into<String>, path: Option<&Path>, compact_threshold: u64) -> Self {
        let project_id = project_id.into();
        let store = path.and_then(|path| {
            match LocalStore::open_or_recover(LocalStoreConfig::new(path)) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    log::warn!("Local persistence disabled for {project_id}: {e}");
                    None
                }
            }
        });
        Self {
            project_id,
            store,
            compact_threshold,
            late_replay: Mutex::new(None),
        }
    }

    pub fn memory_only(project_id: impl Into<String>) -> Self {
        Self::open(project_id, None, u64::MAX)
    }

    pub fn with_store(project_id: impl Into<String>, store: Arc<LocalStore>, compact_threshold: u64) -> Self {
        Self {
            project_id: project_id.into(),
            store: Some(store),
            compact_threshold,
            late_replay: Mutex::new(None),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<LocalStore>> {
        self.store.as_ref()
    }

    /// Load whatever this machine has for the project into `doc`.
    pub async fn replay(&self, doc: &DocumentStore, timeout: Duration) -> ReplayOutcome {
        let Some(store) = self.store.clone() else {
            return ReplayOutcome::MemoryOnly;
        };
        let project_id = self.project_id.clone();
        let mut load = tokio::task::spawn_blocking(move || store.load(&project_id));

        let finished = tokio::time::timeout(timeout, &mut load).await;
        match finished {
            Ok(loaded) => restore(doc, &self.project_id, loaded),
            Err(_) => {
                log::warn!(
                    "Local replay of {} timed out after {timeout:?}; merging it when it completes",
                    self.project_id
                );
                let doc = doc.clone();
                let project_id = self.project_id.clone();
                let late = tokio::spawn(async move { restore(&doc, &project_id, load.await) });
                *self.late_replay.lock().unwrap_or_else(|p| p.into_inner()) = Some(late);
                ReplayOutcome::TimedOut
            }
        }
    }

    /// The merge of a replay that timed out, if one is still owed.
    pub fn take_late_replay(&self) -> Option<JoinHandle<ReplayOutcome>> {
        self.late_replay.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Start logging every non-restore commit of `doc`.
    ///
    /// Returns `None` in memory-only mode.
    pub fn attach(&self, doc: &DocumentStore) -> Option<PersistenceHandle> {
        let store = self.store.clone()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let subscription = doc
            .doc()
            .observe_update_v1(move |txn, event| {
                if TxnOrigin::of(txn).persists_locally() {
                    let _ = tx.send(event.update.clone());
                }
            })
            .map_err(|e| log::error!("Cannot observe document updates: {e}"))
            .ok()?;

        let stats = Arc::new(PersistenceStats::default());
        let writer_stats = stats.clone();
        let project_id = self.project_id.clone();
        let threshold = self.compact_threshold;
        let doc = doc.clone();
        let writer = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let store = store.clone();
                let doc = doc.clone();
                let stats = writer_stats.clone();
                let id = project_id.clone();
                let written = tokio::task::spawn_blocking(move || {
                    write_update(&store, &doc, &stats, &id, &update, threshold)
                })
                .await;
                if let Err(e) = written {
                    writer_stats.failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("Persistence write for {project_id} aborted: {e}");
                }
            }
            log::debug!("Persistence writer for {project_id} stopped");
        });

        Some(PersistenceHandle {
            subscription,
            writer,
            stats,
        })
    }
}

fn restore(
    doc: &DocumentStore,
    project_id: &str,
    loaded: Result<Result<StoredProject, StoreError>, JoinError>,
) -> ReplayOutcome {
    let stored = match loaded {
        Err(e) => return ReplayOutcome::Failed(e.to_string()),
        Ok(Err(e)) => {
            log::warn!("Local replay of {project_id} failed: {e}");
            return ReplayOutcome::Failed(e.to_string());
        }
        Ok(Ok(stored)) => stored,
    };
    if stored.is_empty() {
        return ReplayOutcome::Empty;
    }

    let mut skipped = 0;
    let snapshot = match &stored.snapshot {
        Some(bytes) => match doc.apply_update(TxnOrigin::Restore, bytes) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Stored snapshot of {project_id} is unreadable: {e}");
                skipped += 1;
                false
            }
        },
        None => false,
    };
    let mut updates = 0;
    for (seq, update) in &stored.updates {
        match doc.apply_update(TxnOrigin::Restore, update) {
            Ok(()) => updates += 1,
            Err(e) => {
                log::warn!("Skipping stored update {seq} of {project_id}: {e}");
                skipped += 1;
            }
        }
    }
    log::info!("Restored {project_id} from local store ({updates} updates, snapshot: {snapshot})");
    ReplayOutcome::Restored {
        snapshot,
        updates,
        skipped,
    }
}

/// Append one update and compact once the log passes `threshold`. Blocking.
fn write_update(
    store: &LocalStore,
    doc: &DocumentStore,
    stats: &PersistenceStats,
    project_id: &str,
    update: &[u8],
    threshold: u64,
) {
    let seq = match store.append(project_id, update) {
        Ok(seq) => seq,
        Err(e) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to persist update of {project_id}: {e}");
            return;
        }
    };
    stats.appended.fetch_add(1, Ordering::Relaxed);

    if store.update_count(project_id).unwrap_or(0) >= threshold {
        // The snapshot is taken after `seq` committed, so it covers it.
        let snapshot = doc.encode_state();
        match store.compact(project_id, &snapshot, seq) {
            Ok(_) => {
                stats.compactions.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Compaction of {project_id} failed: {e}");
            }
        }
    }
}

/// Keeps the update observer alive; dropping it stops logging.
pub struct PersistenceHandle {
    subscription: Subscription,
    writer: JoinHandle<()>,
    stats: Arc<PersistenceStats>,
}

impl PersistenceHandle {
    pub fn appended(&self) -> u64 {
        self.stats.appended.load(Ordering::Relaxed)
    }

    pub fn compactions(&self) -> u64 {
        self.stats.compactions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    /// Stop observing and wait until every queued update is written.
    pub async fn close(self) {
        let Self { subscription, writer, .. } = self;
        drop(subscription);
        if let Err(e) = writer.await {
            log::warn!("Persistence writer ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::ops::NewPage;
    use tempfile::tempdir;

    async fn settle(handle: &PersistenceHandle, appended: u64) {
        for _ in 0..100 {
            if handle.appended() >= appended {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} of {appended} updates persisted", handle.appended());
    }

    #[tokio::test]
    async fn test_memory_only() {
        let persistence = LocalPersistence::memory_only("p1");
        let doc = DocumentStore::new("p1");
        assert!(!persistence.is_persistent());
        assert!(persistence.attach(&doc).is_none());
        assert_eq!(
            persistence.replay(&doc, Duration::from_secs(1)).await,
            ReplayOutcome::MemoryOnly
        );
    }

    #[tokio::test]
    async fn test_edits_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let persistence = LocalPersistence::open("p1", Some(&path), 1_000);
            let doc = DocumentStore::new("p1");
            assert_eq!(
                persistence.replay(&doc, Duration::from_secs(1)).await,
                ReplayOutcome::Empty
            );
            let handle = persistence.attach(&doc).unwrap();
            doc.create_page(TxnOrigin::Local, NewPage::root().with_id("a")).unwrap();
            doc.create_page(TxnOrigin::Remote, NewPage::root().with_id("b")).unwrap();
            settle(&handle, 2).await;
            handle.close().await;
        }

        let persistence = LocalPersistence::open("p1", Some(&path), 1_000);
        let doc = DocumentStore::new("p1");
        let outcome = persistence.replay(&doc, Duration::from_secs(1)).await;
        assert_eq!(outcome, ReplayOutcome::Restored { snapshot: false, updates: 2, skipped: 0 });
        assert!(outcome.restored_anything());
        assert!(doc.page("a").is_some());
        assert!(doc.page("b").is_some());
    }

    #[tokio::test]
    async fn test_restore_commits_are_not_logged_again() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(LocalStoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let persistence = LocalPersistence::with_store("p1", store.clone(), 1_000);

        let source = DocumentStore::new("p1");
        source.create_page(TxnOrigin::Local, NewPage::root().with_id("a")).unwrap();
        store.append("p1", &source.encode_state()).unwrap();

        let doc = DocumentStore::new("p1");
        let handle = persistence.attach(&doc).unwrap();
        persistence.replay(&doc, Duration::from_secs(1)).await;
        doc.create_page(TxnOrigin::Local, NewPage::root().with_id("b")).unwrap();
        settle(&handle, 1).await;
        handle.close().await;

        assert_eq!(store.update_count("p1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_compaction_past_threshold() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(LocalStoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let persistence = LocalPersistence::with_store("p1", store.clone(), 3);
        let doc = DocumentStore::new("p1");
        let handle = persistence.attach(&doc).unwrap();

        for i in 0..4 {
            doc.create_page(TxnOrigin::Local, NewPage::root().with_id(format!("p{i}"))).unwrap();
        }
        settle(&handle, 4).await;
        assert!(handle.compactions() >= 1);
        handle.close().await;

        let loaded = store.load("p1").unwrap();
        assert!(loaded.snapshot.is_some());
        assert!(loaded.updates.len() < 4);

        let restored = DocumentStore::new("p1");
        persistence.replay(&restored, Duration::from_secs(1)).await;
        assert_eq!(restored.page_count(), 4);
    }

    #[tokio::test]
    async fn test_timed_out_replay_is_merged_late() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(LocalStoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let source = DocumentStore::new("p1");
        for i in 0..200 {
            source.create_page(TxnOrigin::Local, NewPage::root().with_id(format!("p{i}"))).unwrap();
            store.append("p1", &source.encode_state()).unwrap();
        }

        let persistence = LocalPersistence::with_store("p1", store, 1_000);
        let doc = DocumentStore::new("p1");
        let outcome = persistence.replay(&doc, Duration::ZERO).await;
        match outcome {
            ReplayOutcome::TimedOut => {
                let late = persistence.take_late_replay().expect("late replay pending");
                assert!(late.await.unwrap().restored_anything());
            }
            other => assert!(other.restored_anything()),
        }
        assert!(persistence.take_late_replay().is_none());
        assert_eq!(doc.page_count(), 200);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_writer_runs_off_the_async_thread() {
        let dir = tempdir().unwrap();
        let persistence = LocalPersistence::open("p1", Some(&dir.path().join("db")), 1_000);
        let doc = DocumentStore::new("p1");
        let handle = persistence.attach(&doc).unwrap();
        for i in 0..20 {
            doc.create_page(TxnOrigin::Local, NewPage::root().with_id(format!("p{i}"))).unwrap();
        }
        settle(&handle, 20).await;
        assert_eq!(handle.failures(), 0);
        handle.close().await;
        assert_eq!(persistence.store().unwrap().update_count("p1").unwrap(), 20);
    }

    #[tokio::test]
    async fn test_corrupt_update_is_skipped() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(LocalStoreConfig::for_testing(dir.path().join("db"))).unwrap());
        store.append("p1", &[0xFF, 0xFF, 0xFF]).unwrap();
        let source = DocumentStore::new("p1");
        source.create_page(TxnOrigin::Local, NewPage::root().with_id("a")).unwrap();
        store.append("p1", &source.encode_state()).unwrap();

        let persistence = LocalPersistence::with_store("p1", store, 1_000);
        let doc = DocumentStore::new("p1");
        assert_eq!(
            persistence.replay(&doc, Duration::from_secs(1)).await,
            ReplayOutcome::Restored { snapshot: false, updates: 1, skipped: 1 }
        );
        assert!(doc.page("a").is_some());
    }
}
