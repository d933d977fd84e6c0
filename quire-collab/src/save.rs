//! Dirty tracking and explicit saves to the authoritative store.
//!
//! ```text
//!          edit (Local | Remote)          save() ok
//!  Clean ────────────────────────► Dirty ──────────► Saving ──► Clean
//!    ▲                                                  │
//!    └───────────── save() ok ◄──── Error ◄── failure ──┘
//! ```
//!
//! Every dirtying commit bumps a revision counter. A save remembers the
//! revision it serialized and only that revision becomes "saved", so edits
//! that land while the upload is in flight keep the document dirty.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use quire_core::{DocumentStore, TxnOrigin};
use thiserror::Error;
use tokio::task::JoinHandle;
use yrs::Subscription;

use crate::storage::{RemoteError, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Clean,
    Dirty,
    Saving,
    Error,
}

/// What the status bar shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveIndicator {
    Saving,
    Saved,
    Error,
    Offline,
}

impl SaveIndicator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saving => "saving",
            Self::Saved => "saved",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SaveIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    #[error("save already in progress")]
    InProgress,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Clears the in-flight flag even if the save future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SaveController {
    store: DocumentStore,
    remote: Arc<dyn RemoteStore>,
    revision: Arc<AtomicU64>,
    saved_revision: AtomicU64,
    saving: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_saved_at: Mutex<Option<SystemTime>>,
    subscription: Mutex<Option<Subscription>>,
}

impl SaveController {
    pub fn new(store: DocumentStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            remote,
            revision: Arc::new(AtomicU64::new(0)),
            saved_revision: AtomicU64::new(0),
            saving: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_saved_at: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    /// Start counting dirtying commits. Calling it again is a no-op.
    pub fn attach(&self) {
        let mut slot = lock(&self.subscription);
        if slot.is_some() {
            return;
        }
        let revision = self.revision.clone();
        match self.store.doc().observe_update_v1(move |txn, _| {
            if TxnOrigin::of(txn).marks_dirty() {
                revision.fetch_add(1, Ordering::SeqCst);
            }
        }) {
            Ok(subscription) => *slot = Some(subscription),
            Err(e) => log::error!("Dirty tracking unavailable: {e}"),
        }
    }

    pub fn mark_dirty(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.revision.load(Ordering::SeqCst) != self.saved_revision.load(Ordering::SeqCst)
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SaveStatus {
        if self.is_saving() {
            SaveStatus::Saving
        } else if lock(&self.last_error).is_some() {
            SaveStatus::Error
        } else if self.is_dirty() {
            SaveStatus::Dirty
        } else {
            SaveStatus::Clean
        }
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn last_saved_at(&self) -> Option<SystemTime> {
        *lock(&self.last_saved_at)
    }

    pub fn indicator(&self, connected: bool) -> SaveIndicator {
        match self.status() {
            SaveStatus::Saving => SaveIndicator::Saving,
            SaveStatus::Error => SaveIndicator::Error,
            _ if !connected => SaveIndicator::Offline,
            _ => SaveIndicator::Saved,
        }
    }

    /// Push a full snapshot to the remote store.
    ///
    /// A call made while another save is running is rejected, not queued.
    pub async fn save(&self) -> Result<(), SaveError> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return Err(SaveError::InProgress);
        }
        let _in_flight = InFlight(&self.saving);

        let revision = self.revision.load(Ordering::SeqCst);
        let snapshot = self.store.encode_state();
        match self.remote.save(self.store.project_id(), snapshot).await {
            Ok(()) => {
                self.saved_revision.fetch_max(revision, Ordering::SeqCst);
                *lock(&self.last_saved_at) = Some(SystemTime::now());
                *lock(&self.last_error) = None;
                Ok(())
            }
            Err(e) => {
                log::warn!("Save of {} failed: {e}", self.store.project_id());
                *lock(&self.last_error) = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Fire-and-forget save for page exit.
    pub fn flush_on_exit(self: &Arc<Self>) -> JoinHandle<Result<(), SaveError>> {
        let controller = self.clone();
        tokio::spawn(async move { controller.save().await })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
