//! Undo history over the locally originated edits of one session.
//!
//! The scope covers all three document roots. Only transactions tagged
//! [`TxnOrigin::Local`] are captured; edits committed within the capture
//! window of each other collapse into a single step.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use quire_core::{DocumentStore, TxnOrigin};
use yrs::undo::Options;
use yrs::UndoManager;

pub struct UndoScope {
    manager: Mutex<UndoManager>,
}

impl UndoScope {
    pub fn attach(store: &DocumentStore, capture_window: Duration) -> Self {
        let options = Options {
            capture_timeout_millis: capture_window.as_millis() as u64,
            ..Options::default()
        };
        let mut manager = UndoManager::with_options(store.doc(), options);
        manager.expand_scope(store.navigation_ref());
        manager.expand_scope(store.metadata_ref());
        manager.expand_scope(store.assets_ref());
        manager.include_origin(TxnOrigin::Local.to_origin());
        Self {
            manager: Mutex::new(manager),
        }
    }

    /// Revert the last step. Returns `false` when there was nothing to undo.
    pub fn undo(&self) -> bool {
        let mut manager = self.lock();
        if !manager.can_undo() {
            return false;
        }
        manager.undo_blocking()
    }

    pub fn redo(&self) -> bool {
        let mut manager = self.lock();
        if !manager.can_redo() {
            return false;
        }
        manager.redo_blocking()
    }

    pub fn can_undo(&self) -> bool {
        self.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.lock().can_redo()
    }

    /// Forget both stacks.
    pub fn clear(&self) {
        self.lock().clear();
        log::debug!("Undo history cleared");
    }

    fn lock(&self) -> MutexGuard<'_, UndoManager> {
        self.manager.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
