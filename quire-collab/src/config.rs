//! Session configuration.
//!
//! Every timing knob of the sync pipeline lives here so tests can shrink
//! them with [`SyncConfig::for_testing`]. Hosts usually load the config from
//! JSON; missing fields fall back to [`Default`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::room_for;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Project the session edits; also names the relay room
    pub project_id: String,
    /// `ws://host:port` of the relay; `None` runs offline
    pub relay_url: Option<String>,
    /// RocksDB directory for the local update log; `None` keeps memory only
    pub storage_path: Option<PathBuf>,
    /// Name shown to other sessions
    pub display_name: String,
    /// Skip the initial peer sync (single-user or tests)
    pub skip_sync_wait: bool,

    pub local_replay_timeout_ms: u64,
    /// How long to listen for presence before deciding who bootstraps
    pub presence_window_ms: u64,
    /// Upper bound on waiting for a peer's full-state answer
    pub sync_timeout_ms: u64,
    /// How long a non-elected session waits for the bootstrap page
    pub bootstrap_wait_ms: u64,
    pub presence_heartbeat_ms: u64,
    /// Presence entries older than this are dropped, releasing their locks
    pub presence_timeout_ms: u64,
    /// Edits closer together than this merge into one undo step
    pub undo_capture_ms: u64,
    /// Trailing-edge debounce of page reloads and navigation refreshes
    pub reconcile_debounce_ms: u64,

    /// Deltas kept while the relay is unreachable
    pub offline_queue_capacity: usize,
    /// Logged updates before the local store folds them into a snapshot
    pub compact_threshold: u64,
    pub remote_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            relay_url: None,
            storage_path: None,
            display_name: "Anonymous".to_string(),
            skip_sync_wait: false,
            local_replay_timeout_ms: 3_000,
            presence_window_ms: 300,
            sync_timeout_ms: 5_000,
            bootstrap_wait_ms: 1_500,
            presence_heartbeat_ms: 5_000,
            presence_timeout_ms: 15_000,
            undo_capture_ms: 500,
            reconcile_debounce_ms: 30,
            offline_queue_capacity: 10_000,
            compact_threshold: 500,
            remote_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Short timers for tests.
    pub fn for_testing(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            local_replay_timeout_ms: 1_000,
            presence_window_ms: 100,
            sync_timeout_ms: 1_000,
            bootstrap_wait_ms: 500,
            presence_heartbeat_ms: 200,
            presence_timeout_ms: 1_000,
            undo_capture_ms: 0,
            reconcile_debounce_ms: 10,
            offline_queue_capacity: 1_000,
            compact_threshold: 50,
            remote_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_relay(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn room(&self) -> String {
        room_for(&self.project_id)
    }

    pub fn local_replay_timeout(&self) -> Duration {
        Duration::from_millis(self.local_replay_timeout_ms)
    }

    pub fn presence_window(&self) -> Duration {
        Duration::from_millis(self.presence_window_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn bootstrap_wait(&self) -> Duration {
        Duration::from_millis(self.bootstrap_wait_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn undo_capture(&self) -> Duration {
        Duration::from_millis(self.undo_capture_ms)
    }

    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}
