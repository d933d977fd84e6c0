//! # quire-collab — Synchronization core for Quire projects
//!
//! Keeps a [`quire_core::DocumentStore`] replicated between sessions,
//! persisted on this machine and saved to the authoritative store.
//!
//! ## Architecture
//!
//! ```text
//!                ┌────────────────┐   ws (bincode)   ┌─────────────┐
//!                │ RelayTransport │ ◄──────────────► │ RelayServer │
//!                └───────▲────────┘                  │ (stateless) │
//!                        │                           └─────────────┘
//! ┌──────────────┐  ┌────┴───────────┐  ┌────────────────┐
//! │ PresenceRoom │◄─┤ SyncController ├─►│ SaveController │──► RemoteStore
//! │   + locks    │  └────┬───────────┘  └────────────────┘      (HTTP)
//! └──────────────┘       │
//!          ┌─────────────┼──────────────┬──────────────────┐
//!          ▼             ▼              ▼                  ▼
//!   DocumentStore   UndoScope   ChangeReconciler   LocalPersistence
//!                                 (ViewRenderer)      (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — bincode relay frames
//! - [`relay`] / [`broadcast`] — stateless room fan-out server
//! - [`transport`] — session side of the relay, with offline queue
//! - [`presence`] / [`locks`] — ephemeral presence and advisory locks
//! - [`storage`] — local update log and the authoritative remote store
//! - [`save`] — dirty tracking and explicit saves
//! - [`undo`] — undo history of local edits
//! - [`reconcile`] — classified change notifications for the view
//! - [`session`] — the sync controller wiring it all together
//! - [`config`] — session timing and capacity knobs

pub mod broadcast;
pub mod config;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod save;
pub mod session;
pub mod storage;
pub mod transport;
pub mod undo;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::SyncConfig;
pub use locks::{LockError, LockEvent, LockState, LockTable};
pub use presence::{session_color, PresenceChange, PresenceMessage, PresenceRoom, PresenceState};
pub use protocol::{room_for, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use reconcile::{Change, ChangeKind, ChangeNotification, ChangeReconciler, ReconcileStats, ViewRenderer};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use save::{SaveController, SaveError, SaveIndicator, SaveStatus};
pub use session::{InitOptions, RemoteLoad, SessionError, SessionStatus, SyncController};
pub use storage::{
    HttpRemoteStore, LocalPersistence, LocalStore, LocalStoreConfig, MemoryRemoteStore,
    PersistenceHandle, RemoteError, RemoteStore, ReplayOutcome, StoreError,
};
pub use transport::{ConnectionState, OfflineQueue, RelayEvent, RelayTransport};
pub use undo::UndoScope;
