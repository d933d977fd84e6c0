//! Durable storage for a session's document.
//!
//! ```text
//! ┌───────────────┐  commits  ┌──────────────────┐   RocksDB
//! │ DocumentStore │ ────────► │ LocalPersistence │ ─────────► LocalStore
//! └───────┬───────┘           └──────────────────┘   (this machine)
//!         │ save()
//!         ▼
//! ┌───────────────┐   HTTP
//! │  RemoteStore  │ ───────► authoritative copy
//! └───────────────┘
//! ```
//!
//! The local log is a crash-recovery cache; the remote store is the
//! source of truth a fresh machine loads from.

pub mod local;
pub mod persistence;
pub mod remote;

pub use local::{LocalStore, LocalStoreConfig, ProjectMetadata, StoreError, StoredProject};
pub use persistence::{LocalPersistence, PersistenceHandle, ReplayOutcome};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteError, RemoteStore};
