//! # quire-core — Replicated document model for Quire projects
//!
//! A project is one merge document holding a flat page list, nested blocks
//! and components, document metadata and an asset index. Everything that
//! mutates it goes through [`DocumentStore`], which tags each transaction
//! with a [`TxnOrigin`] so sync, persistence and undo can tell edits apart.
//!
//! ```text
//!   importer ──┐                         ┌──► relay (Local, System)
//!   editor  ───┼─► DocumentStore::apply ─┼──► local log (all but Restore)
//!   peers   ───┘     (one txn/batch)     └──► undo scope (Local only)
//! ```
//!
//! ## Modules
//!
//! - [`document`] — the store, validated structural transactions, reads
//! - [`ops`] — structural operations and their builders
//! - [`import`] — atomic bulk import of an external page tree
//! - [`model`] — owned snapshot types
//! - [`origin`] — transaction provenance tags
//! - [`value`] — JSON ↔ merge-primitive value conversion

pub mod document;
pub mod error;
pub mod import;
pub mod model;
pub mod ops;
pub mod origin;
pub mod value;

pub use document::{entity_id, resolve_path, DocumentStore, EntityPath, BOOTSTRAP_TITLE};
pub use error::{DocError, DocResult};
pub use import::{ImportBatch, ImportBlock, ImportComponent, ImportPage, ImportReport};
pub use model::{
    asset_uri, meta, AssetDescriptor, Block, Component, Metadata, Page, PageNode, Properties,
};
pub use ops::{NewBlock, NewComponent, NewPage, StructuralOp};
pub use origin::TxnOrigin;
