//! Transaction provenance tags.
//!
//! Every mutation entry point takes a [`TxnOrigin`]; subscribers read it back
//! from the committed transaction to decide whether a change is undoable,
//! marks the document dirty, or has to be forwarded to peers.
//!
//! ```text
//!            dirty   undo   relay   local log
//! Local        ✓      ✓       ✓        ✓
//! Remote       ✓      ·       ·        ✓
//! System       ·      ·       ✓        ✓
//! Restore      ·      ·       ·        ·
//! ```

use serde::{Deserialize, Serialize};
use yrs::{Origin, TransactionMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnOrigin {
    /// Edit made by the user of this session.
    Local,
    /// Delta received from a peer through the relay.
    Remote,
    /// Bootstrap, or a snapshot loaded from the authoritative store.
    System,
    /// Replay of the local durable store at startup.
    Restore,
}

impl TxnOrigin {
    pub const ALL: [TxnOrigin; 4] = [Self::Local, Self::Remote, Self::System, Self::Restore];

    /// Wire tag stored on the transaction.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Local => "quire/local",
            Self::Remote => "quire/remote",
            Self::System => "quire/system",
            Self::Restore => "quire/restore",
        }
    }

    pub fn to_origin(self) -> Origin {
        Origin::from(self.tag())
    }

    /// Match a raw transaction origin against the known tags.
    pub fn from_origin(origin: &Origin) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.to_origin() == *origin)
    }

    /// Classify a committed transaction.
    ///
    /// Untagged transactions and the undo scope's own transactions are
    /// treated as local edits.
    pub fn of(txn: &TransactionMut) -> Self {
        txn.origin()
            .and_then(Self::from_origin)
            .unwrap_or(Self::Local)
    }

    pub fn marks_dirty(self) -> bool {
        matches!(self, Self::Local | Self::Remote)
    }

    pub fn is_undoable(self) -> bool {
        self == Self::Local
    }

    pub fn forwards_to_relay(self) -> bool {
        matches!(self, Self::Local | Self::System)
    }

    pub fn persists_locally(self) -> bool {
        self != Self::Restore
    }

    pub fn is_remote(self) -> bool {
        self == Self::Remote
    }
}
