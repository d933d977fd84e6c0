//! Advisory per-component locks derived from presence.
//!
//! A session holds a lock by advertising the component in its
//! `editing_component` presence field. Nothing here blocks the merge; locks
//! only tell the editing UI who is typing where.
//!
//! ```text
//!   unlocked ──request──► locked-by-self ──release──► unlocked
//!      ▲                                     │
//!      └── holder's presence expires/leaves  └── contention lost (higher id)
//! ```

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::presence::{PresenceMessage, PresenceRoom};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockedBySelf,
    LockedByOther(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired(String),
    Released(String),
    /// Another session claimed the same component and won the tie-break.
    Lost { component_id: String, holder: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("component {component_id} is being edited by {holder}")]
    HeldByOther { component_id: String, holder: Uuid },
}

/// Point-in-time view of every lock in the room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockTable {
    local: Uuid,
    holders: HashMap<String, Uuid>,
}

impl LockTable {
    pub fn state(&self, component_id: &str) -> LockState {
        match self.holders.get(component_id) {
            None => LockState::Unlocked,
            Some(holder) if *holder == self.local => LockState::LockedBySelf,
            Some(holder) => LockState::LockedByOther(*holder),
        }
    }

    pub fn holder(&self, component_id: &str) -> Option<Uuid> {
        self.holders.get(component_id).copied()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

impl PresenceRoom {
    /// Live remote session claiming `component_id`, lowest id first.
    fn remote_holder(&self, component_id: &str) -> Option<Uuid> {
        self.peers()
            .filter(|p| p.editing_component.as_deref() == Some(component_id))
            .map(|p| p.session_id)
            .min()
    }

    pub fn lock_state(&self, component_id: &str) -> LockState {
        if self.local().editing_component.as_deref() == Some(component_id) {
            return LockState::LockedBySelf;
        }
        match self.remote_holder(component_id) {
            Some(holder) => LockState::LockedByOther(holder),
            None => LockState::Unlocked,
        }
    }

    /// Claim `component_id`, releasing any other claim this session holds.
    ///
    /// Returns the presence update to broadcast.
    pub fn request_lock(&mut self, component_id: &str) -> Result<PresenceMessage, LockError> {
        if let Some(holder) = self.remote_holder(component_id) {
            return Err(LockError::HeldByOther {
                component_id: component_id.to_string(),
                holder,
            });
        }
        Ok(self.set_editing(Some(component_id.to_string())))
    }

    /// Drop the current claim, if any.
    pub fn release_lock(&mut self) -> Option<(String, PresenceMessage)> {
        let component_id = self.local().editing_component.clone()?;
        Some((component_id, self.set_editing(None)))
    }

    /// Settle a concurrent claim on the component this session is editing.
    ///
    /// The lower session id keeps the lock. When this session loses, its
    /// claim is dropped and the presence update to broadcast is returned.
    pub fn resolve_lock_contention(&mut self) -> Option<(LockEvent, PresenceMessage)> {
        let component_id = self.local().editing_component.clone()?;
        let holder = self.remote_holder(&component_id)?;
        if holder > self.session_id() {
            return None;
        }
        log::info!("Lock on {component_id} lost to {holder}");
        let msg = self.set_editing(None);
        Some((LockEvent::Lost { component_id, holder }, msg))
    }

    pub fn lock_table(&self) -> LockTable {
        let mut holders: HashMap<String, Uuid> = HashMap::new();
        for peer in self.peers() {
            if let Some(component) = &peer.editing_component {
                holders
                    .entry(component.clone())
                    .and_modify(|h| *h = (*h).min(peer.session_id))
                    .or_insert(peer.session_id);
            }
        }
        if let Some(component) = &self.local().editing_component {
            holders
                .entry(component.clone())
                .and_modify(|h| *h = (*h).min(self.session_id()))
                .or_insert(self.session_id());
        }
        LockTable {
            local: self.session_id(),
            holders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceChange, PresenceState};
    use std::time::{Duration, Instant};

    fn ordered_ids() -> (Uuid, Uuid) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        if a < b { (a, b) } else { (b, a) }
    }

    fn room(id: Uuid) -> PresenceRoom {
        PresenceRoom::new(PresenceState::new(id, "s"), Duration::from_secs(15))
    }

    #[test]
    fn test_request_and_release() {
        let mut a = room(Uuid::new_v4());
        assert_eq!(a.lock_state("c1"), LockState::Unlocked);

        let msg = a.request_lock("c1").unwrap();
        assert!(matches!(msg, PresenceMessage::Update(ref s) if s.editing_component.as_deref() == Some("c1")));
        assert_eq!(a.lock_state("c1"), LockState::LockedBySelf);

        let (released, _) = a.release_lock().unwrap();
        assert_eq!(released, "c1");
        assert_eq!(a.lock_state("c1"), LockState::Unlocked);
        assert!(a.release_lock().is_none());
    }

    #[test]
    fn test_denied_while_holder_live_then_granted() {
        let (id_a, id_b) = ordered_ids();
        let mut a = room(id_a);
        let mut b = room(id_b);

        let claim = a.request_lock("c1").unwrap();
        b.handle_message(&claim);

        assert_eq!(
            b.request_lock("c1"),
            Err(LockError::HeldByOther { component_id: "c1".into(), holder: id_a })
        );
        assert_eq!(b.lock_state("c1"), LockState::LockedByOther(id_a));

        assert_eq!(b.handle_message(&a.leave_message()), PresenceChange::Left(id_a));
        assert!(b.request_lock("c1").is_ok());
    }

    #[test]
    fn test_lock_expires_with_presence() {
        let (id_a, id_b) = ordered_ids();
        let mut a = room(id_a);
        let mut b = room(id_b);
        let start = Instant::now();
        b.handle_message_at(&a.request_lock("c1").unwrap(), start);

        b.prune_expired_at(start + Duration::from_secs(16));
        assert_eq!(b.lock_state("c1"), LockState::Unlocked);
    }

    #[test]
    fn test_contention_lower_id_wins() {
        let (low, high) = ordered_ids();
        let mut low_room = room(low);
        let mut high_room = room(high);

        let low_claim = low_room.request_lock("c1").unwrap();
        let high_claim = high_room.request_lock("c1").unwrap();
        low_room.handle_message(&high_claim);
        high_room.handle_message(&low_claim);

        assert!(low_room.resolve_lock_contention().is_none());
        let (event, _) = high_room.resolve_lock_contention().unwrap();
        assert_eq!(event, LockEvent::Lost { component_id: "c1".into(), holder: low });
        assert_eq!(high_room.lock_state("c1"), LockState::LockedByOther(low));
        assert_eq!(low_room.lock_state("c1"), LockState::LockedBySelf);
    }

    #[test]
    fn test_lock_table() {
        let (id_a, id_b) = ordered_ids();
        let mut a = room(id_a);
        let mut b = room(id_b);
        a.request_lock("c1").unwrap();
        a.handle_message(&b.request_lock("c2").unwrap());

        let table = a.lock_table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.state("c1"), LockState::LockedBySelf);
        assert_eq!(table.state("c2"), LockState::LockedByOther(id_b));
        assert_eq!(table.state("c3"), LockState::Unlocked);
    }
}
