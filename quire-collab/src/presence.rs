//! Ephemeral per-session presence.
//!
//! Presence never touches the replicated document. Each session owns its
//! [`PresenceState`] and re-broadcasts it on a heartbeat; everyone else keeps
//! a read-only copy that expires when the heartbeats stop.
//!
//! ```text
//! local edit focus ──► PresenceRoom::set_editing() ──► PresenceMessage::Update
//!                                                          │ (relay)
//!                                                          ▼
//!                      remote PresenceRoom::handle_message()
//!                             │
//!                             ├── last_seen refreshed
//!                             └── prune_expired() after `timeout`
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Colour
// ───────────────────────────────────────────────────────────────────

/// Stable, visually distinct CSS colour for a session.
pub fn session_color(session_id: Uuid) -> String {
    let hue = session_id.as_u128() % 360;
    format!("hsl({hue}, 70%, 50%)")
}

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub session_id: Uuid,
    pub name: String,
    pub color: String,
    /// Page currently shown by the session
    pub page_id: Option<String>,
    /// Component currently being edited; this is the session's lock claim
    pub editing_component: Option<String>,
    /// Bumped on every change so stale frames can be dropped
    pub clock: u64,
}

impl PresenceState {
    pub fn new(session_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            session_id,
            name: name.into(),
            color: session_color(session_id),
            page_id: None,
            editing_component: None,
            clock: 0,
        }
    }

    pub fn with_page(mut self, page_id: Option<String>) -> Self {
        self.page_id = page_id;
        self
    }

    pub fn with_editing(mut self, component_id: Option<String>) -> Self {
        self.editing_component = component_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// Full state of the sending session
    Update(PresenceState),
    /// Clean disconnect
    Leave { session_id: Uuid },
    /// Ask every session to re-broadcast its state now
    Query { session_id: Uuid },
}

impl PresenceMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            Self::Update(state) => state.session_id,
            Self::Leave { session_id } | Self::Query { session_id } => *session_id,
        }
    }
}

/// What a handled message did to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(Uuid),
    Updated(Uuid),
    Left(Uuid),
    /// A peer asked for our state; the caller should re-broadcast it
    QueryReceived(Uuid),
    Ignored,
}

// ───────────────────────────────────────────────────────────────────
// Room
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePresence {
    state: PresenceState,
    last_seen: Instant,
}

/// Presence table of one project room, from the point of view of one session.
#[derive(Debug)]
pub struct PresenceRoom {
    local: PresenceState,
    peers: HashMap<Uuid, RemotePresence>,
    timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local: PresenceState, timeout: Duration) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            timeout,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.local.session_id
    }

    pub fn local(&self) -> &PresenceState {
        &self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current local state as a broadcastable update.
    pub fn update_message(&self) -> PresenceMessage {
        PresenceMessage::Update(self.local.clone())
    }

    /// Heartbeat frame; bumps the clock so receivers refresh liveness.
    pub fn heartbeat(&mut self) -> PresenceMessage {
        self.local.clock += 1;
        self.update_message()
    }

    pub fn set_page(&mut self, page_id: Option<String>) -> PresenceMessage {
        self.local.page_id = page_id;
        self.heartbeat()
    }

    pub(crate) fn set_editing(&mut self, component_id: Option<String>) -> PresenceMessage {
        self.local.editing_component = component_id;
        self.heartbeat()
    }

    pub fn leave_message(&self) -> PresenceMessage {
        PresenceMessage::Leave {
            session_id: self.local.session_id,
        }
    }

    pub fn query_message(&self) -> PresenceMessage {
        PresenceMessage::Query {
            session_id: self.local.session_id,
        }
    }

    pub fn handle_message(&mut self, msg: &PresenceMessage) -> PresenceChange {
        self.handle_message_at(msg, Instant::now())
    }

    pub fn handle_message_at(&mut self, msg: &PresenceMessage, now: Instant) -> PresenceChange {
        if msg.session_id() == self.local.session_id {
            return PresenceChange::Ignored;
        }
        match msg {
            PresenceMessage::Update(state) => match self.peers.get_mut(&state.session_id) {
                Some(peer) => {
                    if state.clock < peer.state.clock {
                        log::trace!("Dropping stale presence from {}", state.session_id);
                        return PresenceChange::Ignored;
                    }
                    peer.state = state.clone();
                    peer.last_seen = now;
                    PresenceChange::Updated(state.session_id)
                }
                None => {
                    log::debug!("Presence: {} ({}) appeared", state.name, state.session_id);
                    self.peers.insert(
                        state.session_id,
                        RemotePresence {
                            state: state.clone(),
                            last_seen: now,
                        },
                    );
                    PresenceChange::Joined(state.session_id)
                }
            },
            PresenceMessage::Leave { session_id } => {
                if self.remove_peer(session_id) {
                    PresenceChange::Left(*session_id)
                } else {
                    PresenceChange::Ignored
                }
            }
            PresenceMessage::Query { session_id } => PresenceChange::QueryReceived(*session_id),
        }
    }

    /// Drop a session immediately (explicit leave or relay disconnect).
    pub fn remove_peer(&mut self, session_id: &Uuid) -> bool {
        let removed = self.peers.remove(session_id).is_some();
        if removed {
            log::debug!("Presence: {session_id} left");
        }
        removed
    }

    pub fn prune_expired(&mut self) -> Vec<Uuid> {
        self.prune_expired_at(Instant::now())
    }

    /// Remove peers whose last heartbeat is older than the timeout.
    pub fn prune_expired_at(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let expired: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            log::debug!("Presence: {id} timed out");
            self.peers.remove(id);
        }
        expired
    }

    pub fn peer(&self, session_id: &Uuid) -> Option<&PresenceState> {
        self.peers.get(session_id).map(|p| &p.state)
    }

    /// Remote sessions currently known, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = &PresenceState> {
        self.peers.values().map(|p| &p.state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> PresenceRoom {
        PresenceRoom::new(PresenceState::new(Uuid::new_v4(), "Me"), Duration::from_secs(15))
    }

    #[test]
    fn test_session_color_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(session_color(id), session_color(id));
        assert!(session_color(id).starts_with("hsl("));
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = PresenceMessage::Update(
            PresenceState::new(Uuid::new_v4(), "Alice").with_page(Some("p1".into())),
        );
        assert_eq!(PresenceMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_join_update_leave() {
        let mut room = room();
        let peer = Uuid::new_v4();
        let mut state = PresenceState::new(peer, "Alice");

        assert_eq!(
            room.handle_message(&PresenceMessage::Update(state.clone())),
            PresenceChange::Joined(peer)
        );
        state.clock = 1;
        state.page_id = Some("p2".into());
        assert_eq!(
            room.handle_message(&PresenceMessage::Update(state)),
            PresenceChange::Updated(peer)
        );
        assert_eq!(room.peer(&peer).unwrap().page_id.as_deref(), Some("p2"));

        assert_eq!(
            room.handle_message(&PresenceMessage::Leave { session_id: peer }),
            PresenceChange::Left(peer)
        );
        assert!(!room.has_peers());
    }

    #[test]
    fn test_ignores_own_frames() {
        let mut room = room();
        let own = room.update_message();
        assert_eq!(room.handle_message(&own), PresenceChange::Ignored);
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_stale_update_dropped() {
        let mut room = room();
        let peer = Uuid::new_v4();
        let mut newer = PresenceState::new(peer, "Alice");
        newer.clock = 5;
        room.handle_message(&PresenceMessage::Update(newer));

        let older = PresenceState::new(peer, "Alice").with_page(Some("old".into()));
        assert_eq!(
            room.handle_message(&PresenceMessage::Update(older)),
            PresenceChange::Ignored
        );
        assert_eq!(room.peer(&peer).unwrap().page_id, None);
    }

    #[test]
    fn test_query_is_reported() {
        let mut room = room();
        let peer = Uuid::new_v4();
        assert_eq!(
            room.handle_message(&PresenceMessage::Query { session_id: peer }),
            PresenceChange::QueryReceived(peer)
        );
    }

    #[test]
    fn test_expiry() {
        let mut room = room();
        let peer = Uuid::new_v4();
        let start = Instant::now();
        room.handle_message_at(&PresenceMessage::Update(PresenceState::new(peer, "A")), start);

        assert!(room.prune_expired_at(start + Duration::from_secs(10)).is_empty());
        assert_eq!(room.prune_expired_at(start + Duration::from_secs(16)), vec![peer]);
        assert!(!room.has_peers());
    }

    #[test]
    fn test_heartbeat_bumps_clock() {
        let mut room = room();
        let before = room.local().clock;
        room.heartbeat();
        room.set_page(Some("p1".into()));
        assert_eq!(room.local().clock, before + 2);
        assert_eq!(room.local().page_id.as_deref(), Some("p1"));
    }
}
