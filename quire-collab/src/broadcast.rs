//! Per-room fan-out for the relay.
//!
//! Each room owns one tokio broadcast channel. A frame is encoded once and
//! every connection in the room gets an `Arc` to the same bytes; the
//! connection itself decides whether the frame is addressed to it.
//! Receivers that fall more than `capacity` frames behind lose the oldest
//! ones and are expected to resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Hot-path counters, updated without taking the peer lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Sessions of one project room and the channel they share.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a session and subscribe it to the room.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and fan out; returns how many receivers got the frame.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Fan out already encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(encoded).unwrap_or(0)
    }

    /// Record frames a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room name → broadcast group.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn get_or_create(&self, room: &str) -> Arc<BroadcastGroup> {
        if let Some(group) = self.rooms.read().await.get(room) {
            return group.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Drop the room once its last session is gone.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.peer_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "quire/p1";

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        group.remove_peer(&peer_id).await;
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");
        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(PeerInfo::new("Bob")).await;

        let msg = SyncMessage::delta(alice.peer_id, ROOM, 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let got = SyncMessage::decode(&rx1.recv().await.unwrap()).unwrap();
        assert_eq!(got, msg);
        assert_eq!(*rx2.recv().await.unwrap(), msg.encode().unwrap());
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(PeerInfo::new("Slow")).await;
        for i in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        group.record_dropped(3);
        assert_eq!(group.stats().await.messages_dropped, 3);
        assert_eq!(group.stats().await.messages_sent, 5);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let a = manager.get_or_create(ROOM).await;
        let b = manager.get_or_create(ROOM).await;
        assert!(Arc::ptr_eq(&a, &b));
        manager.get_or_create("quire/p2").await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.active_rooms().await.contains(&ROOM.to_string()));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create(ROOM).await;
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;
        let _rx = room.add_peer(peer).await;

        assert!(!manager.remove_if_empty(ROOM).await);
        room.remove_peer(&peer_id).await;
        assert!(manager.remove_if_empty(ROOM).await);
        assert!(manager.get(ROOM).await.is_none());
    }
}
