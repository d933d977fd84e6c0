//! Session side of the relay connection.
//!
//! ```text
//!            send_delta / send_presence / send_sync_step2
//!                          │
//!                          ▼
//!   ┌──────────────┐   mpsc   ┌──────────────┐   ws   ┌───────┐
//!   │RelayTransport│ ───────► │ writer task  │ ─────► │ relay │
//!   └──────┬───────┘          └──────────────┘        └───┬───┘
//!          │ offline? ──► OfflineQueue (replayed on connect)  │
//!          ▼                                                  │
//!   RelayEvent ◄──────────── reader task ◄────────────────────┘
//! ```
//!
//! Deltas produced while offline are queued and replayed after the next
//! join. Presence is dropped while offline since a fresh heartbeat
//! supersedes it anyway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::PresenceMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something the relay delivered to this session.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// A peer sent its state vector and wants the diff
    SyncRequest {
        peer_id: Uuid,
        state_vector: Vec<u8>,
        /// Sent only to us, in return for our diff
        addressed: bool,
    },
    /// Answer to our own state vector
    SyncResponse {
        peer_id: Uuid,
        update: Vec<u8>,
    },
    Presence {
        peer_id: Uuid,
        message: PresenceMessage,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
    queued_at: Instant,
}

/// Deltas produced while the relay was unreachable, oldest first.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> Result<(), ProtocolError> {
        if self.queue.len() >= self.max_size {
            return Err(ProtocolError::QueueFull);
        }
        self.queue.push_back(QueuedDelta {
            clock,
            payload,
            queued_at: Instant::now(),
        });
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        if let Some(oldest) = self.queue.front() {
            log::debug!(
                "Draining {} queued deltas, oldest from {:?} ago",
                self.queue.len(),
                oldest.queued_at.elapsed()
            );
        }
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

pub struct RelayTransport {
    peer_info: PeerInfo,
    room: String,
    relay_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock; bumped on send, advanced past every received frame
    clock: Arc<AtomicU64>,
    offline_queue: Mutex<OfflineQueue>,
    outgoing_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<RelayEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<RelayEvent>>>,
}

impl RelayTransport {
    pub fn new(
        peer_info: PeerInfo,
        room: impl Into<String>,
        relay_url: impl Into<String>,
        queue_capacity: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            peer_info,
            room: room.into(),
            relay_url: relay_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(AtomicU64::new(0)),
            offline_queue: Mutex::new(OfflineQueue::new(queue_capacity)),
            outgoing_tx: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver; only the first call gets it.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Connect, join the room, replay queued deltas and ask peers for
    /// whatever `state_vector` is missing.
    pub async fn connect(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.relay_url.trim_end_matches('/'), self.room);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Relay connection to {url} failed: {e}");
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        out_tx
            .send(SyncMessage::peer_joined(&self.peer_info, &self.room)?.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        *self.outgoing_tx.lock().await = Some(out_tx.clone());

        {
            // Holding the queue while flipping state keeps send_delta from
            // slipping a delta in behind the replay.
            let mut queue = self.offline_queue.lock().await;
            *self.state.write().await = ConnectionState::Connected;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued deltas", queued.len());
            }
            for (clock, payload) in queued {
                let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room, clock, payload);
                out_tx
                    .send(msg.encode()?)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }

        let step1 = SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector);
        out_tx
            .send(step1.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let _ = self.event_tx.send(RelayEvent::Connected).await;
        log::info!("Joined {} as {}", self.room, self.peer_info.peer_id);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        let outgoing = self.outgoing_tx.clone();
        let peer_id = self.peer_info.peer_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let frame = match SyncMessage::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable relay frame: {e}");
                                continue;
                            }
                        };
                        if !frame.is_for(peer_id) {
                            continue;
                        }
                        clock.fetch_max(frame.clock, Ordering::Relaxed);
                        if let Some(event) = Self::to_event(frame) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            *outgoing.lock().await = None;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
            log::info!("Relay connection closed");
        });

        Ok(())
    }

    fn to_event(frame: SyncMessage) -> Option<RelayEvent> {
        let peer_id = frame.peer_id;
        match frame.msg_type {
            MessageType::Delta => Some(RelayEvent::RemoteDelta {
                peer_id,
                clock: frame.clock,
                update: frame.payload,
            }),
            MessageType::SyncStep1 => Some(RelayEvent::SyncRequest {
                peer_id,
                state_vector: frame.payload,
                addressed: frame.target.is_some(),
            }),
            MessageType::SyncStep2 => Some(RelayEvent::SyncResponse {
                peer_id,
                update: frame.payload,
            }),
            MessageType::Presence => match frame.presence_message() {
                Ok(message) => Some(RelayEvent::Presence { peer_id, message }),
                Err(e) => {
                    log::warn!("Bad presence payload from {peer_id}: {e}");
                    None
                }
            },
            MessageType::PeerJoined => frame.peer_info().ok().map(RelayEvent::PeerJoined),
            MessageType::PeerLeft => Some(RelayEvent::PeerLeft(peer_id)),
            MessageType::Ping | MessageType::Pong => None,
        }
    }

    async fn send_frame(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send a merge update, or queue it while offline.
    pub async fn send_delta(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut queue = self.offline_queue.lock().await;
            if *self.state.read().await != ConnectionState::Connected {
                return queue.enqueue(clock, update);
            }
        }
        let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room, clock, update.clone());
        if let Err(e) = self.send_frame(msg).await {
            log::debug!("Delta send failed ({e}), queueing");
            self.offline_queue.lock().await.enqueue(clock, update)?;
        }
        Ok(())
    }

    /// Send presence; silently dropped while offline.
    pub async fn send_presence(&self, message: &PresenceMessage) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let clock = self.clock.load(Ordering::Relaxed);
        self.send_frame(SyncMessage::presence(self.peer_info.peer_id, &self.room, clock, message)?)
            .await
    }

    /// Answer a peer's state vector with the diff it is missing.
    pub async fn send_sync_step2(&self, target: Uuid, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::sync_step2(self.peer_info.peer_id, &self.room, target, diff))
            .await
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector))
            .await
    }

    /// Ask one peer for what it has that we lack.
    pub async fn send_sync_step1_to(&self, target: Uuid, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector).addressed_to(target);
        self.send_frame(msg).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    /// Announce departure and close the socket.
    pub async fn disconnect(&self) {
        if self.is_connected().await {
            let _ = self
                .send_frame(SyncMessage::peer_left(self.peer_info.peer_id, &self.room))
                .await;
        }
        *self.outgoing_tx.lock().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_info.peer_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceState;

    fn transport() -> RelayTransport {
        RelayTransport::new(PeerInfo::new("Tester"), "quire/p1", "ws://127.0.0.1:1", 100)
    }

    #[tokio::test]
    async fn test_transport_initial_state() {
        let t = transport();
        assert_eq!(t.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(t.clock(), 0);
        assert_eq!(t.offline_queue_len().await, 0);
        assert_eq!(t.room(), "quire/p1");
    }

    #[tokio::test]
    async fn test_send_delta_offline_queues() {
        let t = transport();
        t.send_delta(vec![1, 2, 3]).await.unwrap();
        t.send_delta(vec![4, 5, 6]).await.unwrap();
        assert_eq!(t.offline_queue_len().await, 2);
        assert_eq!(t.clock(), 2);
    }

    #[tokio::test]
    async fn test_offline_queue_full_is_reported() {
        let t = RelayTransport::new(PeerInfo::new("T"), "quire/p1", "ws://127.0.0.1:1", 1);
        t.send_delta(vec![1]).await.unwrap();
        assert_eq!(t.send_delta(vec![2]).await, Err(ProtocolError::QueueFull));
    }

    #[tokio::test]
    async fn test_presence_offline_is_dropped() {
        let t = transport();
        let msg = PresenceMessage::Update(PresenceState::new(t.peer_id(), "T"));
        t.send_presence(&msg).await.unwrap();
        assert_eq!(t.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_sync_step2_offline_fails() {
        let t = transport();
        assert_eq!(
            t.send_sync_step2(Uuid::new_v4(), vec![0]).await,
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let t = RelayTransport::new(PeerInfo::new("T"), "quire/p1", format!("ws://127.0.0.1:{port}"), 10);
        assert!(matches!(t.connect(Vec::new()).await, Err(ProtocolError::Connect(_))));
        assert_eq!(t.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_take_event_rx_once() {
        let t = transport();
        assert!(t.take_event_rx().is_some());
        assert!(t.take_event_rx().is_none());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(3);
        queue.enqueue(1, vec![1, 2, 3]).unwrap();
        queue.enqueue(2, vec![4]).unwrap();
        assert_eq!(queue.total_bytes(), 4);
        queue.enqueue(3, vec![5]).unwrap();
        assert_eq!(queue.enqueue(4, vec![6]), Err(ProtocolError::QueueFull));

        let drained = queue.drain();
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert_eq!(drained.len(), 3);
        assert!(queue.is_empty());

        queue.enqueue(5, vec![7]).unwrap();
        queue.clear();
        assert_eq!(queue.len(), 0);
    }
}
