//! Stateless WebSocket relay.
//!
//! ```text
//! Session A ──┐                         ┌──► Session B
//!             ├── room "quire/<id>" ────┤
//! Session C ──┘    (BroadcastGroup)     └──► Session C
//! ```
//!
//! The relay holds no document state. A connection joins a room with its
//! first `PeerJoined` frame; from then on every frame it sends is fanned out
//! to the room untouched, and every frame of the room is delivered to it
//! unless it sent the frame or the frame is addressed to someone else.
//! Merge updates are idempotent, so the relay never needs to order or
//! deduplicate anything.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before a slow reader starts losing them
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port and small rooms.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_peers: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_peers: AtomicU64,
}

/// A connection that has joined a room.
struct Membership {
    peer_id: Uuid,
    room: String,
    group: Arc<BroadcastGroup>,
    rx: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
    /// Set once the session announced its own departure
    left: bool,
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<AtomicRelayStats>,
        config: RelayConfig,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut member: Option<Membership> = None;
        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            &mut member,
            addr,
            &rooms,
            &stats,
            &config,
        )
        .await;

        if let Some(joined) = member {
            joined.group.remove_peer(&joined.peer_id).await;
            if !joined.left {
                let _ = joined
                    .group
                    .broadcast(&SyncMessage::peer_left(joined.peer_id, &joined.room));
            }
            if rooms.remove_if_empty(&joined.room).await {
                log::info!("Room {} removed (empty)", joined.room);
            }
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        result
    }

    /// Shuttle frames between one socket and its room until either side ends.
    async fn pump(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        member: &mut Option<Membership>,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &AtomicRelayStats,
        config: &RelayConfig,
    ) -> ConnectionResult {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                            let frame = match SyncMessage::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            if frame.msg_type == MessageType::Ping {
                                let pong = SyncMessage::pong(frame.peer_id).encode()?;
                                ws_sender.send(Message::Binary(pong.into())).await?;
                                continue;
                            }

                            match member.as_mut() {
                                None => {
                                    if frame.msg_type != MessageType::PeerJoined {
                                        log::debug!("Dropping {:?} from {addr} before join", frame.msg_type);
                                        continue;
                                    }
                                    let group = rooms.get_or_create(&frame.room).await;
                                    if group.peer_count().await >= config.max_peers_per_room {
                                        stats.rejected_peers.fetch_add(1, Ordering::Relaxed);
                                        log::warn!("Room {} is full, rejecting {}", frame.room, frame.peer_id);
                                        ws_sender.send(Message::Close(None)).await?;
                                        return Ok(());
                                    }
                                    let info = frame
                                        .peer_info()
                                        .unwrap_or_else(|_| PeerInfo::with_id(frame.peer_id, "Anonymous"));
                                    log::info!("Peer {} ({}) joined {}", info.name, info.peer_id, frame.room);
                                    let rx = group.add_peer(info).await;
                                    group.broadcast_raw(Arc::new(bytes));
                                    *member = Some(Membership {
                                        peer_id: frame.peer_id,
                                        room: frame.room,
                                        group,
                                        rx,
                                        left: false,
                                    });
                                }
                                Some(joined) => {
                                    if frame.room != joined.room {
                                        log::warn!(
                                            "Peer {} sent a frame for {} while in {}",
                                            joined.peer_id, frame.room, joined.room
                                        );
                                        continue;
                                    }
                                    if frame.msg_type == MessageType::PeerLeft {
                                        joined.left = true;
                                    }
                                    joined.group.broadcast_raw(Arc::new(bytes));
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                incoming = async {
                    match member.as_mut() {
                        Some(joined) => joined.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(joined) = member.as_ref() else { continue };
                    match incoming {
                        Ok(data) => {
                            let deliver = SyncMessage::decode(&data)
                                .map(|frame| frame.is_for(joined.peer_id))
                                .unwrap_or(false);
                            if deliver {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            joined.group.record_dropped(n);
                            log::warn!("Peer {} lagged by {n} frames", joined.peer_id);
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_peers: self.stats.rejected_peers.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_relay_config_from_json() {
        let config = RelayConfig::from_json(r#"{"bind_addr": "0.0.0.0:7000"}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_room, 100);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.stats().await, RelayStats::default());
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_serve_counts_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(RelayServer::with_defaults());
        let serving = relay.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let ping = SyncMessage::ping(Uuid::new_v4()).encode().unwrap();
        ws.send(Message::Binary(ping.into())).await.unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Binary(data) = reply else { panic!("expected binary pong") };
        let pong = SyncMessage::decode(&data).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);

        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.active_rooms, 0);
    }
}
