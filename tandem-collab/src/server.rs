//! WebSocket relay for session topics.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/{topic}
//!             ├── BroadcastGroup (topic) ──► every other connection
//! Client B ──┘
//! ```
//!
//! The relay holds no diagram state and no presence state. It forwards each
//! binary frame to the other connections of the same topic, answers protocol
//! `Ping`s, and watches `Join`/`Announce`/`Leave` only to remember which
//! session key a connection announced. When such a connection drops without
//! a `Leave`, the relay publishes one on its behalf.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per topic
    pub max_peers_per_topic: usize,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_topic: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
    /// `Leave`s published for connections that dropped without one.
    pub synthesized_leaves: u64,
}

/// The relay server. Cheap to clone; clones share topics and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::debug!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let mut topic: Option<Uuid> = None;
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match parse_topic(req.uri().path()) {
                Some(id) => {
                    topic = Some(id);
                    Ok(resp)
                }
                None => {
                    let mut err = ErrorResponse::new(Some("expected /{topic-uuid}".to_string()));
                    *err.status_mut() = StatusCode::BAD_REQUEST;
                    Err(err)
                }
            }
        })
        .await?;
        let Some(topic) = topic else {
            return Ok(());
        };

        let group = self.rooms.get_or_create(topic).await;
        if group.member_count().await >= self.config.max_peers_per_topic {
            log::warn!("Topic {topic} full, rejecting {addr}");
            self.stats.write().await.rejected_connections += 1;
            let _ = ws.close(None).await;
            self.rooms.remove_if_empty(&topic).await;
            return Ok(());
        }

        let link_id = Uuid::new_v4();
        let rx = group.add_member(link_id).await;
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_topics = self.rooms.room_count().await;
        }
        log::info!("Connection {link_id} from {addr} attached to topic {topic}");

        let mut session_key = None;
        let result = self
            .relay(ws, rx, &group, topic, link_id, &mut session_key)
            .await;

        // Cleanup: detach, then speak for the connection if it vanished silently.
        // A client that already reconnected on another link is still present.
        group.remove_member(&link_id).await;
        if let Some(key) = session_key {
            if group.has_session_key(&key).await {
                log::debug!("{key} re-attached to topic {topic} on another link, no leave");
                session_key = None;
            }
        }
        if let Some(key) = session_key {
            let leave = SyncMessage::leave(key, topic);
            match leave.encode() {
                Ok(bytes) => {
                    self.stats.write().await.synthesized_leaves += 1;
                    group.publish(link_id, Arc::new(bytes));
                    log::debug!("Published leave for {key} on topic {topic}");
                }
                Err(e) => log::warn!("Failed to encode leave: {e}"),
            }
        }
        self.rooms.remove_if_empty(&topic).await;

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_topics = self.rooms.room_count().await;
        }
        log::info!("Connection {link_id} detached from topic {topic}");
        result
    }

    /// Pump frames between one socket and its topic until either side closes.
    async fn relay(
        &self,
        ws: WebSocketStream<TcpStream>,
        mut rx: tokio::sync::broadcast::Receiver<crate::broadcast::Frame>,
        group: &BroadcastGroup,
        topic: Uuid,
        link_id: Uuid,
        session_key: &mut Option<Uuid>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = self.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Dropping undecodable frame from {link_id}: {e}");
                                    continue;
                                }
                            };

                            match sync_msg.msg_type {
                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(Uuid::nil()).encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                    continue;
                                }
                                MessageType::Pong => continue,
                                _ => {}
                            }

                            if sync_msg.topic != topic {
                                log::warn!("Frame for topic {} arrived on topic {topic}", sync_msg.topic);
                                continue;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join | MessageType::Announce => {
                                    if *session_key != Some(sync_msg.sender) {
                                        *session_key = Some(sync_msg.sender);
                                        group.set_session_key(&link_id, *session_key).await;
                                    }
                                }
                                MessageType::Leave => {
                                    *session_key = None;
                                    group.set_session_key(&link_id, None).await;
                                }
                                _ => {}
                            }

                            log::trace!("Relaying {:?} from {link_id}", sync_msg.msg_type);
                            group.publish(link_id, Arc::new(bytes));
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection {link_id} closed");
                            return Ok(());
                        }

                        Some(Err(e)) => return Err(e.into()),

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.origin == link_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {link_id} lagged by {n} frames");
                            group.record_lag(n);
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Topic id from a request path of the form `/{uuid}`.
fn parse_topic(path: &str) -> Option<Uuid> {
    let segment = path.trim_matches('/');
    if segment.contains('/') {
        return None;
    }
    Uuid::parse_str(segment).ok()
}
