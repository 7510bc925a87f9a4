//! Reconnecting WebSocket transport.
//!
//! Each [`TopicLink`] opened on a [`WsTransport`] owns one connection to
//! `{server_url}/{topic}` on a [`crate::server::RelayServer`]. When the
//! connection drops the link emits [`LinkEvent::Disconnected`], retries with
//! exponential backoff, and emits [`LinkEvent::Connected`] once it is back so
//! that presence re-announces itself.
//!
//! Frames queued while disconnected are dropped, not replayed: presence is
//! re-announced in full and change events are full-state, so the next frame
//! supersedes anything lost.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::transport::{LinkEvent, TopicLink, Transport, DEFAULT_LINK_CAPACITY};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Reconnect delay cap
    pub max_backoff: Duration,
    /// Depth of each link's queues
    pub link_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            link_capacity: DEFAULT_LINK_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// URL of a topic on the relay.
    pub fn topic_url(&self, topic: Uuid) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), topic)
    }

    /// Delay after `delay`: doubled, capped at `max_backoff`.
    pub fn next_backoff(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_backoff)
    }
}

/// WebSocket [`Transport`] to a relay server.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: Arc<ClientConfig>,
}

impl WsTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(server_url))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Transport for WsTransport {
    fn open(&self, topic: Uuid) -> TopicLink {
        let (link, out_rx, in_tx) = TopicLink::channel(topic, self.config.link_capacity);
        tokio::spawn(run_link(self.config.clone(), topic, out_rx, in_tx));
        link
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a connection ended.
enum PumpEnd {
    /// Every sender of the link is gone and its queue is flushed.
    OwnerGone,
    Disconnected,
}

/// Connect, pump, back off, repeat, until the link's owner drops it.
async fn run_link(
    config: Arc<ClientConfig>,
    topic: Uuid,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    in_tx: mpsc::Sender<LinkEvent>,
) {
    let url = config.topic_url(topic);
    let mut backoff = config.initial_backoff;

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                log::info!("Connected to {url}");
                backoff = config.initial_backoff;
                let _ = in_tx.send(LinkEvent::Connected).await;

                match pump(ws, &mut out_rx, &in_tx).await {
                    PumpEnd::OwnerGone => {
                        log::debug!("Link to {url} closed by owner");
                        return;
                    }
                    PumpEnd::Disconnected => {
                        log::info!("Lost connection to {url}, reconnecting");
                        let _ = in_tx.send(LinkEvent::Disconnected).await;
                    }
                }
            }
            Err(e) => log::debug!("Connecting to {url} failed: {e}"),
        }

        // Drop outgoing frames until the next attempt
        let retry = tokio::time::sleep(backoff);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                out = out_rx.recv() => match out {
                    Some(_) => log::trace!("Disconnected from {url}, frame dropped"),
                    None => return,
                },
            }
        }
        backoff = config.next_backoff(backoff);
    }
}

/// Move frames between the link queues and one live socket.
async fn pump(
    ws: Socket,
    out_rx: &mut mpsc::Receiver<Vec<u8>>,
    in_tx: &mpsc::Sender<LinkEvent>,
) -> PumpEnd {
    let (mut ws_sender, mut ws_receiver) = ws.split();

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(bytes) => {
                    if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                        log::debug!("Send failed: {e}");
                        return PumpEnd::Disconnected;
                    }
                }
                None => {
                    let _ = ws_sender.close().await;
                    return PumpEnd::OwnerGone;
                }
            },

            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    // Owner may have stopped listening; keep flushing its sends
                    let _ = in_tx.send(LinkEvent::Frame(Arc::new(bytes))).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    if ws_sender.send(Message::Pong(data)).await.is_err() {
                        return PumpEnd::Disconnected;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return PumpEnd::Disconnected,
                Some(Err(e)) => {
                    log::debug!("WebSocket error: {e}");
                    return PumpEnd::Disconnected;
                }
                _ => {}
            },
        }
    }
}
