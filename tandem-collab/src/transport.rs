//! Publish/subscribe transport seam.
//!
//! The presence registry and the change channel only ever see a
//! [`TopicLink`]: a non-blocking outgoing queue plus a stream of
//! [`LinkEvent`]s. Reconnection, delivery and fan-out belong to the
//! transport behind it:
//!
//! - [`LocalHub`]: in-process, backed by [`RoomManager`]
//! - [`crate::client::WsTransport`]: WebSocket link to a [`crate::server::RelayServer`]
//!
//! A link never receives the frames it published itself.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::RoomManager;

/// Default depth of a link's outgoing and incoming queues.
pub const DEFAULT_LINK_CAPACITY: usize = 256;

/// Something that happened on a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link is (again) attached to its topic. Emitted after every reconnect.
    Connected,
    /// The link lost its topic; the transport is reconnecting.
    Disconnected,
    /// An encoded [`crate::protocol::SyncMessage`] published by another link.
    Frame(Arc<Vec<u8>>),
}

/// Non-blocking, fire-and-forget sending half of a link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    topic: Uuid,
    tx: mpsc::Sender<Vec<u8>>,
}

impl LinkSender {
    /// Queue a frame. Returns `false` when it was dropped (queue full or link closed).
    pub fn send(&self, frame: Vec<u8>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Outgoing queue full on topic {}, frame dropped", self.topic);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Link to topic {} closed, frame dropped", self.topic);
                false
            }
        }
    }

    pub fn topic(&self) -> Uuid {
        self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One attachment to one session topic.
///
/// Dropping every [`LinkSender`] of a link detaches it from the topic once
/// the frames already queued have been flushed.
pub struct TopicLink {
    pub sender: LinkSender,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl TopicLink {
    /// Build a link and hand back the transport-side ends of its queues.
    pub fn channel(
        topic: Uuid,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<u8>>, mpsc::Sender<LinkEvent>) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let link = Self {
            sender: LinkSender { topic, tx: out_tx },
            events: in_rx,
        };
        (link, out_rx, in_tx)
    }

    pub fn topic(&self) -> Uuid {
        self.sender.topic
    }
}

/// A scoped publish/subscribe transport.
///
/// `open` must not block: attachment happens in the background and is
/// signalled with [`LinkEvent::Connected`]. Must be called inside a tokio
/// runtime.
pub trait Transport: Send + Sync {
    fn open(&self, topic: Uuid) -> TopicLink;
}

/// In-process transport: every link of the hub shares its rooms.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RoomManager>,
    link_capacity: usize,
}

impl LocalHub {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(broadcast_capacity)),
            link_capacity: DEFAULT_LINK_CAPACITY,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(DEFAULT_LINK_CAPACITY)
    }
}

impl Transport for LocalHub {
    fn open(&self, topic: Uuid) -> TopicLink {
        let (link, mut out_rx, in_tx) = TopicLink::channel(topic, self.link_capacity);
        let rooms = self.rooms.clone();
        let link_id = Uuid::new_v4();

        tokio::spawn(async move {
            let group = rooms.get_or_create(topic).await;
            let mut rx = group.add_member(link_id).await;

            // The owner may stop listening before it stops sending; keep
            // publishing its queue until every sender is gone.
            let _ = in_tx.send(LinkEvent::Connected).await;
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(bytes) => {
                            group.publish(link_id, Arc::new(bytes));
                        }
                        // Owner dropped the link
                        None => break,
                    },
                    frame = rx.recv() => match frame {
                        Ok(frame) => {
                            if frame.origin == link_id || in_tx.is_closed() {
                                continue;
                            }
                            let _ = in_tx.send(LinkEvent::Frame(frame.bytes)).await;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Link {link_id} on topic {topic} lagged by {n} frames");
                            group.record_lag(n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            group.remove_member(&link_id).await;
            rooms.remove_if_empty(&topic).await;
            log::trace!("Link {link_id} detached from topic {topic}");
        });

        link
    }
}
