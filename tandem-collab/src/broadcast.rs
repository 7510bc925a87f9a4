//! Topic-scoped fan-out with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all members of a topic.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind loses the oldest frames
//! (at-most-once delivery, never blocks the publisher).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A frame published on a topic, tagged with the link that published it.
///
/// Receivers compare `origin` with their own link id to suppress echoes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Bookkeeping for one attached link.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub link_id: Uuid,
    pub attached_at: Instant,
    /// Session key learned from the member's presence frames, if any.
    pub session_key: Option<Uuid>,
}

/// The broadcast group of a single session topic.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    members: Arc<RwLock<HashMap<Uuid, MemberInfo>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-member buffer before lagging members drop frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicBroadcastStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a link. Only frames published after this call are received.
    pub async fn add_member(&self, link_id: Uuid) -> broadcast::Receiver<Frame> {
        let mut members = self.members.write().await;
        members.insert(
            link_id,
            MemberInfo {
                link_id,
                attached_at: Instant::now(),
                session_key: None,
            },
        );
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, link_id: &Uuid) -> Option<MemberInfo> {
        self.members.write().await.remove(link_id)
    }

    /// Record the session key announced over a link.
    pub async fn set_session_key(&self, link_id: &Uuid, session_key: Option<Uuid>) {
        if let Some(member) = self.members.write().await.get_mut(link_id) {
            member.session_key = session_key;
        }
    }

    /// Publish a frame to every member (including `origin`; receivers filter).
    ///
    /// Returns the number of receivers the frame was queued for. Lock-free.
    pub fn publish(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { origin, bytes }).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, link_id: &Uuid) -> bool {
        self.members.read().await.contains_key(link_id)
    }

    /// Whether any attached link has announced `session_key`.
    pub async fn has_session_key(&self, session_key: &Uuid) -> bool {
        self.members
            .read()
            .await
            .values()
            .any(|m| m.session_key.as_ref() == Some(session_key))
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps session topics to broadcast groups.
///
/// Each topic gets its own group so traffic never crosses diagrams.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, topic: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&topic) {
            return room.clone();
        }

        log::debug!("Opening topic {topic}");
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(topic, room.clone());
        room
    }

    pub async fn get(&self, topic: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(topic).cloned()
    }

    /// Drop the topic if nobody is attached anymore.
    pub async fn remove_if_empty(&self, topic: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                rooms.remove(topic);
                log::debug!("Closed empty topic {topic}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
