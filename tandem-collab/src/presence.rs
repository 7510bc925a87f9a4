//! Presence: who is attached to a diagram session, and where they point.
//!
//! ## Architecture
//!
//! ```text
//! PresenceRegistry::join()
//!       │  Join { full record }
//!       ▼
//! session topic ──────────────► other registries
//!       ▲                          │ upsert + reply Announce
//!       │  Announce { full record } │
//!       └──────────────────────────┘
//!
//! update_cursor / update_selection ──► Announce { full record }
//! leave() ──► Leave
//! ```
//!
//! Presence is client-asserted and last-announced-wins: every announcement
//! carries the whole record, never a patch. Each registry keeps its own
//! observed set; there is no server-side copy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tandem_core::{now_millis, Point, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{MessageType, SyncMessage};
use crate::transport::{LinkEvent, LinkSender, Transport};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGB color used to render a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Fixed collaborator palette.
pub const PALETTE: [Color; 12] = [
    Color::rgb(0xef, 0x44, 0x44),
    Color::rgb(0xf9, 0x73, 0x16),
    Color::rgb(0xea, 0xb3, 0x08),
    Color::rgb(0x22, 0xc5, 0x5e),
    Color::rgb(0x14, 0xb8, 0xa6),
    Color::rgb(0x06, 0xb6, 0xd4),
    Color::rgb(0x3b, 0x82, 0xf6),
    Color::rgb(0x63, 0x66, 0xf1),
    Color::rgb(0xa8, 0x55, 0xf7),
    Color::rgb(0xec, 0x48, 0x99),
    Color::rgb(0x84, 0xcc, 0x16),
    Color::rgb(0xf4, 0x3f, 0x5e),
];

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Stable palette color for a user: FNV-1a over the id bytes.
    ///
    /// Pure function of `user`, so every client picks the same color
    /// without coordinating.
    pub fn for_user(user: UserId) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in user.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        PALETTE[(hash % PALETTE.len() as u64) as usize]
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence record
// ───────────────────────────────────────────────────────────────────

/// Ephemeral metadata a client asserts about itself on a session topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorPresence {
    pub session_key: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub color: Color,
    /// Pointer position in diagram coordinates.
    pub cursor: Option<Point>,
    pub selected_element_id: Option<String>,
    /// Milliseconds since epoch, stamped by the observer on receipt.
    pub last_seen_at: u64,
}

impl CollaboratorPresence {
    pub fn new(session_key: UserId, display_name: impl Into<String>) -> Self {
        Self {
            session_key,
            display_name: display_name.into(),
            avatar_ref: None,
            color: Color::for_user(session_key),
            cursor: None,
            selected_element_id: None,
            last_seen_at: now_millis(),
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

type Observer = Box<dyn Fn(&[CollaboratorPresence]) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    topic: Uuid,
    local: Mutex<CollaboratorPresence>,
    peers: Mutex<HashMap<UserId, CollaboratorPresence>>,
    /// `None` once the registry has left; checked under lock before every call.
    observer: Mutex<Option<Observer>>,
    /// Every outgoing frame goes through here. `None` once the registry has
    /// left, so nothing can follow the `Leave`.
    sender: Mutex<Option<LinkSender>>,
    clock: AtomicU64,
}

impl Shared {
    fn local_key(&self) -> UserId {
        lock(&self.local).session_key
    }

    /// Send the full local record.
    fn announce(&self, msg_type: MessageType) {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return;
        };
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let record = lock(&self.local).clone();
        let msg = match msg_type {
            MessageType::Join => SyncMessage::join(self.topic, clock, &record),
            _ => SyncMessage::announce(self.topic, clock, &record),
        };
        match msg.and_then(|m| m.encode()) {
            Ok(bytes) => {
                sender.send(bytes);
            }
            Err(e) => log::warn!("Failed to encode presence for topic {}: {e}", self.topic),
        }
    }

    /// Apply a received frame. Returns whether the observed set changed.
    fn apply(&self, msg: &SyncMessage) -> bool {
        if msg.topic != self.topic || msg.sender == self.local_key() {
            return false;
        }

        match msg.msg_type {
            MessageType::Join | MessageType::Announce => {
                let mut record = match msg.presence() {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("Dropping malformed presence on topic {}: {e}", self.topic);
                        return false;
                    }
                };
                record.last_seen_at = now_millis();
                let is_new = lock(&self.peers)
                    .insert(record.session_key, record)
                    .is_none();
                if is_new {
                    log::debug!("Collaborator {} joined topic {}", msg.sender, self.topic);
                }
                if msg.msg_type == MessageType::Join {
                    // Let the newcomer build its view
                    self.announce(MessageType::Announce);
                }
                true
            }
            MessageType::Leave => {
                let removed = lock(&self.peers).remove(&msg.sender).is_some();
                if removed {
                    log::debug!("Collaborator {} left topic {}", msg.sender, self.topic);
                }
                removed
            }
            _ => false,
        }
    }

    fn collaborators(&self) -> Vec<CollaboratorPresence> {
        let mut view: Vec<CollaboratorPresence> = lock(&self.peers).values().cloned().collect();
        view.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.session_key.cmp(&b.session_key))
        });
        view
    }

    /// Send `Leave` as the last frame of this link. Returns `false` if already left.
    fn depart(&self) -> bool {
        let mut sender = lock(&self.sender);
        let Some(link) = sender.take() else {
            return false;
        };
        match SyncMessage::leave(self.local_key(), self.topic).encode() {
            Ok(bytes) => {
                link.send(bytes);
            }
            Err(e) => log::warn!("Failed to encode leave: {e}"),
        }
        true
    }

    fn notify(&self) {
        let observer = lock(&self.observer);
        if let Some(observer) = observer.as_ref() {
            observer(&self.collaborators());
        }
    }
}

/// Presence on one session topic, for one local collaborator.
///
/// Created by [`PresenceRegistry::join`]; detached by [`PresenceRegistry::leave`]
/// or on drop. The observer runs on the registry's background task and must
/// not call `leave` itself.
pub struct PresenceRegistry {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl PresenceRegistry {
    /// Attach to `session_id`, announce `me`, and start observing the others.
    ///
    /// Never fails: if the transport is down, the announcement goes out as soon
    /// as it (re)connects. `observer` receives the full observed set, never
    /// including `me`, after every change.
    pub fn join<T, F>(transport: &T, session_id: Uuid, me: CollaboratorPresence, observer: F) -> Self
    where
        T: Transport + ?Sized,
        F: Fn(&[CollaboratorPresence]) + Send + 'static,
    {
        let link = transport.open(session_id);
        let shared = Arc::new(Shared {
            topic: session_id,
            local: Mutex::new(me),
            peers: Mutex::new(HashMap::new()),
            observer: Mutex::new(Some(Box::new(observer))),
            sender: Mutex::new(Some(link.sender)),
            clock: AtomicU64::new(0),
        });

        let task = tokio::spawn(Self::run(shared.clone(), link.events));
        log::info!("Joined presence on topic {session_id}");

        Self {
            shared,
            task: Some(task),
        }
    }

    async fn run(shared: Arc<Shared>, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected => shared.announce(MessageType::Join),
                LinkEvent::Disconnected => {
                    log::debug!("Presence on topic {} stale until reconnect", shared.topic);
                }
                LinkEvent::Frame(bytes) => match SyncMessage::decode(&bytes) {
                    Ok(msg) => {
                        if msg.is_presence() && shared.apply(&msg) {
                            shared.notify();
                        }
                    }
                    Err(e) => log::warn!("Undecodable frame on topic {}: {e}", shared.topic),
                },
            }
        }
    }

    /// Move the local cursor and re-announce the full record.
    pub fn update_cursor(&self, x: f64, y: f64) {
        {
            let mut local = lock(&self.shared.local);
            local.cursor = Some(Point::new(x, y));
            local.last_seen_at = now_millis();
        }
        self.refresh();
    }

    /// Change (or clear) the local selection and re-announce the full record.
    pub fn update_selection(&self, element_id: Option<&str>) {
        {
            let mut local = lock(&self.shared.local);
            local.selected_element_id = element_id.map(str::to_string);
            local.last_seen_at = now_millis();
        }
        self.refresh();
    }

    /// Re-announce the unchanged record (heartbeat for [`Self::prune_idle`] users).
    pub fn refresh(&self) {
        self.shared.announce(MessageType::Announce);
    }

    /// Forget collaborators not heard from within `max_idle`.
    pub fn prune_idle(&self, max_idle: Duration) -> Vec<UserId> {
        let cutoff = now_millis().saturating_sub(max_idle.as_millis() as u64);
        let stale: Vec<UserId> = {
            let mut peers = lock(&self.shared.peers);
            let stale: Vec<UserId> = peers
                .values()
                .filter(|p| p.last_seen_at < cutoff)
                .map(|p| p.session_key)
                .collect();
            for key in &stale {
                peers.remove(key);
            }
            stale
        };
        if !stale.is_empty() {
            log::debug!("Pruned {} idle collaborators on topic {}", stale.len(), self.shared.topic);
            self.shared.notify();
        }
        stale
    }

    /// Current observed set, excluding the local collaborator.
    pub fn collaborators(&self) -> Vec<CollaboratorPresence> {
        self.shared.collaborators()
    }

    pub fn local(&self) -> CollaboratorPresence {
        lock(&self.shared.local).clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.topic
    }

    /// Detach from the session. No observer call happens after this returns.
    pub fn leave(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Close the gate first; waits for an in-flight observer call to finish.
        lock(&self.shared.observer).take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // The aborted task may still be mid-reply; the sender lock orders that
        // reply before the Leave, and nothing can be sent after it.
        if self.shared.depart() {
            log::info!("Left presence on topic {}", self.shared.topic);
        }
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;
    use tokio::time::{sleep, Duration};

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_color_is_deterministic() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(Color::for_user(id), Color::for_user(id));
        assert!(PALETTE.contains(&Color::for_user(id)));
    }

    #[test]
    fn test_colors_spread_over_palette() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(Color::for_user(Uuid::new_v4()));
        }
        assert!(seen.len() > PALETTE.len() / 2);
    }

    #[test]
    fn test_color_hex() {
        assert_eq!(Color::rgb(0xff, 0x00, 0x80).to_hex(), "#ff0080");
    }

    #[test]
    fn test_presence_defaults() {
        let id = Uuid::new_v4();
        let p = CollaboratorPresence::new(id, "Ada").with_avatar("avatars/ada.png");
        assert_eq!(p.color, Color::for_user(id));
        assert_eq!(p.avatar_ref.as_deref(), Some("avatars/ada.png"));
        assert!(p.cursor.is_none());
        assert!(p.selected_element_id.is_none());
    }

    #[tokio::test]
    async fn test_two_registries_see_each_other() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = CollaboratorPresence::new(Uuid::new_v4(), "Alice");
        let bob = CollaboratorPresence::new(Uuid::new_v4(), "Bob");

        let a = PresenceRegistry::join(&hub, topic, alice.clone(), |_| {});
        let b = PresenceRegistry::join(&hub, topic, bob.clone(), |_| {});

        assert!(eventually(|| a.collaborators().len() == 1 && b.collaborators().len() == 1).await);
        assert_eq!(a.collaborators()[0].session_key, bob.session_key);
        assert_eq!(b.collaborators()[0].display_name, "Alice");
    }

    #[tokio::test]
    async fn test_cursor_update_resends_full_record() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = CollaboratorPresence::new(Uuid::new_v4(), "Alice").with_avatar("a.png");

        let a = PresenceRegistry::join(&hub, topic, alice, |_| {});
        let b = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "Bob"), |_| {});
        assert!(eventually(|| b.collaborators().len() == 1).await);

        a.update_cursor(40.0, 80.0);
        a.update_selection(Some("node-1"));
        assert!(eventually(|| {
            b.collaborators()
                .first()
                .map(|p| p.cursor == Some(Point::new(40.0, 80.0)) && p.selected_element_id.as_deref() == Some("node-1"))
                .unwrap_or(false)
        })
        .await);

        let seen = &b.collaborators()[0];
        assert_eq!(seen.avatar_ref.as_deref(), Some("a.png"));
        assert_eq!(seen.display_name, "Alice");

        a.update_selection(None);
        assert!(eventually(|| b.collaborators()[0].selected_element_id.is_none()).await);
    }

    #[tokio::test]
    async fn test_observer_never_sees_self() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let me = Uuid::new_v4();
        let saw_self = Arc::new(Mutex::new(false));
        let flag = saw_self.clone();

        let a = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(me, "Me"), move |view| {
            if view.iter().any(|p| p.session_key == me) {
                *flag.lock().unwrap() = true;
            }
        });
        let b = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "Other"), |_| {});
        assert!(eventually(|| a.collaborators().len() == 1).await);
        b.update_cursor(1.0, 1.0);
        a.update_cursor(2.0, 2.0);
        sleep(Duration::from_millis(50)).await;

        assert!(!*saw_self.lock().unwrap());
    }

    #[tokio::test]
    async fn test_leave_removes_from_others() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();

        let a = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "A"), |_| {});
        let b = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "B"), |_| {});
        assert!(eventually(|| a.collaborators().len() == 1).await);

        b.leave();
        assert!(eventually(|| a.collaborators().is_empty()).await);
    }

    #[tokio::test]
    async fn test_no_observer_calls_after_leave() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        let a = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "A"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let b = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "B"), |_| {});
        assert!(eventually(|| calls.load(Ordering::SeqCst) > 0).await);

        a.leave();
        let after_leave = calls.load(Ordering::SeqCst);
        for i in 0..10 {
            b.update_cursor(i as f64, 0.0);
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_leave);
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let a = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "A"), |_| {});
        let _b = PresenceRegistry::join(&hub, topic, CollaboratorPresence::new(Uuid::new_v4(), "B"), |_| {});
        assert!(eventually(|| a.collaborators().len() == 1).await);

        assert!(a.prune_idle(Duration::from_secs(60)).is_empty());
        sleep(Duration::from_millis(50)).await;
        let pruned = a.prune_idle(Duration::from_millis(1));
        assert_eq!(pruned.len(), 1);
        assert!(a.collaborators().is_empty());
    }
}
