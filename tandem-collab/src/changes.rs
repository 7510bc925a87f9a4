//! Best-effort fan-out of diagram change notifications.
//!
//! Events are full-state notifications, applied verbatim by receivers. A lost
//! or reordered event heals itself with the next one, so there is no ack, no
//! retry and no replay for late subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tandem_core::{DiagramState, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{MessageType, SyncMessage};
use crate::transport::{LinkEvent, LinkSender, Transport};

/// Kind of the canonical "replace the whole diagram" event.
pub const DIAGRAM_REPLACE: &str = "diagram.replace";

/// A change notification. Receivers apply `payload` as a full replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ChangeEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Full-state event carrying `state`.
    pub fn replace_diagram(state: &DiagramState) -> Result<Self, serde_json::Error> {
        Ok(Self::new(DIAGRAM_REPLACE, serde_json::to_value(state)?))
    }

    /// The carried state, if this is a well-formed [`DIAGRAM_REPLACE`] event.
    pub fn as_diagram_state(&self) -> Option<DiagramState> {
        if self.kind != DIAGRAM_REPLACE {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

type Handler = Box<dyn Fn(&ChangeEvent) + Send>;

/// A handler slot. `None` once unsubscribed; checked under lock before each call.
type Slot = Mutex<Option<Handler>>;

type Slots = Mutex<HashMap<u64, Arc<Slot>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dispatch(slots: &Slots, event: &ChangeEvent) {
    let current: Vec<Arc<Slot>> = lock(slots).values().cloned().collect();
    for slot in current {
        if let Some(handler) = lock(&slot).as_ref() {
            handler(event);
        }
    }
}

/// Handle of one `subscribe` call. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    slot: Arc<Slot>,
    slots: Weak<Slots>,
}

impl Subscription {
    /// Stop receiving events. No handler call happens after this returns.
    ///
    /// Must not be called from inside the handler itself.
    pub fn unsubscribe(self) {}

    fn detach(&mut self) {
        lock(&self.slot).take();
        if let Some(slots) = self.slots.upgrade() {
            lock(&slots).remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Publish/subscribe endpoint for change events on one session topic.
pub struct ChangeChannel {
    topic: Uuid,
    publisher: UserId,
    sender: LinkSender,
    slots: Arc<Slots>,
    next_id: AtomicU64,
    clock: AtomicU64,
    task: JoinHandle<()>,
}

impl ChangeChannel {
    /// Attach to `topic` as `publisher`.
    pub fn open<T>(transport: &T, topic: Uuid, publisher: UserId) -> Self
    where
        T: Transport + ?Sized,
    {
        let link = transport.open(topic);
        let slots: Arc<Slots> = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(Self::run(topic, slots.clone(), link.events));

        Self {
            topic,
            publisher,
            sender: link.sender,
            slots,
            next_id: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            task,
        }
    }

    async fn run(topic: Uuid, slots: Arc<Slots>, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            let LinkEvent::Frame(bytes) = event else {
                continue;
            };
            let msg = match SyncMessage::decode(&bytes) {
                Ok(msg) if msg.msg_type == MessageType::Change && msg.topic == topic => msg,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Undecodable frame on topic {topic}: {e}");
                    continue;
                }
            };
            match msg.change_event() {
                Ok(change) => {
                    log::trace!("Change '{}' from {} on topic {topic}", change.kind, msg.sender);
                    dispatch(&slots, &change);
                }
                Err(e) => log::warn!("Dropping malformed change on topic {topic}: {e}"),
            }
        }
    }

    /// Send `event` to every peer currently subscribed. Fire-and-forget.
    pub fn publish(&self, event: &ChangeEvent) {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        match SyncMessage::change(self.publisher, self.topic, clock, event).and_then(|m| m.encode()) {
            Ok(bytes) => {
                if !self.sender.send(bytes) {
                    log::debug!("Change '{}' not sent on topic {}", event.kind, self.topic);
                }
            }
            Err(e) => log::warn!("Failed to encode change '{}': {e}", event.kind),
        }
    }

    /// Invoke `handler` once per event received from other publishers.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: Arc<Slot> = Arc::new(Mutex::new(Some(Box::new(handler))));
        lock(&self.slots).insert(id, slot.clone());
        Subscription {
            id,
            slot,
            slots: Arc::downgrade(&self.slots),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn topic(&self) -> Uuid {
        self.topic
    }

    /// Detach from the topic and silence every handler.
    pub fn close(self) {}
}

impl Drop for ChangeChannel {
    fn drop(&mut self) {
        self.task.abort();
        let slots: Vec<Arc<Slot>> = lock(&self.slots).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            lock(&slot).take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;
    use serde_json::json;
    use tandem_core::{Edge, Node, Point};
    use tokio::time::{sleep, timeout, Duration};

    fn collecting(channel: &ChangeChannel) -> (Subscription, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = channel.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    /// Give both links time to attach before publishing.
    async fn settle() {
        sleep(Duration::from_millis(30)).await;
    }

    #[test]
    fn test_replace_diagram_event() {
        let state = DiagramState::new(
            vec![Node::new("a", "box", Point::new(1.0, 2.0))],
            vec![Edge::new("e", "a", "a")],
            Default::default(),
        );
        let event = ChangeEvent::replace_diagram(&state).unwrap();
        assert_eq!(event.kind, DIAGRAM_REPLACE);
        assert_eq!(event.as_diagram_state(), Some(state));
    }

    #[test]
    fn test_other_kinds_are_not_diagram_state() {
        let event = ChangeEvent::new("comment.added", json!({ "text": "hi" }));
        assert!(event.as_diagram_state().is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let bob = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let (_sub, mut rx) = collecting(&bob);
        settle().await;

        let event = ChangeEvent::new("node.moved", json!({ "id": "n1", "x": 10 }));
        alice.publish(&event);

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(event));
    }

    #[tokio::test]
    async fn test_publisher_does_not_hear_itself() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let _bob = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let (_sub, mut rx) = collecting(&alice);
        settle().await;

        alice.publish(&ChangeEvent::new("x", Value::Null));
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let _early = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        settle().await;
        alice.publish(&ChangeEvent::new("before", Value::Null));
        settle().await;

        let late = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let (_sub, mut rx) = collecting(&late);
        settle().await;
        alice.publish(&ChangeEvent::new("after", Value::Null));

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.kind, "after");
    }

    #[tokio::test]
    async fn test_single_publisher_order_preserved() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let bob = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let (_sub, mut rx) = collecting(&bob);
        settle().await;

        for i in 0..20 {
            alice.publish(&ChangeEvent::new("tick", json!(i)));
        }
        for i in 0..20 {
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(got.payload, json!(i));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let bob = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let (sub, mut rx) = collecting(&bob);
        let (_kept, mut kept_rx) = collecting(&bob);
        settle().await;
        assert_eq!(bob.subscriber_count(), 2);

        sub.unsubscribe();
        assert_eq!(bob.subscriber_count(), 1);
        alice.publish(&ChangeEvent::new("x", Value::Null));

        assert!(timeout(Duration::from_secs(1), kept_rx.recv()).await.unwrap().is_some());
        // Sender side of the dropped handler is gone: channel reports closed
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_silences_handlers() {
        let hub = LocalHub::default();
        let topic = Uuid::new_v4();
        let alice = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let bob = ChangeChannel::open(&hub, topic, Uuid::new_v4());
        let (sub, mut rx) = collecting(&bob);
        settle().await;

        bob.close();
        alice.publish(&ChangeEvent::new("x", Value::Null));
        assert!(rx.recv().await.is_none());
        drop(sub);
    }
}
