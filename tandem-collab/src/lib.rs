//! # tandem-collab: Collaborative editing layer for Tandem diagrams
//!
//! Lets several users edit one diagram at the same time: who is here and
//! where they point, what just changed, local undo/redo, and numbered
//! server-side checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                      ┌──────────────────┐
//! │ PresenceRegistry │                      │ VersionService   │
//! │ ChangeChannel    │                      │ (HTTP: http.rs)  │
//! └────────┬─────────┘                      └────────┬─────────┘
//!          │ TopicLink                               │
//!          ▼                                         ▼
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ WsTransport      │ ◄────────────────► │ RelayServer      │
//! │ LocalHub         │    SyncMessage     │ (BroadcastGroup) │
//! └──────────────────┘                    └──────────────────┘
//!                                                  DiagramStore (RocksDB)
//! HistoryManager: client-local, no I/O
//! ```
//!
//! Nothing is merged: presence records, change events and restores all
//! replace what came before, and the last writer wins.
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire envelope (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: Topic-scoped fan-out with backpressure
//! - [`transport`]: Transport seam and the in-process hub
//! - [`server`] / [`client`]: WebSocket relay and reconnecting transport
//! - [`presence`]: Collaborator presence registry
//! - [`changes`]: Change event channel
//! - [`history`]: Bounded undo/redo
//! - [`versions`] / [`storage`]: Checkpoints and their persistence
//! - [`http`]: Version endpoints
//! - [`config`]: Environment configuration

pub mod broadcast;
pub mod changes;
pub mod client;
pub mod config;
pub mod history;
pub mod http;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transport;
pub mod versions;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use changes::{ChangeChannel, ChangeEvent, Subscription};
pub use client::{ClientConfig, WsTransport};
pub use config::{Config, ConfigError};
pub use history::{HistoryConfig, HistoryEntry, HistoryManager};
pub use http::{version_routes, ApiError};
pub use presence::{CollaboratorPresence, Color, PresenceRegistry};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use storage::{DiagramStore, InMemoryStore, StoreConfig, StoreError};
pub use transport::{LinkEvent, LocalHub, TopicLink, Transport};
pub use versions::{
    DiagramStorage, DiagramVersion, VersionError, VersionRepository, VersionService,
    VersionSummary,
};
