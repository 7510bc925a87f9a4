//! Persistence for live diagrams and their checkpoints.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  read/write   ┌──────────────────────────────────────┐
//! │ VersionService │ ────────────► │ DiagramStore (RocksDB)               │
//! │ (async)        │               │ CF "diagrams"      : live rows        │
//! └────────────────┘               │ CF "versions"      : checkpoints      │
//!         │                        │ CF "version_index" : id → checkpoint  │
//!         │ tests / embedding      └──────────────────────────────────────┘
//!         ▼
//! ┌────────────────┐
//! │ InMemoryStore  │
//! └────────────────┘
//! ```
//!
//! Both engines implement [`crate::versions::DiagramStorage`] and
//! [`crate::versions::VersionRepository`] with identical semantics.

pub mod memory;
pub mod rocks;

pub use memory::InMemoryStore;
pub use rocks::{DiagramStore, StoreConfig};

use thiserror::Error;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(Uuid),
    /// `(diagram_id, version_number)` is already taken.
    #[error("version {version_number} of diagram {diagram_id} already exists")]
    Conflict {
        diagram_id: Uuid,
        version_number: u32,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));

        let err = StoreError::Conflict {
            diagram_id: Uuid::nil(),
            version_number: 3,
        };
        assert!(err.to_string().contains("version 3"));

        let err = StoreError::Database("test".into());
        assert!(err.to_string().contains("database error"));
    }

    #[test]
    fn test_json_error_converts() {
        let err: StoreError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
