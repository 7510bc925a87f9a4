//! Numbered, immutable checkpoints of a diagram, and restoring them.
//!
//! For one diagram, version numbers start at 1 and grow by one per
//! checkpoint with no gaps. Two concurrent creations race on
//! `(diagram_id, version_number)`: the storage engine rejects the second
//! insert with [`StoreError::Conflict`] and the service retries it with the
//! next number.
//!
//! A restore is a destructive full replace of the live diagram. It never
//! touches the checkpoints themselves.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{now_millis, DiagramState, Edge, Node, UserId, Viewport};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;

/// Most checkpoints returned by a listing.
pub const LIST_LIMIT: usize = 50;

/// Default bound on conflicting inserts before giving up.
pub const DEFAULT_MAX_INSERT_ATTEMPTS: usize = 16;

/// An immutable checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramVersion {
    pub id: Uuid,
    pub diagram_id: Uuid,
    /// Unique per diagram.
    pub version_number: u32,
    pub message: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub viewport: Viewport,
    pub created_by: UserId,
    /// Milliseconds since epoch.
    pub created_at: u64,
}

impl DiagramVersion {
    /// The captured diagram content.
    pub fn state(&self) -> DiagramState {
        DiagramState::new(self.nodes.clone(), self.edges.clone(), self.viewport)
    }

    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            version_number: self.version_number,
            message: self.message.clone(),
            created_by: self.created_by,
            created_at: self.created_at,
        }
    }
}

/// Listing row: a checkpoint without its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: Uuid,
    pub version_number: u32,
    pub message: String,
    pub created_by: UserId,
    pub created_at: u64,
}

/// Access to the live diagram rows.
pub trait DiagramStorage: Send + Sync {
    /// `None` if the diagram does not exist.
    fn read_diagram(&self, id: Uuid) -> Result<Option<DiagramState>, StoreError>;

    /// Overwrite nodes, edges and viewport. `NotFound` if the diagram does not exist.
    fn write_diagram(&self, id: Uuid, state: &DiagramState) -> Result<(), StoreError>;
}

/// Checkpoint persistence. Every write is a single atomic insert.
pub trait VersionRepository: Send + Sync {
    /// Highest version number of the diagram, 0 when it has none.
    fn latest_version_number(&self, diagram_id: Uuid) -> Result<u32, StoreError>;

    /// Insert a checkpoint. `Conflict` if its `(diagram_id, version_number)` is taken.
    fn insert_version(&self, version: &DiagramVersion) -> Result<(), StoreError>;

    /// Up to `limit` checkpoints, highest version number first.
    fn list_versions(&self, diagram_id: Uuid, limit: usize)
        -> Result<Vec<DiagramVersion>, StoreError>;

    fn get_version(&self, version_id: Uuid) -> Result<Option<DiagramVersion>, StoreError>;
}

#[derive(Debug, Clone, Error)]
pub enum VersionError {
    #[error("diagram {0} not found")]
    DiagramNotFound(Uuid),
    #[error("version {0} not found")]
    VersionNotFound(Uuid),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl VersionError {
    /// Storage failures may succeed when retried; missing rows will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VersionError::Storage(_))
    }
}

/// Default checkpoint message: `"Version {n}"`.
pub fn default_message(version_number: u32) -> String {
    format!("Version {version_number}")
}

/// Checkpoint operations over a diagram store and a version repository.
///
/// Stateless between calls; any number of requests may run concurrently.
pub struct VersionService {
    diagrams: Arc<dyn DiagramStorage>,
    versions: Arc<dyn VersionRepository>,
    max_insert_attempts: usize,
}

impl VersionService {
    pub fn new(diagrams: Arc<dyn DiagramStorage>, versions: Arc<dyn VersionRepository>) -> Self {
        Self {
            diagrams,
            versions,
            max_insert_attempts: DEFAULT_MAX_INSERT_ATTEMPTS,
        }
    }

    /// Service over one engine that stores both diagrams and versions.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: DiagramStorage + VersionRepository + 'static,
    {
        Self::new(store.clone(), store)
    }

    pub fn with_max_insert_attempts(mut self, attempts: usize) -> Self {
        self.max_insert_attempts = attempts.max(1);
        self
    }

    /// The [`LIST_LIMIT`] most recent checkpoints of a diagram, newest first.
    pub async fn list_versions(&self, diagram_id: Uuid) -> Result<Vec<VersionSummary>, VersionError> {
        let versions = self.versions.clone();
        let rows = blocking(move || versions.list_versions(diagram_id, LIST_LIMIT)).await?;
        Ok(rows.iter().map(DiagramVersion::summary).collect())
    }

    /// Checkpoint the current server-side state of a diagram.
    ///
    /// A missing or blank `message` becomes `"Version {n}"`.
    pub async fn create_version(
        &self,
        diagram_id: Uuid,
        message: Option<String>,
        created_by: UserId,
    ) -> Result<DiagramVersion, VersionError> {
        let diagrams = self.diagrams.clone();
        let state = blocking(move || diagrams.read_diagram(diagram_id))
            .await?
            .ok_or(VersionError::DiagramNotFound(diagram_id))?;
        let message = message.filter(|m| !m.trim().is_empty());

        let mut last_conflict = None;
        for attempt in 1..=self.max_insert_attempts {
            let versions = self.versions.clone();
            let latest = blocking(move || versions.latest_version_number(diagram_id)).await?;
            let version_number = latest + 1;

            let version = DiagramVersion {
                id: Uuid::new_v4(),
                diagram_id,
                version_number,
                message: message
                    .clone()
                    .unwrap_or_else(|| default_message(version_number)),
                nodes: state.nodes.clone(),
                edges: state.edges.clone(),
                viewport: state.viewport,
                created_by,
                created_at: now_millis(),
            };

            let versions = self.versions.clone();
            let row = version.clone();
            match blocking(move || versions.insert_version(&row)).await {
                Ok(()) => {
                    log::info!(
                        "Created version {version_number} of diagram {diagram_id} ({})",
                        version.id
                    );
                    return Ok(version);
                }
                Err(VersionError::Storage(err @ StoreError::Conflict { .. })) => {
                    log::debug!(
                        "Version {version_number} of diagram {diagram_id} taken, retrying (attempt {attempt})"
                    );
                    last_conflict = Some(err);
                }
                Err(e) => {
                    log::error!("Failed to store version of diagram {diagram_id}: {e}");
                    return Err(e);
                }
            }
        }

        log::error!(
            "Gave up creating a version of diagram {diagram_id} after {} conflicts",
            self.max_insert_attempts
        );
        Err(VersionError::Storage(last_conflict.unwrap_or(StoreError::Conflict {
            diagram_id,
            version_number: 0,
        })))
    }

    /// Overwrite the live diagram with a checkpoint. Returns the diagram id.
    pub async fn restore_version(&self, version_id: Uuid) -> Result<Uuid, VersionError> {
        let versions = self.versions.clone();
        let version = blocking(move || versions.get_version(version_id))
            .await?
            .ok_or(VersionError::VersionNotFound(version_id))?;
        let diagram_id = version.diagram_id;

        let diagrams = self.diagrams.clone();
        let state = version.state();
        match blocking(move || diagrams.write_diagram(diagram_id, &state)).await {
            Ok(()) => {
                log::info!(
                    "Restored diagram {diagram_id} to version {}",
                    version.version_number
                );
                Ok(diagram_id)
            }
            Err(VersionError::Storage(StoreError::NotFound(_))) => {
                Err(VersionError::DiagramNotFound(diagram_id))
            }
            Err(e) => {
                log::error!("Failed to restore diagram {diagram_id}: {e}");
                Err(e)
            }
        }
    }
}

/// Run a storage call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, VersionError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(VersionError::from),
        Err(e) => Err(VersionError::Storage(StoreError::Io(format!(
            "storage task failed: {e}"
        )))),
    }
}
