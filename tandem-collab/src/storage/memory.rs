//! Volatile store with the same semantics as the RocksDB engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tandem_core::{Diagram, DiagramState};
use uuid::Uuid;

use super::StoreError;
use crate::versions::{DiagramStorage, DiagramVersion, VersionRepository};

#[derive(Default)]
struct Versions {
    /// Ordered by `(diagram_id, version_number)`, like the RocksDB key layout.
    by_number: BTreeMap<(Uuid, u32), DiagramVersion>,
    by_id: HashMap<Uuid, (Uuid, u32)>,
}

/// In-memory diagram and checkpoint store.
#[derive(Default)]
pub struct InMemoryStore {
    diagrams: RwLock<HashMap<Uuid, Diagram>>,
    versions: RwLock<Versions>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a live diagram row.
    pub fn put_diagram(&self, diagram: Diagram) {
        write(&self.diagrams).insert(diagram.id, diagram);
    }

    pub fn get_diagram(&self, id: Uuid) -> Option<Diagram> {
        read(&self.diagrams).get(&id).cloned()
    }

    pub fn version_count(&self) -> usize {
        read(&self.versions).by_id.len()
    }
}

impl DiagramStorage for InMemoryStore {
    fn read_diagram(&self, id: Uuid) -> Result<Option<DiagramState>, StoreError> {
        Ok(read(&self.diagrams).get(&id).map(|d| d.state.clone()))
    }

    fn write_diagram(&self, id: Uuid, state: &DiagramState) -> Result<(), StoreError> {
        match write(&self.diagrams).get_mut(&id) {
            Some(diagram) => {
                diagram.replace_state(state.clone());
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }
}

impl VersionRepository for InMemoryStore {
    fn latest_version_number(&self, diagram_id: Uuid) -> Result<u32, StoreError> {
        let versions = read(&self.versions);
        Ok(versions
            .by_number
            .range((diagram_id, 0)..=(diagram_id, u32::MAX))
            .next_back()
            .map(|(&(_, number), _)| number)
            .unwrap_or(0))
    }

    fn insert_version(&self, version: &DiagramVersion) -> Result<(), StoreError> {
        let key = (version.diagram_id, version.version_number);
        let mut versions = write(&self.versions);
        if versions.by_number.contains_key(&key) {
            return Err(StoreError::Conflict {
                diagram_id: version.diagram_id,
                version_number: version.version_number,
            });
        }
        versions.by_number.insert(key, version.clone());
        versions.by_id.insert(version.id, key);
        Ok(())
    }

    fn list_versions(
        &self,
        diagram_id: Uuid,
        limit: usize,
    ) -> Result<Vec<DiagramVersion>, StoreError> {
        let versions = read(&self.versions);
        Ok(versions
            .by_number
            .range((diagram_id, 0)..=(diagram_id, u32::MAX))
            .rev()
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn get_version(&self, version_id: Uuid) -> Result<Option<DiagramVersion>, StoreError> {
        let versions = read(&self.versions);
        Ok(versions
            .by_id
            .get(&version_id)
            .and_then(|key| versions.by_number.get(key))
            .cloned())
    }
}
