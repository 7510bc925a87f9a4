//! RocksDB-backed diagram and checkpoint store.
//!
//! Column families:
//! - `diagrams`:      live diagram rows, keyed by diagram id
//! - `versions`:      checkpoints, keyed by `diagram_id:16 ‖ version_number:4 (BE)`
//! - `version_index`: version id → `versions` key
//!
//! Values are JSON, LZ4 compressed with a size prefix. Big-endian version
//! numbers make the newest checkpoint of a diagram the last key of its prefix.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tandem_core::{Diagram, DiagramState};
use uuid::Uuid;

use super::StoreError;
use crate::versions::{DiagramStorage, DiagramVersion, VersionRepository};

const CF_DIAGRAMS: &str = "diagrams";
const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";

const COLUMN_FAMILIES: &[&str] = &[CF_DIAGRAMS, CF_VERSIONS, CF_VERSION_INDEX];

const VERSION_KEY_LEN: usize = 20;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// RocksDB-backed diagram store.
///
/// Reads go straight to RocksDB. Writes are serialized by `write_lock` so
/// that "check the version key is free, then insert" is atomic across threads.
pub struct DiagramStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl DiagramStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened diagram store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DIAGRAMS => {
                // Overwritten on every restore, read on every checkpoint
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-only, range-scanned per diagram
                opts.set_max_write_buffer_number(4);
            }
            CF_VERSION_INDEX => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Diagrams ─────────────────────────────────────────────────────

    /// Insert or replace a live diagram row.
    pub fn put_diagram(&self, diagram: &Diagram) -> Result<(), StoreError> {
        let cf = self.cf(CF_DIAGRAMS)?;
        let value = encode(diagram)?;
        let _guard = self.lock();
        self.db
            .put_cf_opt(cf, diagram.id.as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    pub fn get_diagram(&self, id: Uuid) -> Result<Option<Diagram>, StoreError> {
        let cf = self.cf(CF_DIAGRAMS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn diagram_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DIAGRAMS)?;
        Ok(self.db.get_cf(cf, id.as_bytes())?.is_some())
    }

    /// All diagram ids in the store.
    pub fn list_diagrams(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_DIAGRAMS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    /// Force a memtable flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn version_key(diagram_id: Uuid, version_number: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(VERSION_KEY_LEN);
        key.extend_from_slice(diagram_id.as_bytes());
        key.extend_from_slice(&version_number.to_be_bytes());
        key
    }

    /// Version number of a `versions` key belonging to `diagram_id`.
    fn key_version(key: &[u8], diagram_id: Uuid) -> Option<u32> {
        if key.len() != VERSION_KEY_LEN || &key[..16] != diagram_id.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&key[16..]);
        Some(u32::from_be_bytes(buf))
    }

    /// Versions of one diagram, highest number first.
    fn versions_desc(
        &self,
        diagram_id: Uuid,
        limit: usize,
    ) -> Result<Vec<(u32, Box<[u8]>)>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let start = Self::version_key(diagram_id, u32::MAX);
        let mut rows = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse))
        {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = item?;
            match Self::key_version(&key, diagram_id) {
                Some(number) => rows.push((number, value)),
                None => break,
            }
        }
        Ok(rows)
    }
}

impl DiagramStorage for DiagramStore {
    fn read_diagram(&self, id: Uuid) -> Result<Option<DiagramState>, StoreError> {
        Ok(self.get_diagram(id)?.map(|d| d.state))
    }

    fn write_diagram(&self, id: Uuid, state: &DiagramState) -> Result<(), StoreError> {
        let cf = self.cf(CF_DIAGRAMS)?;
        let _guard = self.lock();
        let mut diagram = self.get_diagram(id)?.ok_or(StoreError::NotFound(id))?;
        diagram.replace_state(state.clone());
        self.db
            .put_cf_opt(cf, id.as_bytes(), encode(&diagram)?, &self.write_options())?;
        Ok(())
    }
}

impl VersionRepository for DiagramStore {
    fn latest_version_number(&self, diagram_id: Uuid) -> Result<u32, StoreError> {
        Ok(self
            .versions_desc(diagram_id, 1)?
            .first()
            .map(|(number, _)| *number)
            .unwrap_or(0))
    }

    fn insert_version(&self, version: &DiagramVersion) -> Result<(), StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let key = Self::version_key(version.diagram_id, version.version_number);
        let value = encode(version)?;

        let _guard = self.lock();
        if self.db.get_cf(cf_versions, &key)?.is_some() {
            return Err(StoreError::Conflict {
                diagram_id: version.diagram_id,
                version_number: version.version_number,
            });
        }

        // Atomic batch write: checkpoint + index
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, &key, &value);
        batch.put_cf(cf_index, version.id.as_bytes(), &key);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn list_versions(
        &self,
        diagram_id: Uuid,
        limit: usize,
    ) -> Result<Vec<DiagramVersion>, StoreError> {
        self.versions_desc(diagram_id, limit)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn get_version(&self, version_id: Uuid) -> Result<Option<DiagramVersion>, StoreError> {
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let Some(key) = self.db.get_cf(cf_index, version_id.as_bytes())? else {
            return Ok(None);
        };
        let cf_versions = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(cf_versions, &key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => {
                log::warn!("Dangling index entry for version {version_id}");
                Ok(None)
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value)?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::{now_millis, Edge, Node, Point, Viewport};
    use tempfile::TempDir;

    fn open() -> (DiagramStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiagramStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    fn version(diagram_id: Uuid, number: u32) -> DiagramVersion {
        DiagramVersion {
            id: Uuid::new_v4(),
            diagram_id,
            version_number: number,
            message: format!("Version {number}"),
            nodes: vec![Node::new(format!("n{number}"), "box", Point::new(number as f64, 0.0))],
            edges: Vec::new(),
            viewport: Viewport::default(),
            created_by: Uuid::new_v4(),
            created_at: now_millis(),
        }
    }

    #[test]
    fn test_store_open() {
        let (store, dir) = open();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_diagrams().unwrap().is_empty());
    }

    #[test]
    fn test_diagram_put_get() {
        let (store, _dir) = open();
        let state = DiagramState::new(
            vec![Node::new("a", "service", Point::new(1.0, 2.0)).with_data(json!({ "tier": 1 }))],
            vec![Edge::new("e", "a", "a").with_label("self")],
            Viewport { x: 3.0, y: 4.0, zoom: 2.0 },
        );
        let diagram = Diagram::with_state("Architecture", state);

        store.put_diagram(&diagram).unwrap();
        assert!(store.diagram_exists(diagram.id).unwrap());
        assert_eq!(store.get_diagram(diagram.id).unwrap(), Some(diagram.clone()));
        assert_eq!(store.read_diagram(diagram.id).unwrap(), Some(diagram.state));
        assert!(store.get_diagram(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_write_diagram_overwrites_state() {
        let (store, _dir) = open();
        let diagram = Diagram::new("Empty");
        store.put_diagram(&diagram).unwrap();

        let state = DiagramState::new(
            vec![Node::new("x", "box", Point::default())],
            Vec::new(),
            Viewport::default(),
        );
        store.write_diagram(diagram.id, &state).unwrap();

        let stored = store.get_diagram(diagram.id).unwrap().unwrap();
        assert_eq!(stored.state, state);
        assert_eq!(stored.name, "Empty");
    }

    #[test]
    fn test_write_missing_diagram() {
        let (store, _dir) = open();
        let err = store
            .write_diagram(Uuid::new_v4(), &DiagramState::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_version_insert_and_lookup() {
        let (store, _dir) = open();
        let v = version(Uuid::new_v4(), 1);
        store.insert_version(&v).unwrap();

        assert_eq!(store.get_version(v.id).unwrap(), Some(v.clone()));
        assert_eq!(store.latest_version_number(v.diagram_id).unwrap(), 1);
        assert!(store.get_version(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_version_conflict() {
        let (store, _dir) = open();
        let diagram = Uuid::new_v4();
        let first = version(diagram, 1);
        store.insert_version(&first).unwrap();

        let dup = version(diagram, 1);
        let err = store.insert_version(&dup).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { version_number: 1, .. }));
        // The losing row left no index entry behind
        assert!(store.get_version(dup.id).unwrap().is_none());
        assert_eq!(store.get_version(first.id).unwrap(), Some(first));
    }

    #[test]
    fn test_versions_listed_newest_first_per_diagram() {
        let (store, _dir) = open();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        // Numbers past 255 check big-endian ordering
        for n in [1, 2, 3, 255, 256, 1000] {
            store.insert_version(&version(a, n)).unwrap();
        }
        for n in 1..=4 {
            store.insert_version(&version(b, n)).unwrap();
        }

        let numbers: Vec<u32> = store
            .list_versions(a, 50)
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, [1000, 256, 255, 3, 2, 1]);
        assert_eq!(store.latest_version_number(a).unwrap(), 1000);
        assert_eq!(store.latest_version_number(b).unwrap(), 4);
        assert_eq!(store.latest_version_number(Uuid::new_v4()).unwrap(), 0);

        assert_eq!(store.list_versions(b, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        let diagram = Diagram::new("Persistent");
        let v = version(diagram.id, 1);

        {
            let store = DiagramStore::open(config.clone()).unwrap();
            store.put_diagram(&diagram).unwrap();
            store.insert_version(&v).unwrap();
            store.sync().unwrap();
        }

        let store = DiagramStore::open(config).unwrap();
        assert_eq!(store.get_diagram(diagram.id).unwrap(), Some(diagram));
        assert_eq!(store.get_version(v.id).unwrap(), Some(v));
        assert_eq!(store.list_diagrams().unwrap().len(), 1);
    }

    #[test]
    fn test_values_are_compressed() {
        let (store, _dir) = open();
        let nodes: Vec<Node> = (0..500)
            .map(|i| Node::new(format!("node-{i}"), "service", Point::new(0.0, 0.0)))
            .collect();
        let diagram = Diagram::with_state(
            "Big",
            DiagramState::new(nodes, Vec::new(), Viewport::default()),
        );
        store.put_diagram(&diagram).unwrap();

        let raw = store
            .db
            .get_cf(store.cf(CF_DIAGRAMS).unwrap(), diagram.id.as_bytes())
            .unwrap()
            .unwrap();
        let json_len = serde_json::to_vec(&diagram).unwrap().len();
        assert!(raw.len() * 2 < json_len, "{} vs {json_len}", raw.len());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
