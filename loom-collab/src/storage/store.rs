//! RocksDB-backed local store for the document registry and payloads.
//!
//! Column families:
//! - `registry`: the registry record (JSON map id → meta) and the legacy
//!   single-document record awaiting migration
//! - `payloads`: one record per document, `payload:<id>` → LZ4-compressed JSON
//!
//! Reads never fail: missing or corrupt records degrade to "absent" and are
//! logged. Writes return `Result` internally; the public save operations log
//! failures instead of surfacing them.

use loom_core::{DocumentMeta, DocumentPayload, Registry};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub(crate) const CF_REGISTRY: &str = "registry";
pub(crate) const CF_PAYLOADS: &str = "payloads";

const COLUMN_FAMILIES: &[&str] = &[CF_REGISTRY, CF_PAYLOADS];

const REGISTRY_KEY: &[u8] = b"registry";
pub(crate) const LEGACY_KEY: &[u8] = b"legacy:document";
const PAYLOAD_PREFIX: &str = "payload:";

/// Title given to a document recovered from the legacy single-document record.
pub const MIGRATED_TITLE: &str = "Migrated Graph";
/// Title given to documents created without one.
pub const DEFAULT_TITLE: &str = "Untitled Graph";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Advertised capacity used for usage reporting (default: 5 MiB)
    pub quota_bytes: u64,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("loom_data"),
            quota_bytes: 5 * 1024 * 1024,
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Invalid import: {0}")]
    InvalidImport(String),
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

/// Durable per-device store of the registry and document payloads.
///
/// The registry is one record, so every read-modify-write of it runs under
/// `registry_lock`. Plain reads take no lock.
pub struct LocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    registry_lock: Mutex<()>,
}

impl LocalStore {
    /// Open the store, creating it if missing, and migrate any legacy record.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self {
            db,
            config,
            registry_lock: Mutex::new(()),
        };
        if let Some(meta) = store.migrate_legacy() {
            log::info!("Migrated legacy document into {}", meta.id);
        }
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_REGISTRY => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_PAYLOADS => {
                // Values are already LZ4 frames
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    // ─── Registry ─────────────────────────────────────────────────────

    /// Current registry; empty when absent or unreadable.
    pub fn registry(&self) -> Registry {
        match self.read_registry() {
            Ok(Some(registry)) => registry,
            Ok(None) => Registry::new(),
            Err(e) => {
                log::warn!("Registry unreadable, treating as empty: {e}");
                Registry::new()
            }
        }
    }

    /// Replace the registry record. Failures are logged.
    pub fn save_registry(&self, registry: &Registry) {
        let _guard = self.lock_registry();
        if let Err(e) = self.write_registry(registry) {
            log::error!("Failed to save registry: {e}");
        }
    }

    /// All documents, most recently updated first.
    pub fn list(&self) -> Vec<DocumentMeta> {
        let mut metas: Vec<DocumentMeta> = self.registry().into_values().collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        metas
    }

    pub fn meta(&self, id: &str) -> Option<DocumentMeta> {
        self.registry().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry().contains_key(id)
    }

    fn read_registry(&self) -> Result<Option<Registry>, StoreError> {
        let cf = self.cf(CF_REGISTRY)?;
        match self.db.get_cf(cf, REGISTRY_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_registry(&self, registry: &Registry) -> Result<(), StoreError> {
        let cf = self.cf(CF_REGISTRY)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, REGISTRY_KEY, serde_json::to_vec(registry)?);
        self.write(batch)
    }

    // ─── Payloads ─────────────────────────────────────────────────────

    /// Stored payload for `id`; `None` when absent or unreadable.
    ///
    /// Edges whose endpoints are missing are dropped on read.
    pub fn payload(&self, id: &str) -> Option<DocumentPayload> {
        match self.read_payload(id) {
            Ok(Some(mut payload)) => {
                payload.prune_dangling_edges();
                Some(payload)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Payload for {id} unreadable: {e}");
                None
            }
        }
    }

    /// Write a payload and refresh the registry entry's counts and timestamp.
    ///
    /// Creates the registry entry when the document is not yet registered.
    /// Failures are logged.
    pub fn save_payload(&self, id: &str, payload: &DocumentPayload) {
        if let Err(e) = self.write_payload(id, payload, None) {
            log::error!("Failed to save payload for {id}: {e}");
        }
    }

    pub(crate) fn read_payload(&self, id: &str) -> Result<Option<DocumentPayload>, StoreError> {
        let cf = self.cf(CF_PAYLOADS)?;
        match self.db.get_cf(cf, Self::payload_key(id))? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(serde_json::from_slice(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Payload and registry entry in one atomic batch.
    ///
    /// `meta` seeds the entry when the document is new or is being replaced.
    pub(crate) fn write_payload(
        &self,
        id: &str,
        payload: &DocumentPayload,
        meta: Option<DocumentMeta>,
    ) -> Result<DocumentMeta, StoreError> {
        let _guard = self.lock_registry();
        self.write_payload_locked(id, payload, meta)
    }

    /// Caller holds `registry_lock`.
    fn write_payload_locked(
        &self,
        id: &str,
        payload: &DocumentPayload,
        meta: Option<DocumentMeta>,
    ) -> Result<DocumentMeta, StoreError> {
        let cf_registry = self.cf(CF_REGISTRY)?;
        let cf_payloads = self.cf(CF_PAYLOADS)?;

        let json = serde_json::to_vec(&payload.without_ui_state())?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut registry = self.registry();
        if let Some(meta) = meta {
            registry.insert(id.to_string(), meta);
        }
        let entry = registry
            .entry(id.to_string())
            .or_insert_with(|| DocumentMeta::new(id, DEFAULT_TITLE));
        entry.touch(payload);
        let meta = entry.clone();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_payloads, Self::payload_key(id), compressed);
        batch.put_cf(cf_registry, REGISTRY_KEY, serde_json::to_vec(&registry)?);
        self.write(batch)?;

        log::debug!(
            "Saved {id}: {} nodes, {} edges, {} bytes",
            meta.node_count,
            meta.edge_count,
            json.len()
        );
        Ok(meta)
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Register a new empty document and return its metadata.
    pub fn create(&self, title: Option<&str>) -> Result<DocumentMeta, StoreError> {
        let id = loom_core::new_id();
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);
        let meta = self.write_payload(&id, &DocumentPayload::default(), Some(DocumentMeta::new(&id, title)))?;
        log::info!("Created document {id} ({title})");
        Ok(meta)
    }

    /// Change a document's title. Returns `false` when it is not registered.
    pub fn rename(&self, id: &str, title: &str) -> Result<bool, StoreError> {
        let _guard = self.lock_registry();
        let mut registry = self.registry();
        let Some(meta) = registry.get_mut(id) else {
            return Ok(false);
        };
        meta.title = title.to_string();
        meta.updated_at = loom_core::now_millis().max(meta.created_at);
        self.write_registry(&registry)?;
        Ok(true)
    }

    /// Attach or clear a preview thumbnail.
    pub fn set_thumbnail(&self, id: &str, thumbnail: Option<String>) -> Result<bool, StoreError> {
        let _guard = self.lock_registry();
        let mut registry = self.registry();
        let Some(meta) = registry.get_mut(id) else {
            return Ok(false);
        };
        meta.thumbnail = thumbnail;
        self.write_registry(&registry)?;
        Ok(true)
    }

    /// Remove the registry entry and the payload together.
    ///
    /// Returns `false` when neither existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let cf_registry = self.cf(CF_REGISTRY)?;
        let cf_payloads = self.cf(CF_PAYLOADS)?;

        let _guard = self.lock_registry();
        let mut registry = self.registry();
        let had_entry = registry.remove(id).is_some();
        let key = Self::payload_key(id);
        let had_payload = self.db.get_pinned_cf(cf_payloads, &key)?.is_some();
        if !had_entry && !had_payload {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_payloads, &key);
        batch.put_cf(cf_registry, REGISTRY_KEY, serde_json::to_vec(&registry)?);
        self.write(batch)?;

        log::info!("Deleted document {id}");
        Ok(true)
    }

    // ─── Legacy migration ─────────────────────────────────────────────

    /// Fold the pre-registry single-document record into the registry.
    ///
    /// Runs only when the registry is empty and the legacy record exists.
    /// The legacy record is removed once migrated; an unparseable one is
    /// left in place.
    pub fn migrate_legacy(&self) -> Option<DocumentMeta> {
        let _guard = self.lock_registry();
        if !self.registry().is_empty() {
            return None;
        }
        let cf = self.cf(CF_REGISTRY).ok()?;
        let bytes = match self.db.get_cf(cf, LEGACY_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Legacy record unreadable: {e}");
                return None;
            }
        };

        let mut payload: DocumentPayload = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Legacy record is not a document, leaving it in place: {e}");
                return None;
            }
        };
        payload.prune_dangling_edges();

        let id = loom_core::new_id();
        let migrated = self
            .write_payload_locked(&id, &payload, Some(DocumentMeta::new(&id, MIGRATED_TITLE)))
            .and_then(|meta| {
                self.db.delete_cf(cf, LEGACY_KEY)?;
                Ok(meta)
            });
        match migrated {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::error!("Legacy migration failed: {e}");
                None
            }
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Total key and value bytes held in both column families.
    pub(crate) fn stored_bytes(&self) -> u64 {
        let mut total = 0u64;
        for name in COLUMN_FAMILIES {
            let Ok(cf) = self.cf(name) else { continue };
            for (key, value) in self.db.iterator_cf(cf, IteratorMode::Start).flatten() {
                total += (key.len() + value.len()) as u64;
            }
        }
        total
    }

    fn lock_registry(&self) -> MutexGuard<'_, ()> {
        self.registry_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    pub(crate) fn put_raw(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.put_cf(self.cf(cf)?, key, value)?;
        Ok(())
    }

    pub(crate) fn payload_key(id: &str) -> Vec<u8> {
        format!("{PAYLOAD_PREFIX}{id}").into_bytes()
    }
}
