//! Local persistence for documents.
//!
//! ```text
//! ┌─────────────┐  save/load   ┌────────────────────────────────────┐
//! │ SyncSession │ ───────────► │ LocalStore (RocksDB)               │
//! │ SyncServer  │              │  CF "registry": id → meta (JSON)  │
//! └─────────────┘              │  CF "payloads": payload:<id> (LZ4)│
//!                              └────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod store;

pub use catalog::{ExportEnvelope, ExportedDocument, StorageUsage, EXPORT_VERSION};
pub use store::{LocalStore, StoreConfig, StoreError, DEFAULT_TITLE, MIGRATED_TITLE};
